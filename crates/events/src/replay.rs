//! Deterministic state reconstruction from an event history.
//!
//! Replay folds a stream through one applicator per [`EventType`], starting from
//! empty state. The fold is pure: the same history always produces the same
//! state, and no applicator removes data (deletion only sets a flag).
//!
//! ## Forward compatibility
//!
//! Rows whose `event_type` this build does not know (written by a newer schema)
//! are skipped, not rejected. Replay of a mixed history therefore still succeeds
//! and reflects every event this build understands.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::event::{EventType, StoredEvent};

/// Replayed aggregate state: a JSON object built by folding events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateState(Map<String, JsonValue>);

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// `true` when no event has been applied (the aggregate does not exist).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.0.get("deleted"), Some(JsonValue::Bool(true)))
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, JsonValue> {
        self.0
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl From<Map<String, JsonValue>> for AggregateState {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The event type is not known to this build.
    UnknownType,
    /// The payload does not have the shape the applicator needs.
    MalformedPayload,
}

/// Outcome of folding a single event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Skipped(SkipReason),
}

/// Fold one event into `state`.
pub fn apply_event(state: &mut AggregateState, event: &StoredEvent) -> Applied {
    let Some(kind) = event.kind() else {
        debug!(
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            sequence_number = event.sequence_number,
            "skipping unknown event type during replay"
        );
        return Applied::Skipped(SkipReason::UnknownType);
    };

    let applied = match kind {
        EventType::ProductCreated => match &event.payload {
            JsonValue::Object(fields) => {
                for (k, v) in fields {
                    state.0.insert(k.clone(), v.clone());
                }
                true
            }
            _ => false,
        },
        EventType::ProductUpdated => {
            let field = event.payload.get("field").and_then(JsonValue::as_str);
            match (field, event.payload.get("value")) {
                (Some(field), Some(value)) => {
                    state.0.insert(field.to_string(), value.clone());
                    true
                }
                _ => false,
            }
        }
        EventType::PriceChanged => match event.payload.get("new_price") {
            Some(price) => {
                state.0.insert("price".to_string(), price.clone());
                true
            }
            None => false,
        },
        EventType::ProductDeleted => {
            state.0.insert("deleted".to_string(), JsonValue::Bool(true));
            true
        }
    };

    if applied {
        Applied::Applied
    } else {
        debug!(
            aggregate_id = %event.aggregate_id,
            event_type = %kind,
            sequence_number = event.sequence_number,
            "skipping event with malformed payload during replay"
        );
        Applied::Skipped(SkipReason::MalformedPayload)
    }
}

/// Rebuild state from an event history.
///
/// Events are ordered by `sequence_number` before folding, so callers may pass a
/// history in any order.
pub fn replay<'a, I>(events: I) -> AggregateState
where
    I: IntoIterator<Item = &'a StoredEvent>,
{
    let mut ordered: Vec<&StoredEvent> = events.into_iter().collect();
    ordered.sort_by_key(|e| e.sequence_number);

    let mut state = AggregateState::new();
    for event in ordered {
        apply_event(&mut state, event);
    }
    state
}
