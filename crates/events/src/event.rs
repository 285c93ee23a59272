use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use atelier_core::{AggregateId, AggregateType, CorrelationId, UserId};

/// Closed set of event types the engine writes.
///
/// Every place that reacts to events matches on this enum exhaustively, so a
/// new variant fails to compile until each applicator and projection handles it.
/// Events read back from storage keep their raw type string (see
/// [`StoredEvent::kind`]) so rows written by a newer schema are skipped, not
/// rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A product was created; the payload carries the full initial state.
    #[serde(rename = "product.created")]
    ProductCreated,
    /// A single product field changed (`{ "field": .., "value": .. }`).
    #[serde(rename = "product.updated")]
    ProductUpdated,
    /// The product price changed (`{ "old_price": .., "new_price": .. }`).
    #[serde(rename = "product.price_changed")]
    PriceChanged,
    /// The product was soft-deleted.
    #[serde(rename = "product.deleted")]
    ProductDeleted,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::ProductCreated,
        EventType::ProductUpdated,
        EventType::PriceChanged,
        EventType::ProductDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProductCreated => "product.created",
            EventType::ProductUpdated => "product.updated",
            EventType::PriceChanged => "product.price_changed",
            EventType::ProductDeleted => "product.deleted",
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// A typed domain event payload.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type identifier.
    fn event_type(&self) -> EventType;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// The payload exactly as it is persisted and folded during replay.
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error>;
}

/// Who issued the command that produced an event, and which request it belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub user_id: Option<UserId>,
    pub correlation_id: CorrelationId,
}

impl EventMetadata {
    pub fn new(user_id: Option<UserId>, correlation_id: CorrelationId) -> Self {
        Self {
            user_id,
            correlation_id,
        }
    }
}

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Command handlers build these from typed events via [`UncommittedEvent::from_typed`].
/// The event store assigns the sequence number during append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub user_id: Option<UserId>,
    pub correlation_id: CorrelationId,
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed payload.
    ///
    /// The payload is serialized here, once. The resulting JSON value is owned by
    /// the event, so later changes to the caller's data cannot reach it.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        metadata: EventMetadata,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type(),
            aggregate_id,
            aggregate_type,
            event_version: event.version(),
            occurred_at: Utc::now(),
            payload: event.to_payload()?,
            user_id: metadata.user_id,
            correlation_id: metadata.correlation_id,
        })
    }

    /// Attach the stream position assigned by the store.
    pub fn into_stored(self, sequence_number: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            event_type: self.event_type.as_str().to_string(),
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type.as_str().to_string(),
            sequence_number,
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: self.payload,
            user_id: self.user_id,
            correlation_id: self.correlation_id,
        }
    }
}

/// A persisted event in an append-only stream.
///
/// ## Sequence numbers
///
/// - **Monotonically increasing** within one aggregate stream, starting at 1
/// - **Immutable**: once assigned, never changes
///
/// `event_type` and `aggregate_type` stay as the raw strings read from storage.
/// Use [`StoredEvent::kind`] to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream (the aggregate version after this event).
    pub sequence_number: u64,

    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub user_id: Option<UserId>,
    pub correlation_id: CorrelationId,
}

impl StoredEvent {
    /// The typed event kind, or `None` when written by a newer schema.
    pub fn kind(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }
}
