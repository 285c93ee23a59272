use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use atelier_core::{AggregateId, ExpectedVersion};
use atelier_events::{StoredEvent, UncommittedEvent};

use super::r#trait::{EventStore, EventStoreError, validate_batch};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events across all streams.
    pub fn event_count(&self) -> usize {
        self.streams.read().values().map(Vec::len).sum()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.as_str();

        let mut streams = self.streams.write();
        let existing = streams.get(&aggregate_id).map(Vec::as_slice).unwrap_or_default();
        let current = Self::current_version(existing);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(first) = existing.first() {
            if first.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    first.aggregate_type, aggregate_type
                )));
            }
        }

        // Only a successful append creates the stream entry.
        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, seq)| e.into_stored(seq))
            .collect();
        streams.entry(aggregate_id).or_default().extend(committed.iter().cloned());

        Ok(committed)
    }

    async fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        Ok(self.streams.read().get(&aggregate_id).cloned().unwrap_or_default())
    }
}
