//! Append-only event store boundary.
//!
//! [`EventStore`] is the storage port; [`PublishingEventStore`] is the façade the
//! rest of the engine talks to. It adds the ordering invariant
//! **persist first, then publish**, plus typed reads and replay.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use std::sync::Arc;

use tracing::{debug, instrument};

use atelier_core::{AggregateId, ExpectedVersion};
use atelier_events::{AggregateState, EventBus, EventType, StoredEvent, UncommittedEvent, replay};

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError};

/// Event store façade that publishes committed events to the [`EventBus`].
///
/// - A failed append publishes nothing: the event never happened.
/// - Handler failures during publish are captured by the bus as dead letters and
///   never undo or fail the append.
pub struct PublishingEventStore<S> {
    store: S,
    bus: Arc<EventBus>,
}

impl<S> PublishingEventStore<S> {
    pub fn new(store: S, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> PublishingEventStore<S> {
    /// Append a single event without a version expectation.
    pub async fn append(&self, event: UncommittedEvent) -> Result<StoredEvent, EventStoreError> {
        let mut committed = self.append_all(vec![event], ExpectedVersion::Any).await?;
        committed
            .pop()
            .ok_or_else(|| EventStoreError::InvalidAppend("store committed no event".to_string()))
    }

    /// Append a batch atomically, then publish each committed event in order.
    #[instrument(skip(self, events), fields(event_count = events.len(), expected_version = ?expected_version), err)]
    pub async fn append_all(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(events, expected_version).await?;

        for event in &committed {
            self.bus.publish(event).await;
        }

        Ok(committed)
    }

    /// Events of one aggregate, oldest first, optionally restricted to one type.
    pub async fn get_events(
        &self,
        aggregate_id: AggregateId,
        event_type: Option<EventType>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut events = self.store.load_stream(aggregate_id).await?;
        if let Some(ty) = event_type {
            events.retain(|e| e.event_type == ty.as_str());
        }
        Ok(events)
    }

    /// Rebuild an aggregate's state from its full history.
    pub async fn replay(&self, aggregate_id: AggregateId) -> Result<AggregateState, EventStoreError> {
        Ok(self.load_state(aggregate_id).await?.0)
    }

    /// Replayed state together with the stream version it reflects.
    pub async fn load_state(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<(AggregateState, u64), EventStoreError> {
        let events = self.store.load_stream(aggregate_id).await?;
        let version = events.last().map(|e| e.sequence_number).unwrap_or(0);
        debug!(aggregate_id = %aggregate_id, events = events.len(), version, "replaying aggregate");
        Ok((replay(&events), version))
    }
}

impl<S> core::fmt::Debug for PublishingEventStore<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PublishingEventStore").field("bus", &self.bus).finish_non_exhaustive()
    }
}
