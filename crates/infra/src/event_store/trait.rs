use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use atelier_core::{AggregateId, ExpectedVersion};
use atelier_events::{StoredEvent, UncommittedEvent};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, stream integrity) as
/// opposed to domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// The backing storage could not be reached or rejected the operation.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("event serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventStoreError {
    fn from(value: serde_json::Error) -> Self {
        EventStoreError::Serialization(value.to_string())
    }
}

/// Append-only event store (storage port).
///
/// Events are organized into **streams**, one per aggregate instance. Within a
/// stream, sequence numbers start at 1 and increase by one per event.
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates aggregate scoping (all events must target the same aggregate)
/// - Checks optimistic concurrency (version must match expected)
/// - Enforces aggregate type stability across the stream
/// - Assigns sequence numbers (starting at current_version + 1)
/// - Persists events atomically (all or nothing)
///
/// ## Load Semantics
///
/// `load_stream()` returns the stream in sequence order, or an empty vector when the
/// aggregate has no events yet.
///
/// Nothing in this trait updates or removes a stored event.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version).await
    }

    async fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id).await
    }
}

/// Check that a batch targets exactly one stream with one aggregate type.
pub(crate) fn validate_batch(events: &[UncommittedEvent]) -> Result<(), EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    for (idx, e) in events.iter().enumerate() {
        if e.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }
    Ok(())
}
