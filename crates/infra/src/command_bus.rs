//! Command execution pipeline.
//!
//! ```text
//! CommandEnvelope
//!   ↓
//! 1. Route by command kind to the registered handler
//!   ↓
//! 2. Handler replays the aggregate, validates, decides events
//!   ↓
//! 3. Append all events atomically (optimistic concurrency check)
//!   ↓
//! 4. Publish each committed event to the bus, in order
//! ```
//!
//! A handler error aborts before step 3, so a rejected command never leaves
//! a partial write behind.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use atelier_events::{Command, CommandEnvelope, CommandError, CommandHandler, StoredEvent};

use crate::event_store::{EventStore, EventStoreError, PublishingEventStore};

impl From<EventStoreError> for CommandError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => CommandError::Conflict(msg),
            other => CommandError::Persistence(other.to_string()),
        }
    }
}

/// Routes commands to one handler per command kind.
pub struct CommandBus<C: Command, S> {
    store: Arc<PublishingEventStore<S>>,
    handlers: RwLock<HashMap<C::Kind, Arc<dyn CommandHandler<C>>>>,
}

impl<C, S> CommandBus<C, S>
where
    C: Command,
    S: EventStore,
{
    pub fn new(store: Arc<PublishingEventStore<S>>) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<PublishingEventStore<S>> {
        &self.store
    }

    /// Register `handler` for `kind`, replacing any previous registration.
    pub fn register_handler(&self, kind: C::Kind, handler: Arc<dyn CommandHandler<C>>) {
        if self.handlers.write().insert(kind, handler).is_some() {
            warn!(command_type = %kind, "replaced existing command handler");
        } else {
            debug!(command_type = %kind, "registered command handler");
        }
    }

    pub fn is_registered(&self, kind: C::Kind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Execute a command and return the events it committed (possibly none).
    #[instrument(
        skip(self, envelope),
        fields(command_type = %envelope.kind(), correlation_id = %envelope.correlation_id()),
        err
    )]
    pub async fn execute(&self, envelope: &CommandEnvelope<C>) -> Result<Vec<StoredEvent>, CommandError> {
        let kind = envelope.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            error!(command_type = %kind, "no handler registered for command type");
            return Err(CommandError::Unhandled(kind.to_string()));
        };

        let outcome = handler.handle(envelope).await?;
        if outcome.is_empty() {
            debug!("command produced no events");
            return Ok(Vec::new());
        }

        let committed = self
            .store
            .append_all(outcome.events, outcome.expected_version)
            .await?;

        info!(event_count = committed.len(), "command executed");
        Ok(committed)
    }

    /// Wrap `command` in a fresh envelope and execute it.
    pub async fn dispatch(&self, command: C) -> Result<Vec<StoredEvent>, CommandError> {
        self.execute(&CommandEnvelope::new(command)).await
    }
}

impl<C: Command, S> core::fmt::Debug for CommandBus<C, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kinds: Vec<C::Kind> = self.handlers.read().keys().copied().collect();
        f.debug_struct("CommandBus").field("handlers", &kinds).finish_non_exhaustive()
    }
}
