use async_trait::async_trait;

use atelier_core::ExpectedVersion;

use crate::command::{Command, CommandEnvelope, CommandError};
use crate::event::{StoredEvent, UncommittedEvent};
use crate::query::{Query, QueryError};

/// Reacts to published events (projections, notifiers, ...).
///
/// Handlers are invoked by the [`EventBus`](crate::EventBus) after the event has
/// been persisted. A failure here does not undo anything; the bus records it as a
/// dead letter. Handlers must therefore be idempotent: the same event may be
/// delivered again during manual redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used to match dead letters back to their handler.
    fn name(&self) -> &str;

    async fn handle(&self, event: &StoredEvent) -> anyhow::Result<()>;
}

/// Events a command produced, plus the stream version they were decided against.
///
/// The command bus appends `events` atomically with `expected_version`, so a
/// concurrent writer that moved the stream in between turns into a conflict
/// instead of a lost update.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub events: Vec<UncommittedEvent>,
    pub expected_version: ExpectedVersion,
}

impl CommandOutcome {
    pub fn new(events: Vec<UncommittedEvent>, expected_version: ExpectedVersion) -> Self {
        Self {
            events,
            expected_version,
        }
    }

    /// Nothing to persist.
    pub fn none() -> Self {
        Self::new(Vec::new(), ExpectedVersion::Any)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Turns a command into the events it produces.
///
/// Handlers validate **fully** before returning anything: an `Err` means no event
/// is persisted. An empty outcome is a valid no-op.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, envelope: &CommandEnvelope<C>) -> Result<CommandOutcome, CommandError>;
}

/// Answers a query from read models. Must not touch the write path.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: &Q) -> Result<Q::Output, QueryError>;
}
