use chrono::{DateTime, Utc};
use thiserror::Error;

use atelier_core::{CorrelationId, DomainError, UserId};

use crate::event::EventMetadata;

/// A write intent.
///
/// Commands are **transient**: only the events they produce are persisted. Each
/// command reports a `Kind` from a closed enum, and the command bus routes on that
/// kind.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Kind: Copy + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// A command plus the caller context every resulting event carries.
///
/// The correlation id is generated on construction unless the caller supplies
/// one (e.g. propagated from an inbound request).
#[derive(Debug, Clone)]
pub struct CommandEnvelope<C> {
    command: C,
    user_id: Option<UserId>,
    correlation_id: CorrelationId,
    issued_at: DateTime<Utc>,
}

impl<C: Command> CommandEnvelope<C> {
    pub fn new(command: C) -> Self {
        Self {
            command,
            user_id: None,
            correlation_id: CorrelationId::new(),
            issued_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    pub fn kind(&self) -> C::Kind {
        self.command.kind()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn metadata(&self) -> EventMetadata {
        EventMetadata::new(self.user_id, self.correlation_id)
    }
}

/// Why a command produced no events.
///
/// Every variant means nothing was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no handler registered for command type '{0}'")]
    Unhandled(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not found")]
    NotFound,

    /// The stream moved since the handler read it, or the aggregate already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The event store could not be read or written.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl From<DomainError> for CommandError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => CommandError::Validation(msg),
            DomainError::InvariantViolation(msg) => CommandError::InvariantViolation(msg),
            DomainError::NotFound => CommandError::NotFound,
            DomainError::Conflict(msg) => CommandError::Conflict(msg),
        }
    }
}
