//! Event-sourcing and CQRS mechanics for the catalog engine.
//!
//! This crate knows nothing about storage or caching. It defines the event
//! vocabulary, how an aggregate's state is folded from its history, the
//! in-process event bus, and the command/query handler contracts.

pub mod bus;
pub mod command;
pub mod event;
pub mod handler;
pub mod query;
pub mod replay;

pub use bus::{DeadLetter, EventBus, RedeliveryReport, DEFAULT_DEAD_LETTER_CAPACITY};
pub use command::{Command, CommandEnvelope, CommandError};
pub use event::{Event, EventMetadata, EventType, StoredEvent, UncommittedEvent, UnknownEventType};
pub use handler::{CommandHandler, CommandOutcome, EventHandler, QueryHandler};
pub use query::{Query, QueryError};
pub use replay::{AggregateState, Applied, SkipReason, apply_event, replay};
