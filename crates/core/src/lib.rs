//! `atelier-core`: catalog engine foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateType, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CorrelationId, UserId};
