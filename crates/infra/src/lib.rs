//! Infrastructure layer: event store adapters, buses, projections, caching,
//! batching, configuration and the engine composition root.

pub mod batch_loader;
pub mod cache;
pub mod command_bus;
pub mod command_handlers;
pub mod config;
pub mod engine;
pub mod event_store;
pub mod projections;
pub mod query_bus;
pub mod query_handlers;
pub mod read_model;

#[cfg(test)]
mod integration_tests;

pub use batch_loader::{BatchFn, BatchLoader, LoadError};
pub use cache::{CacheOptions, CacheStats, Memoized, MultiTierCache};
pub use command_bus::CommandBus;
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use event_store::{EventStore, EventStoreError, PublishingEventStore};
pub use query_bus::QueryBus;
pub use query_handlers::{ProductQuery, ProductQueryOutput, ProductQueryType};
