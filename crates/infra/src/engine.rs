//! Composition root: builds one engine instance from explicit parts.
//!
//! Nothing here is global. Every bus, store and cache is created by
//! [`Engine::build`] and handed to its collaborators.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use atelier_core::AggregateId;
use atelier_events::{AggregateState, CommandEnvelope, CommandError, EventBus, QueryError, StoredEvent};
use atelier_products::ProductCommand;

use crate::cache::{CacheOptions, InMemorySharedCache, MultiTierCache, SharedCache};
use crate::command_bus::CommandBus;
use crate::command_handlers::register_product_handlers;
use crate::config::EngineConfig;
use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, PublishingEventStore};
use crate::projections::products::{ProductCatalogProjection, ProductView};
use crate::query_bus::QueryBus;
use crate::query_handlers::{ProductQuery, ProductQueryHandler, ProductQueryOutput, register_product_query_handlers};
use crate::read_model::InMemoryReadModelStore;

pub type DynEventStore = Arc<dyn EventStore>;
pub type ProductViewStore = Arc<InMemoryReadModelStore<AggregateId, ProductView>>;

pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    store: Arc<PublishingEventStore<DynEventStore>>,
    cache: MultiTierCache,
    projection: Arc<ProductCatalogProjection<ProductViewStore>>,
    commands: CommandBus<ProductCommand, DynEventStore>,
    queries: QueryBus<ProductQuery>,
}

impl Engine {
    /// Wire an engine around the given event store and optional shared cache tier.
    pub fn build(
        config: &EngineConfig,
        store: DynEventStore,
        l2: Option<Arc<dyn SharedCache>>,
    ) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::with_dead_letter_capacity(config.dead_letter_capacity.get()));
        let store = Arc::new(PublishingEventStore::new(store, bus.clone()));
        let cache = MultiTierCache::new(l2, CacheOptions::from_config(config));

        let projection = Arc::new(ProductCatalogProjection::new(ProductViewStore::default()).with_cache(cache.clone()));
        projection.subscribe(&bus);

        let commands = CommandBus::new(store.clone());
        register_product_handlers(&commands, store.clone());

        let query_handler = Arc::new(
            ProductQueryHandler::new(projection.clone(), cache.clone(), config.max_batch_size)
                .context("failed to build the product query handler")?,
        );
        projection.add_cache(query_handler.listing_cache().clone());
        let queries = QueryBus::new();
        register_product_query_handlers(&queries, query_handler);

        info!(
            handlers = bus.handler_count(),
            l1_capacity = config.l1_capacity.get(),
            "engine ready"
        );

        Ok(Self {
            config: config.clone(),
            bus,
            store,
            cache,
            projection,
            commands,
            queries,
        })
    }

    /// Everything in process: in-memory event store and shared-tier stand-in.
    pub fn in_memory(config: &EngineConfig) -> anyhow::Result<Self> {
        Self::build(
            config,
            Arc::new(InMemoryEventStore::new()),
            Some(Arc::new(InMemorySharedCache::new())),
        )
    }

    /// Postgres when `DATABASE_URL` is set, Redis L2 when `REDIS_URL` is set
    /// (feature `redis`); in-process stand-ins otherwise.
    pub async fn connect(config: &EngineConfig) -> anyhow::Result<Self> {
        let store: DynEventStore = match &config.database_url {
            Some(url) => {
                let pg = PostgresEventStore::connect(url, config.db_timeout)
                    .await
                    .context("failed to connect to the postgres event store")?;
                pg.ensure_schema().await.context("failed to create the event store schema")?;
                Arc::new(pg)
            }
            None => {
                info!("DATABASE_URL not set; using the in-memory event store");
                Arc::new(InMemoryEventStore::new())
            }
        };

        let l2 = connect_shared_cache(config).await?;
        Self::build(config, store, Some(l2))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<PublishingEventStore<DynEventStore>> {
        &self.store
    }

    pub fn cache(&self) -> &MultiTierCache {
        &self.cache
    }

    pub fn projection(&self) -> &Arc<ProductCatalogProjection<ProductViewStore>> {
        &self.projection
    }

    pub fn commands(&self) -> &CommandBus<ProductCommand, DynEventStore> {
        &self.commands
    }

    pub fn queries(&self) -> &QueryBus<ProductQuery> {
        &self.queries
    }

    pub async fn execute(&self, envelope: &CommandEnvelope<ProductCommand>) -> Result<Vec<StoredEvent>, CommandError> {
        self.commands.execute(envelope).await
    }

    pub async fn query(&self, query: &ProductQuery) -> Result<ProductQueryOutput, QueryError> {
        self.queries.execute(query).await
    }

    pub async fn replay(&self, aggregate_id: AggregateId) -> Result<AggregateState, EventStoreError> {
        self.store.replay(aggregate_id).await
    }

    /// Rebuild the catalog projection from the streams of `aggregate_ids`.
    ///
    /// A durable store outlives the process; the projection does not.
    pub async fn rebuild_projection(&self, aggregate_ids: &[AggregateId]) -> anyhow::Result<()> {
        let mut history = Vec::new();
        for id in aggregate_ids {
            history.extend(self.store.get_events(*id, None).await?);
        }
        self.projection
            .rebuild_from_scratch(history)
            .await
            .context("failed to rebuild the product catalog projection")
    }
}

#[cfg(feature = "redis")]
async fn connect_shared_cache(config: &EngineConfig) -> anyhow::Result<Arc<dyn SharedCache>> {
    match &config.redis_url {
        Some(url) => {
            let redis = crate::cache::RedisSharedCache::connect(url, &config.l2_key_prefix)
                .await
                .context("failed to connect to the redis shared cache")?;
            Ok(Arc::new(redis))
        }
        None => Ok(Arc::new(InMemorySharedCache::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_shared_cache(config: &EngineConfig) -> anyhow::Result<Arc<dyn SharedCache>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the `redis` feature is disabled; using the in-process shared cache");
    }
    Ok(Arc::new(InMemorySharedCache::new()))
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("bus", &self.bus)
            .field("cache", &self.cache)
            .field("commands", &self.commands)
            .field("queries", &self.queries)
            .finish_non_exhaustive()
    }
}
