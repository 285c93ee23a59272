//! Product read queries, answered from the catalog projection.
//!
//! - `GetProduct`: cache-aside on `product:{id}`.
//! - `GetProductsBySku`: one [`BatchLoader`] per execution, so every SKU of the
//!   request is fetched in a single projection scan.
//! - `ListProducts`: memoized per filter under [`PRODUCT_LIST_NAMESPACE`].

use std::collections::HashMap;
use std::future::Ready;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use atelier_core::AggregateId;
use atelier_events::{Query, QueryError, QueryHandler};

use crate::batch_loader::{BatchFn, BatchLoader, LoadError};
use crate::cache::{CacheError, Memoized, MultiTierCache};
use crate::projections::products::{
    PRODUCT_LIST_NAMESPACE, ProductCatalogProjection, ProductFilter, ProductView, product_cache_key,
};
use crate::query_bus::QueryBus;
use crate::read_model::ReadModelStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ProductQuery {
    GetProduct { product_id: AggregateId },
    GetProductsBySku { skus: Vec<String> },
    ListProducts(ProductFilter),
}

/// Routing key for [`ProductQuery`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProductQueryType {
    GetProduct,
    GetProductsBySku,
    ListProducts,
}

impl ProductQueryType {
    pub const ALL: [ProductQueryType; 3] = [
        ProductQueryType::GetProduct,
        ProductQueryType::GetProductsBySku,
        ProductQueryType::ListProducts,
    ];
}

impl core::fmt::Display for ProductQueryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ProductQueryType::GetProduct => "GetProduct",
            ProductQueryType::GetProductsBySku => "GetProductsBySku",
            ProductQueryType::ListProducts => "ListProducts",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProductQueryOutput {
    /// `None` is the explicit "not found" result.
    Product(Option<ProductView>),
    Products(Vec<ProductView>),
    /// Positionally aligned with the requested SKUs.
    BySku(Vec<Option<ProductView>>),
}

impl Query for ProductQuery {
    type Kind = ProductQueryType;
    type Output = ProductQueryOutput;

    fn kind(&self) -> ProductQueryType {
        match self {
            ProductQuery::GetProduct { .. } => ProductQueryType::GetProduct,
            ProductQuery::GetProductsBySku { .. } => ProductQueryType::GetProductsBySku,
            ProductQuery::ListProducts(_) => ProductQueryType::ListProducts,
        }
    }
}

type ListFn = Box<dyn Fn(ProductFilter) -> Ready<Result<Option<Vec<ProductView>>, QueryError>> + Send + Sync>;

/// SKU lookups against the projection, for the batch loader.
struct SkuLookup<S> {
    projection: Arc<ProductCatalogProjection<S>>,
}

#[async_trait]
impl<S> BatchFn<String, ProductView> for SkuLookup<S>
where
    S: ReadModelStore<AggregateId, ProductView> + 'static,
{
    async fn load(&self, skus: &[String]) -> Result<HashMap<String, ProductView>, LoadError> {
        Ok(self.projection.find_by_skus(skus))
    }
}

pub struct ProductQueryHandler<S> {
    projection: Arc<ProductCatalogProjection<S>>,
    cache: MultiTierCache,
    listings: Memoized<ProductFilter, Vec<ProductView>, ListFn>,
    max_batch_size: NonZeroUsize,
}

impl<S> ProductQueryHandler<S>
where
    S: ReadModelStore<AggregateId, ProductView> + 'static,
{
    /// Fails when [`PRODUCT_LIST_NAMESPACE`] is already memoized on `cache`.
    pub fn new(
        projection: Arc<ProductCatalogProjection<S>>,
        cache: MultiTierCache,
        max_batch_size: NonZeroUsize,
    ) -> Result<Self, CacheError> {
        let ttl: Duration = cache.options().default_ttl;
        let source = projection.clone();
        let list: ListFn = Box::new(move |filter: ProductFilter| {
            std::future::ready(Ok::<_, QueryError>(Some(source.list(&filter))))
        });

        Ok(Self {
            listings: Memoized::new(PRODUCT_LIST_NAMESPACE, ttl, &cache, list)?,
            projection,
            cache,
            max_batch_size,
        })
    }

    /// The listing memoizer's own cache. The projection must invalidate it too.
    pub fn listing_cache(&self) -> &MultiTierCache {
        self.listings.cache()
    }

    async fn get_product(&self, product_id: AggregateId) -> Option<ProductView> {
        let key = product_cache_key(product_id);
        if let Some(view) = self.cache.get_as::<ProductView>(&key).await {
            return Some(view);
        }

        let view = self.projection.get(product_id)?;
        self.cache.set_as(&key, &view, None).await;
        Some(view)
    }

    async fn by_skus(&self, skus: &[String]) -> Result<Vec<Option<ProductView>>, QueryError> {
        let loader = BatchLoader::new(
            SkuLookup {
                projection: self.projection.clone(),
            },
            self.max_batch_size,
        );
        loader
            .load_many(skus.iter().cloned())
            .await
            .map_err(|e| QueryError::Failed(e.to_string()))
    }
}

#[async_trait]
impl<S> QueryHandler<ProductQuery> for ProductQueryHandler<S>
where
    S: ReadModelStore<AggregateId, ProductView> + 'static,
{
    async fn handle(&self, query: &ProductQuery) -> Result<ProductQueryOutput, QueryError> {
        let output = match query {
            ProductQuery::GetProduct { product_id } => ProductQueryOutput::Product(self.get_product(*product_id).await),
            ProductQuery::GetProductsBySku { skus } => ProductQueryOutput::BySku(self.by_skus(skus).await?),
            ProductQuery::ListProducts(filter) => {
                ProductQueryOutput::Products(self.listings.call(filter.clone()).await?.unwrap_or_default())
            }
        };
        debug!(query_type = %query.kind(), "product query answered");
        Ok(output)
    }
}

/// Register `handler` for every [`ProductQueryType`].
pub fn register_product_query_handlers<S>(bus: &QueryBus<ProductQuery>, handler: Arc<ProductQueryHandler<S>>)
where
    S: ReadModelStore<AggregateId, ProductView> + 'static,
{
    let handler: Arc<dyn QueryHandler<ProductQuery>> = handler;
    for kind in ProductQueryType::ALL {
        match kind {
            ProductQueryType::GetProduct | ProductQueryType::GetProductsBySku | ProductQueryType::ListProducts => {
                bus.register_handler(kind, handler.clone())
            }
        }
    }
}

impl<S> core::fmt::Debug for ProductQueryHandler<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProductQueryHandler")
            .field("cache", &self.cache)
            .field("listings", &self.listings)
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}
