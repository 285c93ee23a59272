//! Projections: read models folded from published events.
//!
//! Projections are rebuildable from the event log and idempotent under
//! redelivery.

pub mod products;

pub use products::{
    PRODUCT_CATALOG_PROJECTION, PRODUCT_LIST_NAMESPACE, ProductCatalogProjection, ProductFilter,
    ProductProjectionError, ProductView, product_cache_key,
};
