use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument};

use atelier_core::{AggregateId, AggregateType};
use atelier_events::{EventBus, EventHandler, EventType, StoredEvent};
use atelier_products::{PriceChanged, ProductCreated, ProductField, ProductUpdated};

use crate::cache::MultiTierCache;
use crate::read_model::ReadModelStore;

pub const PRODUCT_CATALOG_PROJECTION: &str = "product_catalog";

/// Cache namespace of memoized product listings.
pub const PRODUCT_LIST_NAMESPACE: &str = "products.list";

pub fn product_cache_key(product_id: AggregateId) -> String {
    format!("product:{product_id}")
}

/// Queryable product read model (catalog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductView {
    pub product_id: AggregateId,
    pub sku: String,
    pub name: String,
    pub price: f64,
    pub compare_at_price: Option<f64>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub collection: Option<String>,
    pub deleted: bool,
    /// Sequence number of the last event folded into this view.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Listing filter. Also the memoization key of listing queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductFilter {
    pub collection: Option<String>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ProductFilter {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::default()
        }
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    fn matches(&self, view: &ProductView) -> bool {
        (self.include_deleted || !view.deleted)
            && self
                .collection
                .as_ref()
                .is_none_or(|c| view.collection.as_ref() == Some(c))
    }
}

#[derive(Debug, Error)]
pub enum ProductProjectionError {
    #[error("failed to deserialize product event: {0}")]
    Deserialize(String),

    #[error("no product view for {0}; the stream must start with a creation event")]
    MissingView(AggregateId),
}

/// Folds product events into [`ProductView`]s.
///
/// Redelivery is a no-op: a per-aggregate cursor remembers the last applied
/// sequence number and older events are skipped. The first event seen for an
/// aggregate is accepted at any position. After that, an event arriving ahead of
/// its predecessor is parked and folded as soon as the gap closes.
pub struct ProductCatalogProjection<S> {
    store: S,
    cursors: RwLock<Cursors>,
    caches: RwLock<Vec<MultiTierCache>>,
}

#[derive(Default)]
struct Cursors {
    last: HashMap<AggregateId, u64>,
    parked: HashMap<AggregateId, BTreeMap<u64, StoredEvent>>,
}

impl<S> ProductCatalogProjection<S>
where
    S: ReadModelStore<AggregateId, ProductView>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(Cursors::default()),
            caches: RwLock::new(Vec::new()),
        }
    }

    /// Keep `cache` coherent: after every applied event, drop the product's entry
    /// and every memoized listing.
    pub fn with_cache(self, cache: MultiTierCache) -> Self {
        self.add_cache(cache);
        self
    }

    /// Like [`with_cache`](Self::with_cache), for caches created after the projection.
    pub fn add_cache(&self, cache: MultiTierCache) {
        self.caches.write().push(cache);
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus)
    where
        S: 'static,
    {
        bus.subscribe(self.clone());
    }

    pub fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        self.cursors.read().last.get(&aggregate_id).copied().unwrap_or(0)
    }

    /// Events held back until their predecessors arrive.
    pub fn parked_count(&self, aggregate_id: AggregateId) -> usize {
        self.cursors.read().parked.get(&aggregate_id).map_or(0, BTreeMap::len)
    }

    /// Apply one event, then any parked successors it unblocks. Returns `false`
    /// when nothing was folded (duplicate, parked, other aggregate type, or
    /// unknown event type).
    #[instrument(
        skip(self, event),
        fields(aggregate_id = %event.aggregate_id, sequence_number = event.sequence_number, event_type = %event.event_type),
        err
    )]
    pub async fn apply(&self, event: &StoredEvent) -> Result<bool, ProductProjectionError> {
        if event.aggregate_type != AggregateType::Product.as_str() {
            return Ok(false);
        }

        let (applied, parked_err) = {
            let mut cursors = self.cursors.write();
            let aggregate_id = event.aggregate_id;
            let seq = event.sequence_number;

            let last = cursors.last.get(&aggregate_id).copied();
            match last {
                Some(last) if seq <= last => return Ok(false),
                Some(last) if seq != last + 1 => {
                    debug!(last, "parking out-of-order event");
                    cursors
                        .parked
                        .entry(aggregate_id)
                        .or_default()
                        .insert(seq, event.clone());
                    return Ok(false);
                }
                _ => {}
            }

            let applied = self.fold(&mut cursors, event)?;
            let (drained, parked_err) = self.drain_parked(&mut cursors, aggregate_id);
            (applied || drained, parked_err)
        };

        if applied {
            self.invalidate_caches(event.aggregate_id).await;
        }
        match parked_err {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    }

    fn fold(&self, cursors: &mut Cursors, event: &StoredEvent) -> Result<bool, ProductProjectionError> {
        let applied = match event.kind() {
            Some(kind) => {
                self.apply_kind(kind, event)?;
                true
            }
            None => {
                debug!(event_type = %event.event_type, "ignoring unknown event type");
                false
            }
        };
        cursors.last.insert(event.aggregate_id, event.sequence_number);
        Ok(applied)
    }

    /// Fold parked events that now continue the stream. A parked event that fails
    /// stays parked and its error is returned alongside what was folded before it.
    fn drain_parked(
        &self,
        cursors: &mut Cursors,
        aggregate_id: AggregateId,
    ) -> (bool, Option<ProductProjectionError>) {
        let Some(mut parked) = cursors.parked.remove(&aggregate_id) else {
            return (false, None);
        };

        let mut applied = false;
        let mut failure = None;
        while let Some(next) = parked.first_entry() {
            let last = cursors.last.get(&aggregate_id).copied().unwrap_or(0);
            let seq = *next.key();
            if seq <= last {
                next.remove();
                continue;
            }
            if seq != last + 1 {
                break;
            }

            let event = next.remove();
            match self.fold(cursors, &event) {
                Ok(folded) => applied |= folded,
                Err(err) => {
                    parked.insert(seq, event);
                    failure = Some(err);
                    break;
                }
            }
        }

        if !parked.is_empty() {
            cursors.parked.insert(aggregate_id, parked);
        }
        (applied, failure)
    }

    fn apply_kind(&self, kind: EventType, event: &StoredEvent) -> Result<(), ProductProjectionError> {
        match kind {
            EventType::ProductCreated => self.on_created(event),
            EventType::ProductUpdated => self.on_updated(event),
            EventType::PriceChanged => self.on_price_changed(event),
            EventType::ProductDeleted => self.on_deleted(event),
        }
    }

    fn on_created(&self, event: &StoredEvent) -> Result<(), ProductProjectionError> {
        let e: ProductCreated = decode(&event.payload)?;
        self.store.upsert(
            event.aggregate_id,
            ProductView {
                product_id: event.aggregate_id,
                sku: e.sku,
                name: e.name,
                price: e.price,
                compare_at_price: e.compare_at_price,
                description: e.description,
                images: e.images,
                collection: e.collection,
                deleted: false,
                version: event.sequence_number,
                updated_at: event.occurred_at,
            },
        );
        Ok(())
    }

    fn on_updated(&self, event: &StoredEvent) -> Result<(), ProductProjectionError> {
        let e: ProductUpdated = decode(&event.payload)?;
        self.update(event, |view| {
            match e.field {
                ProductField::Name => view.name = decode(&e.value)?,
                ProductField::Description => view.description = decode(&e.value)?,
                ProductField::CompareAtPrice => view.compare_at_price = decode(&e.value)?,
                ProductField::Images => view.images = decode(&e.value)?,
                ProductField::Collection => view.collection = decode(&e.value)?,
            }
            Ok(())
        })
    }

    fn on_price_changed(&self, event: &StoredEvent) -> Result<(), ProductProjectionError> {
        let e: PriceChanged = decode(&event.payload)?;
        self.update(event, |view| {
            view.price = e.new_price;
            Ok(())
        })
    }

    fn on_deleted(&self, event: &StoredEvent) -> Result<(), ProductProjectionError> {
        self.update(event, |view| {
            view.deleted = true;
            Ok(())
        })
    }

    fn update<F>(&self, event: &StoredEvent, f: F) -> Result<(), ProductProjectionError>
    where
        F: FnOnce(&mut ProductView) -> Result<(), ProductProjectionError>,
    {
        let mut view = self
            .store
            .get(&event.aggregate_id)
            .ok_or(ProductProjectionError::MissingView(event.aggregate_id))?;
        f(&mut view)?;
        view.version = event.sequence_number;
        view.updated_at = event.occurred_at;
        self.store.upsert(event.aggregate_id, view);
        Ok(())
    }

    async fn invalidate_caches(&self, product_id: AggregateId) {
        let key = product_cache_key(product_id);
        let list_prefix = format!("{PRODUCT_LIST_NAMESPACE}:");
        let caches = self.caches.read().clone();
        for cache in &caches {
            cache.invalidate(&key).await;
            cache.invalidate_pattern(&list_prefix).await;
        }
    }

    /// Clear the store and cursors, then fold `events` from scratch.
    pub async fn rebuild_from_scratch(
        &self,
        events: impl IntoIterator<Item = StoredEvent>,
    ) -> Result<(), ProductProjectionError> {
        self.store.clear();
        *self.cursors.write() = Cursors::default();

        let mut events: Vec<StoredEvent> = events.into_iter().collect();
        events.sort_by_key(|e| (e.aggregate_id, e.sequence_number));

        for event in &events {
            self.apply(event).await?;
        }
        Ok(())
    }

    pub fn get(&self, product_id: AggregateId) -> Option<ProductView> {
        self.store.get(&product_id)
    }

    /// The live (not deleted) product carrying `sku`.
    pub fn find_by_sku(&self, sku: &str) -> Option<ProductView> {
        self.store.list().into_iter().find(|v| !v.deleted && v.sku == sku)
    }

    /// Live products for each requested SKU that exists.
    pub fn find_by_skus(&self, skus: &[String]) -> HashMap<String, ProductView> {
        self.store
            .list()
            .into_iter()
            .filter(|v| !v.deleted && skus.contains(&v.sku))
            .map(|v| (v.sku.clone(), v))
            .collect()
    }

    pub fn list(&self, filter: &ProductFilter) -> Vec<ProductView> {
        let matching = self.store.list().into_iter().filter(|v| filter.matches(v));
        let paged = matching.skip(filter.offset);
        match filter.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &JsonValue) -> Result<T, ProductProjectionError> {
    serde_json::from_value(value.clone()).map_err(|e| ProductProjectionError::Deserialize(e.to_string()))
}

#[async_trait]
impl<S> EventHandler for ProductCatalogProjection<S>
where
    S: ReadModelStore<AggregateId, ProductView>,
{
    fn name(&self) -> &str {
        PRODUCT_CATALOG_PROJECTION
    }

    async fn handle(&self, event: &StoredEvent) -> anyhow::Result<()> {
        self.apply(event).await?;
        Ok(())
    }
}

impl<S> core::fmt::Debug for ProductCatalogProjection<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProductCatalogProjection")
            .field("cursors", &self.cursors.read().last.len())
            .field("caches", &self.caches.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOptions, InMemorySharedCache};
    use crate::read_model::InMemoryReadModelStore;
    use atelier_core::CorrelationId;
    use atelier_events::{EventMetadata, UncommittedEvent};
    use atelier_products::{ProductDeleted, ProductEvent};
    use proptest::prelude::*;
    use serde_json::json;

    type Projection = ProductCatalogProjection<Arc<InMemoryReadModelStore<AggregateId, ProductView>>>;

    fn projection() -> Projection {
        ProductCatalogProjection::new(Arc::new(InMemoryReadModelStore::new()))
    }

    fn stored(aggregate_id: AggregateId, seq: u64, event: ProductEvent) -> StoredEvent {
        let metadata = EventMetadata::new(None, CorrelationId::new());
        UncommittedEvent::from_typed(aggregate_id, AggregateType::Product, metadata, &event)
            .unwrap()
            .into_stored(seq)
    }

    fn created(sku: &str, price: f64, collection: Option<&str>) -> ProductEvent {
        ProductEvent::ProductCreated(ProductCreated {
            sku: sku.to_string(),
            name: format!("Product {sku}"),
            price,
            compare_at_price: None,
            description: None,
            images: vec![],
            collection: collection.map(str::to_string),
        })
    }

    fn price_changed(old_price: f64, new_price: f64) -> ProductEvent {
        ProductEvent::PriceChanged(PriceChanged { old_price, new_price })
    }

    fn updated(field: ProductField, value: JsonValue) -> ProductEvent {
        ProductEvent::ProductUpdated(ProductUpdated { field, value })
    }

    #[tokio::test]
    async fn folds_a_product_lifecycle() {
        let p = projection();
        let id = AggregateId::new();

        p.apply(&stored(id, 1, created("br-001", 79.99, Some("black-rose")))).await.unwrap();
        p.apply(&stored(id, 2, price_changed(79.99, 89.99))).await.unwrap();
        p.apply(&stored(id, 3, updated(ProductField::Images, json!(["a.jpg"]))))
            .await
            .unwrap();

        let view = p.get(id).unwrap();
        assert_eq!(view.sku, "br-001");
        assert_eq!(view.price, 89.99);
        assert_eq!(view.images, vec!["a.jpg".to_string()]);
        assert_eq!(view.version, 3);
        assert_eq!(p.find_by_sku("br-001").map(|v| v.product_id), Some(id));

        p.apply(&stored(id, 4, ProductEvent::ProductDeleted(ProductDeleted::default())))
            .await
            .unwrap();
        assert!(p.get(id).unwrap().deleted);
        assert_eq!(p.find_by_sku("br-001"), None);
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let p = projection();
        let id = AggregateId::new();
        let first = stored(id, 1, created("br-001", 10.0, None));

        assert!(p.apply(&first).await.unwrap());
        assert!(!p.apply(&first).await.unwrap());
        assert_eq!(p.cursor(id), 1);
    }

    #[tokio::test]
    async fn out_of_order_events_are_held_until_the_gap_closes() {
        let p = projection();
        let id = AggregateId::new();

        assert!(p.apply(&stored(id, 1, created("br-001", 10.0, None))).await.unwrap());

        let third = stored(id, 3, price_changed(11.0, 12.0));
        assert!(!p.apply(&third).await.unwrap());
        assert_eq!(p.cursor(id), 1);
        assert_eq!(p.parked_count(id), 1);
        assert_eq!(p.get(id).unwrap().price, 10.0);

        assert!(p.apply(&stored(id, 2, price_changed(10.0, 11.0))).await.unwrap());

        let view = p.get(id).unwrap();
        assert_eq!(view.price, 12.0);
        assert_eq!(view.version, 3);
        assert_eq!(p.cursor(id), 3);
        assert_eq!(p.parked_count(id), 0);

        // A late redelivery of the parked event changes nothing.
        assert!(!p.apply(&third).await.unwrap());
        assert_eq!(p.get(id).unwrap().version, 3);
    }

    #[tokio::test]
    async fn parked_events_wait_for_every_missing_predecessor() {
        let p = projection();
        let id = AggregateId::new();
        p.apply(&stored(id, 1, created("br-001", 10.0, None))).await.unwrap();

        p.apply(&stored(id, 4, price_changed(13.0, 14.0))).await.unwrap();
        p.apply(&stored(id, 3, price_changed(12.0, 13.0))).await.unwrap();
        assert_eq!(p.parked_count(id), 2);

        p.apply(&stored(id, 2, price_changed(10.0, 12.0))).await.unwrap();
        assert_eq!(p.get(id).unwrap().price, 14.0);
        assert_eq!(p.cursor(id), 4);
        assert_eq!(p.parked_count(id), 0);
    }

    #[tokio::test]
    async fn unknown_event_types_advance_the_cursor_only() {
        let p = projection();
        let id = AggregateId::new();
        p.apply(&stored(id, 1, created("br-001", 10.0, None))).await.unwrap();

        let mut future = stored(id, 2, price_changed(10.0, 11.0));
        future.event_type = "product.restocked".to_string();

        assert!(!p.apply(&future).await.unwrap());
        assert_eq!(p.cursor(id), 2);
        assert_eq!(p.get(id).unwrap().price, 10.0);
    }

    #[tokio::test]
    async fn update_before_create_is_rejected() {
        let p = projection();
        let id = AggregateId::new();
        let err = p.apply(&stored(id, 1, price_changed(1.0, 2.0))).await.unwrap_err();
        assert!(matches!(err, ProductProjectionError::MissingView(missing) if missing == id));
    }

    #[tokio::test]
    async fn lists_with_filter_and_paging() {
        let p = projection();
        for (i, collection) in ["noir", "noir", "blanc", "noir"].into_iter().enumerate() {
            let id = AggregateId::new();
            p.apply(&stored(id, 1, created(&format!("sku-{i}"), 1.0, Some(collection))))
                .await
                .unwrap();
            if i == 1 {
                p.apply(&stored(id, 2, ProductEvent::ProductDeleted(ProductDeleted::default())))
                    .await
                    .unwrap();
            }
        }

        let mut noir: Vec<String> = p.list(&ProductFilter::collection("noir")).into_iter().map(|v| v.sku).collect();
        noir.sort();
        assert_eq!(noir, vec!["sku-0", "sku-3"]);

        let with_deleted = ProductFilter {
            include_deleted: true,
            ..ProductFilter::collection("noir")
        };
        assert_eq!(p.list(&with_deleted).len(), 3);
        assert_eq!(p.list(&with_deleted.clone().page(2, 2)).len(), 1);
        assert!(p.list(&with_deleted.page(5, 3)).is_empty());
        assert_eq!(p.list(&ProductFilter::default()).len(), 3);

        let found = p.find_by_skus(&["sku-1".to_string(), "sku-2".to_string(), "nope".to_string()]);
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("sku-2"));
    }

    #[tokio::test]
    async fn applied_events_invalidate_product_and_listing_entries() {
        let cache = MultiTierCache::new(Some(Arc::new(InMemorySharedCache::new())), CacheOptions::default());
        let p = projection().with_cache(cache.clone());
        let id = AggregateId::new();
        p.apply(&stored(id, 1, created("br-001", 10.0, None))).await.unwrap();

        cache.set(&product_cache_key(id), json!("stale"), None).await;
        cache.set(&format!("{PRODUCT_LIST_NAMESPACE}:abc"), json!([]), None).await;
        cache.set("unrelated", json!(1), None).await;

        p.apply(&stored(id, 2, price_changed(10.0, 20.0))).await.unwrap();

        assert_eq!(cache.get(&product_cache_key(id)).await, None);
        assert_eq!(cache.get(&format!("{PRODUCT_LIST_NAMESPACE}:abc")).await, None);
        assert_eq!(cache.get("unrelated").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_state() {
        let p = projection();
        let id = AggregateId::new();
        let history = vec![
            stored(id, 2, price_changed(10.0, 15.0)),
            stored(id, 1, created("br-001", 10.0, None)),
        ];
        p.apply(&stored(AggregateId::new(), 1, created("old-001", 1.0, None)))
            .await
            .unwrap();

        p.rebuild_from_scratch(history).await.unwrap();

        assert_eq!(p.list(&ProductFilter::default()).len(), 1);
        assert_eq!(p.get(id).unwrap().price, 15.0);
    }

    #[tokio::test]
    async fn ignores_other_aggregate_types() {
        let p = projection();
        let mut event = stored(AggregateId::new(), 1, created("br-001", 1.0, None));
        event.aggregate_type = "catalog.collection".to_string();
        assert!(!p.apply(&event).await.unwrap());
        assert!(p.list(&ProductFilter::default()).is_empty());
    }

    fn history_strategy() -> impl Strategy<Value = Vec<ProductEvent>> {
        let step = prop_oneof![
            (0.0f64..100_000.0).prop_map(|p| price_changed(0.0, p)),
            "[a-z ]{1,20}".prop_map(|n| updated(ProductField::Name, json!(n))),
            proptest::option::of("[a-z]{1,8}").prop_map(|c| updated(ProductField::Collection, json!(c))),
        ];
        proptest::collection::vec(step, 0..12).prop_map(|mut steps| {
            steps.insert(0, created("br-001", 1.0, None));
            steps
        })
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn applying_a_history_twice_equals_applying_it_once(history in history_strategy()) {
            let id = AggregateId::new();
            let events: Vec<StoredEvent> = history
                .into_iter()
                .enumerate()
                .map(|(i, e)| stored(id, i as u64 + 1, e))
                .collect();

            let (once, twice) = run(async {
                let once = projection();
                for e in &events {
                    once.apply(e).await.unwrap();
                }
                let twice = projection();
                for e in events.iter().chain(events.iter()) {
                    twice.apply(e).await.unwrap();
                }
                (once.get(id), twice.get(id))
            });

            prop_assert_eq!(once, twice);
        }
    }
}
