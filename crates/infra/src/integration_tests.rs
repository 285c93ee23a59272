//! Integration tests for the full pipeline.
//!
//! Tests: Command → EventStore → EventBus → Projection → Cache → Query
//!
//! Verifies:
//! - Accepted commands persist events and replay to the expected state
//! - Rejected commands persist nothing
//! - Reads stay coherent with writes through both cache tiers
//! - Failing subscribers end up in dead letters without blocking others

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde::Serialize;

    use atelier_events::{CommandError, EventHandler, EventType, StoredEvent};
    use atelier_products::{ChangePrice, CreateProduct, ProductCommand, ProductId, ProductSnapshot};

    use crate::cache::Memoized;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::projections::products::{ProductFilter, ProductView};
    use crate::query_handlers::{ProductQuery, ProductQueryOutput};

    fn engine() -> Engine {
        Engine::in_memory(&EngineConfig::default()).unwrap()
    }

    async fn create(engine: &Engine, cmd: CreateProduct) -> Result<ProductId, CommandError> {
        let id = cmd.product_id;
        engine.commands().dispatch(ProductCommand::CreateProduct(cmd)).await?;
        Ok(id)
    }

    async fn snapshot(engine: &Engine, id: ProductId) -> ProductSnapshot {
        let state = engine.replay(id.aggregate_id()).await.unwrap();
        ProductSnapshot::from_state(&state).unwrap().unwrap()
    }

    // ============================================================
    // Write side
    // ============================================================

    #[tokio::test]
    async fn created_product_replays_from_its_single_event() {
        let engine = engine();
        let id = create(&engine, CreateProduct::new("br-001", "Black Rose Crewneck", 79.99))
            .await
            .unwrap();

        let events = engine.store().get_events(id.aggregate_id(), None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventType::ProductCreated));

        let snap = snapshot(&engine, id).await;
        assert_eq!(snap.sku, "br-001");
        assert_eq!(snap.price, 79.99);
    }

    #[tokio::test]
    async fn malformed_sku_is_rejected_and_nothing_is_stored() {
        let engine = engine();
        let cmd = CreateProduct::new("invalid_sku", "Black Rose Crewneck", 79.99);
        let aggregate_id = cmd.product_id.aggregate_id();

        let err = create(&engine, cmd).await.unwrap_err();

        assert!(matches!(err, CommandError::Validation(_)), "got {err:?}");
        assert!(engine.store().get_events(aggregate_id, None).await.unwrap().is_empty());
        assert_eq!(engine.projection().get(aggregate_id), None);
    }

    #[tokio::test]
    async fn price_above_the_cap_is_rejected() {
        let engine = engine();
        let cmd = CreateProduct::new("br-001", "Black Rose Crewneck", 150_000.0);
        let aggregate_id = cmd.product_id.aggregate_id();

        let err = create(&engine, cmd).await.unwrap_err();

        assert!(matches!(err, CommandError::Validation(_)), "got {err:?}");
        assert!(engine.store().get_events(aggregate_id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn price_change_replays_over_creation() {
        let engine = engine();
        let id = create(
            &engine,
            CreateProduct::new("br-001", "Black Rose Crewneck", 79.99).with_collection("black-rose"),
        )
        .await
        .unwrap();

        engine
            .commands()
            .dispatch(ProductCommand::ChangePrice(ChangePrice {
                product_id: id,
                new_price: 89.99,
            }))
            .await
            .unwrap();

        let snap = snapshot(&engine, id).await;
        assert_eq!(snap.price, 89.99);
        assert_eq!(snap.sku, "br-001");
        assert_eq!(snap.name, "Black Rose Crewneck");
        assert_eq!(snap.collection.as_deref(), Some("black-rose"));
        assert!(!snap.deleted);
    }

    // ============================================================
    // Read side
    // ============================================================

    #[tokio::test]
    async fn projection_follows_commands_through_the_bus() {
        let engine = engine();
        let id = create(&engine, CreateProduct::new("br-001", "Black Rose Crewneck", 79.99))
            .await
            .unwrap();

        let view = engine.projection().get(id.aggregate_id()).unwrap();
        assert_eq!(view.version, 1);

        let query = ProductQuery::GetProduct {
            product_id: id.aggregate_id(),
        };
        let price = |out: ProductQueryOutput| match out {
            ProductQueryOutput::Product(Some(view)) => view.price,
            other => panic!("unexpected output {other:?}"),
        };
        assert_eq!(price(engine.query(&query).await.unwrap()), 79.99);

        engine
            .commands()
            .dispatch(ProductCommand::ChangePrice(ChangePrice {
                product_id: id,
                new_price: 89.99,
            }))
            .await
            .unwrap();

        // The cached entry from the first read must not survive the change.
        assert_eq!(price(engine.query(&query).await.unwrap()), 89.99);
        assert_eq!(engine.projection().cursor(id.aggregate_id()), 2);
    }

    #[derive(Debug, Clone, Serialize)]
    struct CollectionPage {
        collection: String,
        limit: usize,
        offset: usize,
    }

    #[tokio::test]
    async fn identical_memoized_reads_fetch_once() {
        let engine = engine();
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();

        let memo: Memoized<CollectionPage, Vec<String>, _> = Memoized::new(
            "collections",
            engine.config().default_ttl,
            engine.cache(),
            move |page: CollectionPage| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, CommandError>(Some(vec![format!("{}@{}", page.collection, page.offset)])) }
            },
        )
        .unwrap();

        let page = |offset| CollectionPage {
            collection: "black-rose".into(),
            limit: 10,
            offset,
        };

        let first = memo.call(page(0)).await.unwrap();
        let second = memo.call(page(0)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let third = memo.call(page(20)).await.unwrap();
        assert_eq!(third, Some(vec!["black-rose@20".to_string()]));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn memoized_listings_follow_new_products() {
        let engine = engine();
        for sku in ["br-001", "br-002"] {
            create(&engine, CreateProduct::new(sku, "Black Rose", 50.0).with_collection("black-rose"))
                .await
                .unwrap();
        }
        create(&engine, CreateProduct::new("ow-001", "Off White", 50.0).with_collection("off-white"))
            .await
            .unwrap();

        let list = ProductQuery::ListProducts(ProductFilter::collection("black-rose").page(10, 0));
        let skus = |out: ProductQueryOutput| match out {
            ProductQueryOutput::Products(views) => {
                let mut skus: Vec<String> = views.into_iter().map(|v: ProductView| v.sku).collect();
                skus.sort();
                skus
            }
            other => panic!("unexpected output {other:?}"),
        };

        assert_eq!(skus(engine.query(&list).await.unwrap()), vec!["br-001", "br-002"]);
        assert_eq!(skus(engine.query(&list).await.unwrap()), vec!["br-001", "br-002"]);

        create(&engine, CreateProduct::new("br-003", "Black Rose", 50.0).with_collection("black-rose"))
            .await
            .unwrap();
        assert_eq!(
            skus(engine.query(&list).await.unwrap()),
            vec!["br-001", "br-002", "br-003"]
        );

        let far_page = ProductQuery::ListProducts(ProductFilter::collection("black-rose").page(10, 20));
        assert!(skus(engine.query(&far_page).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn sku_lookup_marks_unknown_skus_absent() {
        let engine = engine();
        for n in 1..=4 {
            create(&engine, CreateProduct::new(format!("sku-00{n}"), "Tee", 20.0))
                .await
                .unwrap();
        }

        let skus: Vec<String> = (1..=5).map(|n| format!("sku-00{n}")).collect();
        let out = engine
            .query(&ProductQuery::GetProductsBySku { skus: skus.clone() })
            .await
            .unwrap();

        let ProductQueryOutput::BySku(found) = out else {
            panic!("expected sku results");
        };
        assert_eq!(found.len(), 5);
        for (sku, view) in skus.iter().zip(&found).take(4) {
            assert_eq!(view.as_ref().map(|v| v.sku.as_str()), Some(sku.as_str()));
        }
        assert_eq!(found[4], None);
    }

    // ============================================================
    // Failure isolation
    // ============================================================

    struct Flaky {
        healthy: AtomicBool,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn name(&self) -> &str {
            "flaky_notifier"
        }

        async fn handle(&self, _event: &StoredEvent) -> anyhow::Result<()> {
            if !self.healthy.load(Ordering::SeqCst) {
                anyhow::bail!("notifier offline");
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_subscriber_is_dead_lettered_and_redelivered() {
        let engine = engine();
        let flaky = Arc::new(Flaky {
            healthy: AtomicBool::new(false),
            seen: AtomicUsize::new(0),
        });
        engine.bus().subscribe(flaky.clone());

        let id = create(&engine, CreateProduct::new("br-001", "Black Rose Crewneck", 79.99))
            .await
            .unwrap();

        // The command succeeded and the projection still saw the event.
        assert!(engine.projection().get(id.aggregate_id()).is_some());
        let dead = engine.bus().dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].handler, "flaky_notifier");
        assert!(dead[0].error.contains("notifier offline"));

        flaky.healthy.store(true, Ordering::SeqCst);
        let report = engine.bus().redeliver_dead_letters().await;

        assert_eq!(report.redelivered, 1);
        assert_eq!(report.still_failing, 0);
        assert_eq!(flaky.seen.load(Ordering::SeqCst), 1);
        assert_eq!(engine.bus().dead_letter_count(), 0);
    }

    #[tokio::test]
    async fn projection_rebuild_restores_views() {
        let engine = engine();
        let id = create(&engine, CreateProduct::new("br-001", "Black Rose Crewneck", 79.99))
            .await
            .unwrap();
        engine
            .commands()
            .dispatch(ProductCommand::ChangePrice(ChangePrice {
                product_id: id,
                new_price: 89.99,
            }))
            .await
            .unwrap();

        engine.rebuild_projection(&[id.aggregate_id()]).await.unwrap();

        let view = engine.projection().get(id.aggregate_id()).unwrap();
        assert_eq!(view.price, 89.99);
        assert_eq!(view.version, 2);
    }
}
