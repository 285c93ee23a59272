//! Product command handlers.
//!
//! Creation decides against an empty stream (`NoStream`), so two creates for the
//! same id cannot both succeed. Every other command replays the aggregate first
//! and decides against the version it saw (`Exact`).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use atelier_core::{AggregateType, ExpectedVersion};
use atelier_events::{
    AggregateState, CommandEnvelope, CommandError, CommandHandler, CommandOutcome, UncommittedEvent,
};
use atelier_products::{ProductCommand, ProductCommandType, decide};

use crate::command_bus::CommandBus;
use crate::event_store::{EventStore, PublishingEventStore};

pub struct ProductCommandHandler<S> {
    store: Arc<PublishingEventStore<S>>,
}

impl<S: EventStore> ProductCommandHandler<S> {
    pub fn new(store: Arc<PublishingEventStore<S>>) -> Self {
        Self { store }
    }

    async fn current_state(
        &self,
        command: &ProductCommand,
    ) -> Result<(AggregateState, ExpectedVersion), CommandError> {
        if let ProductCommand::CreateProduct(_) = command {
            return Ok((AggregateState::new(), ExpectedVersion::NoStream));
        }
        let (state, version) = self.store.load_state(command.product_id().aggregate_id()).await?;
        Ok((state, ExpectedVersion::Exact(version)))
    }
}

#[async_trait]
impl<S: EventStore> CommandHandler<ProductCommand> for ProductCommandHandler<S> {
    async fn handle(&self, envelope: &CommandEnvelope<ProductCommand>) -> Result<CommandOutcome, CommandError> {
        let command = envelope.command();
        let aggregate_id = command.product_id().aggregate_id();
        let (state, expected) = self.current_state(command).await?;

        let decided = decide(&state, command)?;
        debug!(%aggregate_id, event_count = decided.len(), "product command decided");

        let metadata = envelope.metadata();
        let events = decided
            .iter()
            .map(|e| UncommittedEvent::from_typed(aggregate_id, AggregateType::Product, metadata, e))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CommandError::Persistence(format!("event serialization failed: {e}")))?;

        Ok(CommandOutcome::new(events, expected))
    }
}

/// Register the product handler for every [`ProductCommandType`].
pub fn register_product_handlers<S>(
    bus: &CommandBus<ProductCommand, S>,
    store: Arc<PublishingEventStore<S>>,
) where
    S: EventStore + 'static,
{
    let handler: Arc<dyn CommandHandler<ProductCommand>> = Arc::new(ProductCommandHandler::new(store));
    for kind in ProductCommandType::ALL {
        match kind {
            ProductCommandType::CreateProduct
            | ProductCommandType::UpdateProduct
            | ProductCommandType::ChangePrice
            | ProductCommandType::DeleteProduct => bus.register_handler(kind, handler.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::UserId;
    use atelier_events::{EventBus, EventType};
    use atelier_products::{
        ChangePrice, CreateProduct, DeleteProduct, ProductField, ProductId, ProductSnapshot, UpdateProduct,
    };
    use serde_json::json;

    use crate::event_store::InMemoryEventStore;

    struct Fixture {
        store: Arc<PublishingEventStore<InMemoryEventStore>>,
        bus: CommandBus<ProductCommand, InMemoryEventStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(PublishingEventStore::new(InMemoryEventStore::new(), Arc::new(EventBus::new())));
        let bus = CommandBus::new(store.clone());
        register_product_handlers(&bus, store.clone());
        Fixture { store, bus }
    }

    async fn create(f: &Fixture) -> ProductId {
        let cmd = CreateProduct::new("br-001", "Black Rose Crewneck", 79.99);
        let id = cmd.product_id;
        f.bus.dispatch(ProductCommand::CreateProduct(cmd)).await.unwrap();
        id
    }

    async fn snapshot(f: &Fixture, id: ProductId) -> ProductSnapshot {
        let state = f.store.replay(id.aggregate_id()).await.unwrap();
        ProductSnapshot::from_state(&state).unwrap().unwrap()
    }

    #[test]
    fn every_command_type_is_registered() {
        let f = fixture();
        for kind in ProductCommandType::ALL {
            assert!(f.bus.is_registered(kind), "{kind} missing");
        }
    }

    #[tokio::test]
    async fn events_carry_caller_context() {
        let f = fixture();
        let user = UserId::new();
        let envelope = CommandEnvelope::new(ProductCommand::CreateProduct(CreateProduct::new(
            "br-002", "Tee", 20.0,
        )))
        .with_user(user);

        let committed = f.bus.execute(&envelope).await.unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].kind(), Some(EventType::ProductCreated));
        assert_eq!(committed[0].user_id, Some(user));
        assert_eq!(committed[0].correlation_id, envelope.correlation_id());
    }

    #[tokio::test]
    async fn update_change_price_and_delete_flow() {
        let f = fixture();
        let id = create(&f).await;

        f.bus
            .dispatch(ProductCommand::UpdateProduct(UpdateProduct {
                product_id: id,
                field: ProductField::Collection,
                value: json!("black-rose"),
            }))
            .await
            .unwrap();
        f.bus
            .dispatch(ProductCommand::ChangePrice(ChangePrice {
                product_id: id,
                new_price: 89.99,
            }))
            .await
            .unwrap();

        let snap = snapshot(&f, id).await;
        assert_eq!(snap.price, 89.99);
        assert_eq!(snap.collection.as_deref(), Some("black-rose"));

        f.bus
            .dispatch(ProductCommand::DeleteProduct(DeleteProduct { product_id: id }))
            .await
            .unwrap();
        assert!(snapshot(&f, id).await.deleted);

        let err = f
            .bus
            .dispatch(ProductCommand::ChangePrice(ChangePrice {
                product_id: id,
                new_price: 10.0,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn unchanged_price_persists_nothing() {
        let f = fixture();
        let id = create(&f).await;

        let committed = f
            .bus
            .dispatch(ProductCommand::ChangePrice(ChangePrice {
                product_id: id,
                new_price: 79.99,
            }))
            .await
            .unwrap();

        assert!(committed.is_empty());
        assert_eq!(f.store.store().event_count(), 1);
    }

    #[tokio::test]
    async fn missing_product_is_not_found() {
        let f = fixture();
        let err = f
            .bus
            .dispatch(ProductCommand::DeleteProduct(DeleteProduct {
                product_id: ProductId::generate(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NotFound);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_before_persisting() {
        let f = fixture();
        let id = create(&f).await;

        let err = f
            .bus
            .dispatch(ProductCommand::UpdateProduct(UpdateProduct {
                product_id: id,
                field: ProductField::Images,
                value: json!(vec!["x.jpg"; 21]),
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Validation(_)));
        assert_eq!(f.store.store().event_count(), 1);
    }

    #[tokio::test]
    async fn creating_the_same_id_twice_conflicts() {
        let f = fixture();
        let cmd = CreateProduct::new("br-003", "Hoodie", 120.0);
        f.bus.dispatch(ProductCommand::CreateProduct(cmd.clone())).await.unwrap();

        let err = f.bus.dispatch(ProductCommand::CreateProduct(cmd)).await.unwrap_err();

        assert!(matches!(err, CommandError::Conflict(_)));
    }
}
