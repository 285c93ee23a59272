//! Decision functions: (replayed state, command) -> events.
//!
//! Each function validates fully before returning events, so an `Err` always
//! means "nothing happened". They are pure and deterministic; the caller owns
//! loading state and persisting the result.

use atelier_core::{DomainError, DomainResult};
use atelier_events::AggregateState;

use crate::product::{
    ChangePrice, CreateProduct, DeleteProduct, PriceChanged, ProductCommand, ProductCreated,
    ProductDeleted, ProductEvent, ProductSnapshot, ProductUpdated, UpdateProduct,
};
use crate::validation::{validate_create, validate_field, validate_price};

pub fn decide(state: &AggregateState, command: &ProductCommand) -> DomainResult<Vec<ProductEvent>> {
    match command {
        ProductCommand::CreateProduct(cmd) => decide_create(state, cmd),
        ProductCommand::UpdateProduct(cmd) => decide_update(state, cmd),
        ProductCommand::ChangePrice(cmd) => decide_change_price(state, cmd),
        ProductCommand::DeleteProduct(cmd) => decide_delete(state, cmd),
    }
}

pub fn decide_create(state: &AggregateState, cmd: &CreateProduct) -> DomainResult<Vec<ProductEvent>> {
    if !state.is_empty() {
        return Err(DomainError::conflict("product already exists"));
    }

    validate_create(cmd)?;

    Ok(vec![ProductEvent::ProductCreated(ProductCreated {
        sku: cmd.sku.clone(),
        name: cmd.name.clone(),
        price: cmd.price,
        compare_at_price: cmd.compare_at_price,
        description: cmd.description.clone(),
        images: cmd.images.clone(),
        collection: cmd.collection.clone(),
    })])
}

pub fn decide_update(state: &AggregateState, cmd: &UpdateProduct) -> DomainResult<Vec<ProductEvent>> {
    existing(state)?;
    validate_field(cmd.field, &cmd.value)?;

    Ok(vec![ProductEvent::ProductUpdated(ProductUpdated {
        field: cmd.field,
        value: cmd.value.clone(),
    })])
}

/// Setting the current price again is a no-op (no event).
pub fn decide_change_price(
    state: &AggregateState,
    cmd: &ChangePrice,
) -> DomainResult<Vec<ProductEvent>> {
    let current = existing(state)?;
    validate_price(cmd.new_price).map_err(DomainError::validation)?;

    if current.price == cmd.new_price {
        return Ok(Vec::new());
    }

    Ok(vec![ProductEvent::PriceChanged(PriceChanged {
        old_price: current.price,
        new_price: cmd.new_price,
    })])
}

pub fn decide_delete(state: &AggregateState, _cmd: &DeleteProduct) -> DomainResult<Vec<ProductEvent>> {
    existing(state)?;
    Ok(vec![ProductEvent::ProductDeleted(ProductDeleted::default())])
}

/// The live (created, not deleted) product behind `state`.
fn existing(state: &AggregateState) -> DomainResult<ProductSnapshot> {
    let snapshot = ProductSnapshot::from_state(state)?.ok_or_else(DomainError::not_found)?;
    if snapshot.deleted {
        return Err(DomainError::invariant("product is deleted"));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{ProductField, ProductId};
    use atelier_events::Event;
    use serde_json::{Value as JsonValue, json};

    fn state(value: JsonValue) -> AggregateState {
        match value {
            JsonValue::Object(map) => AggregateState::from(map),
            _ => panic!("state must be an object"),
        }
    }

    fn live() -> AggregateState {
        state(json!({ "sku": "br-001", "name": "Black Rose Crewneck", "price": 79.99, "images": [] }))
    }

    #[test]
    fn create_emits_one_created_event() {
        let cmd = CreateProduct::new("br-001", "Black Rose Crewneck", 79.99);
        let events = decide_create(&AggregateState::new(), &cmd).unwrap();

        assert_eq!(events.len(), 1);
        let payload = events[0].to_payload().unwrap();
        assert_eq!(payload["sku"], json!("br-001"));
        assert_eq!(payload["price"], json!(79.99));
    }

    #[test]
    fn create_rejects_existing_stream_and_invalid_payload() {
        let cmd = CreateProduct::new("br-001", "Tee", 10.0);
        assert!(matches!(decide_create(&live(), &cmd), Err(DomainError::Conflict(_))));

        let invalid = CreateProduct::new("invalid_sku", "Tee", 10.0);
        assert!(matches!(
            decide_create(&AggregateState::new(), &invalid),
            Err(DomainError::Validation(_))
        ));

        let too_expensive = CreateProduct::new("br-001", "Tee", 150_000.0);
        assert!(matches!(
            decide_create(&AggregateState::new(), &too_expensive),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn change_price_records_old_and_new() {
        let cmd = ChangePrice { product_id: ProductId::generate(), new_price: 89.99 };
        let events = decide_change_price(&live(), &cmd).unwrap();

        assert_eq!(
            events,
            vec![ProductEvent::PriceChanged(PriceChanged { old_price: 79.99, new_price: 89.99 })]
        );

        let same = ChangePrice { new_price: 79.99, ..cmd.clone() };
        assert!(decide_change_price(&live(), &same).unwrap().is_empty());

        let over = ChangePrice { new_price: 100_000.01, ..cmd };
        assert!(matches!(decide_change_price(&live(), &over), Err(DomainError::Validation(_))));
    }

    #[test]
    fn missing_and_deleted_products_are_rejected() {
        let id = ProductId::generate();
        let update = UpdateProduct { product_id: id, field: ProductField::Name, value: json!("New") };
        assert_eq!(decide_update(&AggregateState::new(), &update), Err(DomainError::NotFound));

        let mut deleted = live().into_map();
        deleted.insert("deleted".into(), json!(true));
        let deleted = AggregateState::from(deleted);

        assert!(matches!(
            decide_delete(&deleted, &DeleteProduct { product_id: id }),
            Err(DomainError::InvariantViolation(_))
        ));
        assert!(matches!(decide_update(&deleted, &update), Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn update_validates_the_field_value() {
        let id = ProductId::generate();
        let bad = UpdateProduct { product_id: id, field: ProductField::Images, value: json!("a.png") };
        assert!(matches!(decide_update(&live(), &bad), Err(DomainError::Validation(_))));

        let good = UpdateProduct { product_id: id, field: ProductField::Collection, value: json!("black-rose") };
        assert_eq!(
            decide(&live(), &ProductCommand::UpdateProduct(good)).unwrap(),
            vec![ProductEvent::ProductUpdated(ProductUpdated {
                field: ProductField::Collection,
                value: json!("black-rose"),
            })]
        );
    }
}
