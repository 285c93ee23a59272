//! Catalog products domain (event-sourced).
//!
//! Pure domain logic: commands, events, validation and decision functions.
//! No IO, no storage. The infrastructure layer replays an aggregate and hands the
//! resulting state to the `decide_*` functions.

pub mod decide;
pub mod product;
pub mod validation;

pub use decide::{decide, decide_change_price, decide_create, decide_delete, decide_update};
pub use product::{
    ChangePrice, CreateProduct, DeleteProduct, PriceChanged, ProductCommand, ProductCommandType,
    ProductCreated, ProductDeleted, ProductEvent, ProductField, ProductId, ProductSnapshot,
    ProductUpdated, UpdateProduct,
};
pub use validation::{is_valid_sku, validate_create, validate_field, validate_price};
