use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use atelier_core::{AggregateId, DomainError, DomainResult};
use atelier_events::{AggregateState, Command, Event, EventType};

/// Product identifier (the product's aggregate stream id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.0
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<AggregateId> for ProductId {
    fn from(value: AggregateId) -> Self {
        Self(value)
    }
}

/// Fields that `UpdateProduct` may change. Price has its own command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductField {
    Name,
    Description,
    CompareAtPrice,
    Images,
    Collection,
}

impl ProductField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductField::Name => "name",
            ProductField::Description => "description",
            ProductField::CompareAtPrice => "compare_at_price",
            ProductField::Images => "images",
            ProductField::Collection => "collection",
        }
    }
}

impl core::fmt::Display for ProductField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub compare_at_price: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

impl CreateProduct {
    /// A create command with only the required fields set.
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price: f64) -> Self {
        Self {
            product_id: ProductId::generate(),
            sku: sku.into(),
            name: name.into(),
            price,
            compare_at_price: None,
            description: None,
            images: Vec::new(),
            collection: None,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

/// Command: UpdateProduct (one field at a time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProduct {
    pub product_id: ProductId,
    pub field: ProductField,
    pub value: JsonValue,
}

/// Command: ChangePrice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePrice {
    pub product_id: ProductId,
    pub new_price: f64,
}

/// Command: DeleteProduct (soft delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteProduct {
    pub product_id: ProductId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    UpdateProduct(UpdateProduct),
    ChangePrice(ChangePrice),
    DeleteProduct(DeleteProduct),
}

impl ProductCommand {
    pub fn product_id(&self) -> ProductId {
        match self {
            ProductCommand::CreateProduct(c) => c.product_id,
            ProductCommand::UpdateProduct(c) => c.product_id,
            ProductCommand::ChangePrice(c) => c.product_id,
            ProductCommand::DeleteProduct(c) => c.product_id,
        }
    }
}

/// Routing key for [`ProductCommand`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProductCommandType {
    CreateProduct,
    UpdateProduct,
    ChangePrice,
    DeleteProduct,
}

impl ProductCommandType {
    pub const ALL: [ProductCommandType; 4] = [
        ProductCommandType::CreateProduct,
        ProductCommandType::UpdateProduct,
        ProductCommandType::ChangePrice,
        ProductCommandType::DeleteProduct,
    ];
}

impl core::fmt::Display for ProductCommandType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ProductCommandType::CreateProduct => "CreateProduct",
            ProductCommandType::UpdateProduct => "UpdateProduct",
            ProductCommandType::ChangePrice => "ChangePrice",
            ProductCommandType::DeleteProduct => "DeleteProduct",
        })
    }
}

impl Command for ProductCommand {
    type Kind = ProductCommandType;

    fn kind(&self) -> Self::Kind {
        match self {
            ProductCommand::CreateProduct(_) => ProductCommandType::CreateProduct,
            ProductCommand::UpdateProduct(_) => ProductCommandType::UpdateProduct,
            ProductCommand::ChangePrice(_) => ProductCommandType::ChangePrice,
            ProductCommand::DeleteProduct(_) => ProductCommandType::DeleteProduct,
        }
    }
}

/// Event: ProductCreated. Carries the full validated initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub sku: String,
    pub name: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_at_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

/// Event: ProductUpdated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductUpdated {
    pub field: ProductField,
    pub value: JsonValue,
}

/// Event: PriceChanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChanged {
    pub old_price: f64,
    pub new_price: f64,
}

/// Event: ProductDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductDeleted {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProductEvent {
    ProductCreated(ProductCreated),
    ProductUpdated(ProductUpdated),
    PriceChanged(PriceChanged),
    ProductDeleted(ProductDeleted),
}

impl Event for ProductEvent {
    fn event_type(&self) -> EventType {
        match self {
            ProductEvent::ProductCreated(_) => EventType::ProductCreated,
            ProductEvent::ProductUpdated(_) => EventType::ProductUpdated,
            ProductEvent::PriceChanged(_) => EventType::PriceChanged,
            ProductEvent::ProductDeleted(_) => EventType::ProductDeleted,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            ProductEvent::ProductCreated(e) => serde_json::to_value(e),
            ProductEvent::ProductUpdated(e) => serde_json::to_value(e),
            ProductEvent::PriceChanged(e) => serde_json::to_value(e),
            ProductEvent::ProductDeleted(e) => serde_json::to_value(e),
        }
    }
}

/// Typed view of a replayed product aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub sku: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub compare_at_price: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl ProductSnapshot {
    /// `Ok(None)` when no event has been applied yet.
    pub fn from_state(state: &AggregateState) -> DomainResult<Option<Self>> {
        if state.is_empty() {
            return Ok(None);
        }
        serde_json::from_value(state.clone().into_value())
            .map(Some)
            .map_err(|e| DomainError::invariant(format!("product state is unreadable: {e}")))
    }
}
