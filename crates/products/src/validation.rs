//! Business rules for product payloads.
//!
//! Validation collects **every** violation before failing so callers can report
//! them together. Nothing here touches state; the decision functions call these
//! before emitting any event.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as JsonValue;

use atelier_core::{DomainError, DomainResult};

use crate::product::{CreateProduct, ProductField};

pub const MAX_NAME_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 5_000;
pub const MAX_IMAGES: usize = 20;
pub const MAX_PRICE: f64 = 100_000.0;

/// 2-5 lowercase letters, a hyphen, 3 digits (e.g. `br-001`).
static SKU_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,5}-[0-9]{3}$").expect("Invalid SKU regex"));

pub fn is_valid_sku(sku: &str) -> bool {
    SKU_PATTERN.is_match(sku)
}

pub fn validate_price(price: f64) -> Result<(), String> {
    if !price.is_finite() {
        return Err("price must be a number".to_string());
    }
    if !(0.0..=MAX_PRICE).contains(&price) {
        return Err(format!("price must be between 0 and {MAX_PRICE}"));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name is required".to_string());
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(format!("name must be at most {MAX_NAME_CHARS} characters"));
    }
    Ok(())
}

fn validate_compare_at_price(price: f64) -> Result<(), String> {
    if !price.is_finite() || price < 0.0 {
        return Err("compare_at_price must be a number >= 0".to_string());
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), String> {
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(format!(
            "description must be at most {MAX_DESCRIPTION_CHARS} characters"
        ));
    }
    Ok(())
}

fn validate_image_count(count: usize) -> Result<(), String> {
    if count > MAX_IMAGES {
        return Err(format!("at most {MAX_IMAGES} images are allowed"));
    }
    Ok(())
}

pub fn validate_create(cmd: &CreateProduct) -> DomainResult<()> {
    let mut violations = Vec::new();

    if !is_valid_sku(&cmd.sku) {
        violations.push(format!(
            "sku '{}' must be 2-5 lowercase letters, a hyphen and 3 digits",
            cmd.sku
        ));
    }

    let checks = [
        validate_name(&cmd.name),
        validate_price(cmd.price),
        cmd.compare_at_price.map_or(Ok(()), validate_compare_at_price),
        cmd.description.as_deref().map_or(Ok(()), validate_description),
        validate_image_count(cmd.images.len()),
    ];
    violations.extend(checks.into_iter().filter_map(Result::err));

    DomainError::from_violations(violations)
}

/// Apply the `CreateProduct` rule for a single field to an update value.
///
/// Optional fields accept `null` to clear them.
pub fn validate_field(field: ProductField, value: &JsonValue) -> DomainResult<()> {
    let outcome = match (field, value) {
        (ProductField::Name, JsonValue::String(s)) => validate_name(s),
        (ProductField::Name, _) => Err("name must be a string".to_string()),

        (ProductField::Description, JsonValue::Null) => Ok(()),
        (ProductField::Description, JsonValue::String(s)) => validate_description(s),
        (ProductField::Description, _) => Err("description must be a string".to_string()),

        (ProductField::CompareAtPrice, JsonValue::Null) => Ok(()),
        (ProductField::CompareAtPrice, JsonValue::Number(n)) => n
            .as_f64()
            .map_or_else(|| Err("compare_at_price must be a number".to_string()), validate_compare_at_price),
        (ProductField::CompareAtPrice, _) => Err("compare_at_price must be a number".to_string()),

        (ProductField::Images, JsonValue::Array(items)) => {
            if items.iter().all(JsonValue::is_string) {
                validate_image_count(items.len())
            } else {
                Err("images must be a list of strings".to_string())
            }
        }
        (ProductField::Images, _) => Err("images must be a list of strings".to_string()),

        (ProductField::Collection, JsonValue::Null | JsonValue::String(_)) => Ok(()),
        (ProductField::Collection, _) => Err("collection must be a string".to_string()),
    };

    outcome.map_err(DomainError::validation)
}
