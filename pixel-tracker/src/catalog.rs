use pixel_common::event::{EventType, Payload};
use pixel_common::fingerprint::EventHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::sanitize_price;

/// A product as the storefront lists it. The price is kept raw so malformed values are
/// clamped during sync instead of rejecting the whole snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub availability: Option<String>,
}

impl Product {
    pub fn is_available(&self) -> bool {
        !matches!(
            self.availability
                .as_deref()
                .map(|a| a.trim().to_ascii_lowercase())
                .as_deref(),
            Some("out of stock" | "out_of_stock" | "discontinued")
        )
    }
}

/// A full-replace catalog snapshot with its precomputed aggregates.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    products: Vec<Product>,
    prices: Vec<f64>,
    currency: String,
}

impl CatalogSnapshot {
    pub fn new(products: Vec<Product>, currency: &str) -> Self {
        let prices = products
            .iter()
            .map(|product| sanitize_price("price", Some(&product.price)))
            .collect();
        Self {
            products,
            prices,
            currency: currency.to_owned(),
        }
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Products paired with their sanitized price.
    pub fn priced_products(&self) -> impl Iterator<Item = (&Product, f64)> {
        self.products.iter().zip(self.prices.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn total_value(&self) -> f64 {
        self.prices.iter().sum()
    }

    pub fn available_count(&self) -> usize {
        self.products.iter().filter(|p| p.is_available()).count()
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn content_ids(&self) -> Vec<String> {
        self.products.iter().map(|p| p.id.clone()).collect()
    }

    /// Stable digest of the snapshot contents, used to skip re-syncing an unchanged catalog.
    pub fn fingerprint(&self, hasher: &EventHasher) -> String {
        let mut payload = Payload::new();
        payload.insert(
            "products".to_owned(),
            serde_json::to_value(&self.products).unwrap_or(Value::Null),
        );
        payload.insert("currency".to_owned(), Value::String(self.currency.clone()));
        hasher.hash(&EventType::Custom("catalog_sync".to_owned()), &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(id: &str, price: Value, availability: Option<&str>) -> Product {
        Product {
            id: id.to_owned(),
            name: format!("{id} powder"),
            price,
            category: Some("herbs".to_owned()),
            images: vec![],
            availability: availability.map(str::to_owned),
        }
    }

    #[test]
    fn aggregates_clamp_bad_prices() {
        let snapshot = CatalogSnapshot::new(
            vec![
                product("amla", json!(150), Some("in stock")),
                product("triphala", json!("200.5"), None),
                product("shatavari", json!("call us"), Some("out of stock")),
                product("guduchi", json!(-10), Some("in stock")),
            ],
            "INR",
        );

        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.total_value(), 350.5);
        assert_eq!(snapshot.available_count(), 3);
        assert_eq!(
            snapshot.content_ids(),
            vec!["amla", "triphala", "shatavari", "guduchi"]
        );
    }

    #[test]
    fn fingerprint_tracks_content_changes() {
        let hasher = EventHasher::default();
        let a = CatalogSnapshot::new(vec![product("amla", json!(150), None)], "INR");
        let same = CatalogSnapshot::new(vec![product("amla", json!(150), None)], "INR");
        let repriced = CatalogSnapshot::new(vec![product("amla", json!(175), None)], "INR");

        assert_eq!(a.fingerprint(&hasher), same.fingerprint(&hasher));
        assert_ne!(a.fingerprint(&hasher), repriced.fingerprint(&hasher));
    }

    #[test]
    fn deserializes_with_defaults() {
        let product: Product =
            serde_json::from_value(json!({"id": "neem", "name": "Neem"})).unwrap();
        assert_eq!(product.price, Value::Null);
        assert!(product.is_available());
    }
}
