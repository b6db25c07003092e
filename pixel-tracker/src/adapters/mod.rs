//! Translation of canonical events into each advertising platform's call shape.
//!
//! Every adapter looks its platform hook up on each call. A missing hook means the platform's
//! script has not loaded (or is blocked) and yields [`DispatchOutcome::Unavailable`], which is
//! not an error.
use std::collections::HashMap;
use std::sync::Arc;

use pixel_common::event::CanonicalEvent;
use pixel_common::platform::Platform;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::catalog::CatalogSnapshot;
use crate::error::DispatchError;
use crate::hooks::HookRegistry;
use crate::metrics_consts::SANITIZED_VALUES_TOTAL;

mod gtag;
mod meta;
mod standard;
mod tiktok;

pub use gtag::{GoogleAdsAdapter, GoogleAnalyticsAdapter};
pub use meta::MetaPixelAdapter;
pub use standard::StandardEventAdapter;
pub use tiktok::TiktokPixelAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The platform call was made.
    Sent,
    /// The platform hook is not present; nothing was called.
    Unavailable,
    /// The platform has no equivalent for this event.
    Unsupported,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent => "sent",
            DispatchOutcome::Unavailable => "unavailable",
            DispatchOutcome::Unsupported => "unsupported",
        }
    }
}

pub trait PixelAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether the platform's hook is currently present.
    fn is_available(&self) -> bool;

    fn dispatch(
        &self,
        event: &CanonicalEvent,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError>;

    /// Push a whole catalog snapshot as one bulk call.
    fn sync_catalog(
        &self,
        catalog: &CatalogSnapshot,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Presence-checked access to one platform's hook.
#[derive(Clone)]
pub(crate) struct HookHandle {
    platform: Platform,
    hooks: Arc<HookRegistry>,
}

impl HookHandle {
    pub(crate) fn new(platform: Platform, hooks: Arc<HookRegistry>) -> Self {
        Self { platform, hooks }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.hooks.is_installed(self.platform)
    }

    pub(crate) fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(hook) = self.hooks.get(self.platform) else {
            return Ok(DispatchOutcome::Unavailable);
        };
        hook.call(method, args)
            .map(|_| DispatchOutcome::Sent)
            .map_err(|source| DispatchError::Hook {
                platform: self.platform,
                method: method.to_owned(),
                source,
            })
    }
}

/// One product line as every adapter sees it, after sanitation.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub id: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub price: f64,
    pub quantity: u64,
}

/// Commerce fields extracted from a canonical event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommerceFields {
    pub items: Vec<LineItem>,
    pub value: f64,
    pub currency: String,
    pub transaction_id: Option<String>,
    pub search_term: Option<String>,
}

impl CommerceFields {
    /// Accepts either an `items` array or a single product described by top-level
    /// `item_id`/`item_name`/`price`/`quantity` fields. `value` falls back to the sum of
    /// `price * quantity` over the items.
    pub fn from_event(event: &CanonicalEvent, default_currency: &str) -> Self {
        let items: Vec<LineItem> = match event.field("items").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(line_item)
                .collect(),
            None => line_item(&event.payload).into_iter().collect(),
        };

        let items_total: f64 = items
            .iter()
            .map(|item| item.price * item.quantity as f64)
            .sum();
        let value = match event.field("value") {
            Some(raw) => sanitize_price("value", Some(raw)),
            None => items_total,
        };

        let currency = event
            .str_field("currency")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| default_currency.to_owned());

        let transaction_id = event
            .order_id
            .clone()
            .or_else(|| event.str_field("transaction_id").map(str::to_owned));

        let search_term = ["search_term", "query", "q"]
            .iter()
            .find_map(|key| event.str_field(key))
            .map(str::to_owned);

        Self {
            items,
            value,
            currency,
            transaction_id,
            search_term,
        }
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn quantity(&self) -> u64 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}

fn line_item(fields: &Map<String, Value>) -> Option<LineItem> {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| fields.get(*key))
            .and_then(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    };

    let id = text(&["item_id", "product_id", "id"])?;
    Some(LineItem {
        id,
        name: text(&["item_name", "product_name", "name"]),
        category: text(&["item_category", "category"]),
        price: sanitize_price("price", fields.get("price")),
        quantity: sanitize_quantity(fields.get("quantity")),
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Missing is 0. Non-numeric or negative is 0 and logged.
pub fn sanitize_price(field: &'static str, raw: Option<&Value>) -> f64 {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return 0.0;
    };
    match as_number(raw) {
        Some(price) if price >= 0.0 => price,
        _ => {
            warn!(field, value = %raw, "invalid monetary value, using 0");
            metrics::counter!(SANITIZED_VALUES_TOTAL, "field" => field).increment(1);
            0.0
        }
    }
}

/// Missing is 1. Non-numeric or non-positive is 1 and logged.
pub fn sanitize_quantity(raw: Option<&Value>) -> u64 {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return 1;
    };
    match as_number(raw) {
        Some(quantity) if quantity >= 1.0 => quantity.floor() as u64,
        _ => {
            warn!(value = %raw, "invalid quantity, using 1");
            metrics::counter!(SANITIZED_VALUES_TOTAL, "field" => "quantity").increment(1);
            1
        }
    }
}

/// Strip nulls so platform payloads only carry the fields that are set.
pub(crate) fn compact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, compact(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(compact).collect()),
        other => other,
    }
}

pub(crate) fn catalog_summary_fields(catalog: &CatalogSnapshot) -> Value {
    json!({
        "value": catalog.total_value(),
        "currency": catalog.currency(),
        "num_items": catalog.len(),
        "content_ids": catalog.content_ids(),
    })
}

/// Adapters keyed by platform.
pub struct AdapterSet {
    adapters: HashMap<Platform, Arc<dyn PixelAdapter>>,
}

impl AdapterSet {
    /// An adapter for every known platform, all reading hooks from `hooks`.
    pub fn for_all_platforms(hooks: Arc<HookRegistry>, default_currency: &str) -> Self {
        let mut set = Self::empty();
        for platform in Platform::ALL {
            let adapter: Arc<dyn PixelAdapter> = match platform {
                Platform::GoogleAnalytics => Arc::new(GoogleAnalyticsAdapter::new(
                    hooks.clone(),
                    default_currency,
                )),
                Platform::GoogleAds => {
                    Arc::new(GoogleAdsAdapter::new(hooks.clone(), default_currency))
                }
                Platform::MetaPixel => {
                    Arc::new(MetaPixelAdapter::new(hooks.clone(), default_currency))
                }
                Platform::TiktokPixel => {
                    Arc::new(TiktokPixelAdapter::new(hooks.clone(), default_currency))
                }
                other => Arc::new(StandardEventAdapter::new(
                    other,
                    hooks.clone(),
                    default_currency,
                )),
            };
            set.insert(adapter);
        }
        set
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter, replacing any previous one for its platform.
    pub fn insert(&mut self, adapter: Arc<dyn PixelAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PixelAdapter>> {
        self.adapters.get(&platform).cloned()
    }
}
