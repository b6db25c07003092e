use std::sync::Arc;

use pixel_common::event::{CanonicalEvent, EventType};
use pixel_common::platform::Platform;
use serde_json::{json, Value};

use super::{compact, CommerceFields, DispatchOutcome, HookHandle, LineItem, PixelAdapter};
use crate::catalog::CatalogSnapshot;
use crate::error::DispatchError;
use crate::hooks::HookRegistry;

/// GA4 recommended event names.
fn ga4_event_name(event_type: &EventType) -> &str {
    match event_type {
        EventType::PageView => "page_view",
        EventType::ViewContent => "view_item",
        EventType::AddToCart => "add_to_cart",
        EventType::BeginCheckout => "begin_checkout",
        EventType::Purchase => "purchase",
        EventType::Search => "search",
        EventType::Custom(name) => name,
    }
}

fn ga4_items(items: &[LineItem]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| {
                json!({
                    "item_id": item.id,
                    "item_name": item.name,
                    "item_category": item.category,
                    "price": item.price,
                    "quantity": item.quantity,
                })
            })
            .collect(),
    )
}

fn catalog_items(catalog: &CatalogSnapshot) -> Value {
    Value::Array(
        catalog
            .priced_products()
            .map(|(product, price)| {
                json!({
                    "item_id": product.id,
                    "item_name": product.name,
                    "item_category": product.category,
                    "price": price,
                })
            })
            .collect(),
    )
}

fn page_params(event: &CanonicalEvent, destination_id: &str) -> Value {
    json!({
        "send_to": destination_id,
        "page_location": event.field("page_url"),
        "page_title": event.field("page_title"),
        "page_referrer": event.field("referrer_url"),
    })
}

/// Google Analytics 4 through `gtag('event', name, params)`.
pub struct GoogleAnalyticsAdapter {
    hook: HookHandle,
    default_currency: String,
}

impl GoogleAnalyticsAdapter {
    pub fn new(hooks: Arc<HookRegistry>, default_currency: &str) -> Self {
        Self {
            hook: HookHandle::new(Platform::GoogleAnalytics, hooks),
            default_currency: default_currency.to_owned(),
        }
    }
}

impl PixelAdapter for GoogleAnalyticsAdapter {
    fn platform(&self) -> Platform {
        Platform::GoogleAnalytics
    }

    fn is_available(&self) -> bool {
        self.hook.is_available()
    }

    fn dispatch(
        &self,
        event: &CanonicalEvent,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let name = ga4_event_name(&event.event_type);
        let params = match &event.event_type {
            EventType::PageView => page_params(event, destination_id),
            EventType::Custom(_) => {
                let mut params = event.payload.clone();
                params.insert("send_to".to_owned(), json!(destination_id));
                Value::Object(params)
            }
            _ => {
                let fields = CommerceFields::from_event(event, &self.default_currency);
                json!({
                    "send_to": destination_id,
                    "currency": fields.currency,
                    "value": fields.value,
                    "items": ga4_items(&fields.items),
                    "transaction_id": fields.transaction_id,
                    "search_term": fields.search_term,
                })
            }
        };

        self.hook
            .call("event", vec![json!(name), compact(params)])
    }

    fn sync_catalog(
        &self,
        catalog: &CatalogSnapshot,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.hook.call(
            "event",
            vec![
                json!("view_item_list"),
                compact(json!({
                    "send_to": destination_id,
                    "item_list_id": "catalog",
                    "item_list_name": "Catalog",
                    "currency": catalog.currency(),
                    "value": catalog.total_value(),
                    "items": catalog_items(catalog),
                })),
            ],
        )
    }
}

/// Google Ads remarketing and conversions. Purchases become a `conversion` event sent to
/// the destination id (`AW-XXXX/label`); the rest are forwarded as GA4 ecommerce events.
pub struct GoogleAdsAdapter {
    hook: HookHandle,
    default_currency: String,
}

impl GoogleAdsAdapter {
    pub fn new(hooks: Arc<HookRegistry>, default_currency: &str) -> Self {
        Self {
            hook: HookHandle::new(Platform::GoogleAds, hooks),
            default_currency: default_currency.to_owned(),
        }
    }
}

impl PixelAdapter for GoogleAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::GoogleAds
    }

    fn is_available(&self) -> bool {
        self.hook.is_available()
    }

    fn dispatch(
        &self,
        event: &CanonicalEvent,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let fields = CommerceFields::from_event(event, &self.default_currency);
        let (name, params) = match &event.event_type {
            EventType::Custom(_) => return Ok(DispatchOutcome::Unsupported),
            EventType::PageView => ("page_view", page_params(event, destination_id)),
            EventType::Purchase => (
                "conversion",
                json!({
                    "send_to": destination_id,
                    "value": fields.value,
                    "currency": fields.currency,
                    "transaction_id": fields.transaction_id,
                }),
            ),
            other => (
                ga4_event_name(other),
                json!({
                    "send_to": destination_id,
                    "value": fields.value,
                    "currency": fields.currency,
                    "items": fields
                        .items
                        .iter()
                        .map(|item| json!({"id": item.id, "google_business_vertical": "retail"}))
                        .collect::<Vec<_>>(),
                    "search_term": fields.search_term,
                }),
            ),
        };

        self.hook
            .call("event", vec![json!(name), compact(params)])
    }

    fn sync_catalog(
        &self,
        catalog: &CatalogSnapshot,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.hook.call(
            "event",
            vec![
                json!("view_item_list"),
                json!({
                    "send_to": destination_id,
                    "value": catalog.total_value(),
                    "currency": catalog.currency(),
                    "items": catalog
                        .content_ids()
                        .into_iter()
                        .map(|id| json!({"id": id, "google_business_vertical": "retail"}))
                        .collect::<Vec<_>>(),
                }),
            ],
        )
    }
}
