//! Platforms whose snippets take a single `track(name, params)`-style call: Pinterest,
//! Snapchat, X (Twitter), LinkedIn, Microsoft UET and Reddit. They differ in their event name
//! tables and parameter names, not in how they are invoked.
use std::sync::Arc;

use pixel_common::event::{CanonicalEvent, EventType};
use pixel_common::platform::Platform;
use serde_json::{json, Value};

use super::{compact, CommerceFields, DispatchOutcome, HookHandle, PixelAdapter};
use crate::catalog::CatalogSnapshot;
use crate::error::DispatchError;
use crate::hooks::HookRegistry;

pub struct StandardEventAdapter {
    platform: Platform,
    hook: HookHandle,
    default_currency: String,
}

impl StandardEventAdapter {
    pub fn new(platform: Platform, hooks: Arc<HookRegistry>, default_currency: &str) -> Self {
        Self {
            platform,
            hook: HookHandle::new(platform, hooks),
            default_currency: default_currency.to_owned(),
        }
    }

    /// The platform's name for an event, or `None` when it has no equivalent.
    fn event_name<'a>(&self, event_type: &'a EventType) -> Option<&'a str> {
        use EventType as E;

        let name = match (self.platform, event_type) {
            (Platform::PinterestTag, E::PageView | E::ViewContent) => "pagevisit",
            (Platform::PinterestTag, E::AddToCart) => "addtocart",
            (Platform::PinterestTag, E::Purchase) => "checkout",
            (Platform::PinterestTag, E::Search) => "search",
            (Platform::PinterestTag, E::Custom(_)) => "custom",

            (Platform::SnapchatPixel, E::PageView) => "PAGE_VIEW",
            (Platform::SnapchatPixel, E::ViewContent) => "VIEW_CONTENT",
            (Platform::SnapchatPixel, E::AddToCart) => "ADD_CART",
            (Platform::SnapchatPixel, E::BeginCheckout) => "START_CHECKOUT",
            (Platform::SnapchatPixel, E::Purchase) => "PURCHASE",
            (Platform::SnapchatPixel, E::Search) => "SEARCH",

            (Platform::TwitterPixel, E::PageView) => "PageView",
            (Platform::TwitterPixel, E::ViewContent) => "ViewContent",
            (Platform::TwitterPixel, E::AddToCart) => "AddToCart",
            (Platform::TwitterPixel, E::BeginCheckout) => "InitiateCheckout",
            (Platform::TwitterPixel, E::Purchase) => "Purchase",
            (Platform::TwitterPixel, E::Search) => "Search",

            // The insight tag records page views itself; only conversions are sent.
            (Platform::LinkedinInsight, E::Purchase) => "conversion",

            (Platform::MicrosoftUet, E::PageView) => "page_view",
            (Platform::MicrosoftUet, E::ViewContent) => "view_item",
            (Platform::MicrosoftUet, E::AddToCart) => "add_to_cart",
            (Platform::MicrosoftUet, E::BeginCheckout) => "begin_checkout",
            (Platform::MicrosoftUet, E::Purchase) => "purchase",
            (Platform::MicrosoftUet, E::Search) => "search",
            (Platform::MicrosoftUet, E::Custom(name)) => name,

            (Platform::RedditPixel, E::PageView) => "PageVisit",
            (Platform::RedditPixel, E::ViewContent) => "ViewContent",
            (Platform::RedditPixel, E::AddToCart) => "AddToCart",
            (Platform::RedditPixel, E::Purchase) => "Purchase",
            (Platform::RedditPixel, E::Search) => "Search",
            (Platform::RedditPixel, E::Custom(_)) => "Custom",

            _ => return None,
        };
        Some(name)
    }

    fn params(&self, event: &CanonicalEvent, destination_id: &str) -> Value {
        let fields = CommerceFields::from_event(event, &self.default_currency);

        let params = match self.platform {
            Platform::PinterestTag => json!({
                "value": fields.value,
                "currency": fields.currency,
                "order_quantity": fields.quantity(),
                "order_id": fields.transaction_id,
                "search_query": fields.search_term,
                "event_name": custom_name(event),
                "line_items": fields
                    .items
                    .iter()
                    .map(|item| json!({
                        "product_id": item.id,
                        "product_name": item.name,
                        "product_category": item.category,
                        "product_price": item.price,
                        "product_quantity": item.quantity,
                    }))
                    .collect::<Vec<_>>(),
            }),
            Platform::SnapchatPixel => json!({
                "price": fields.value,
                "currency": fields.currency,
                "item_ids": fields.item_ids(),
                "number_items": fields.quantity(),
                "transaction_id": fields.transaction_id,
                "search_string": fields.search_term,
            }),
            Platform::TwitterPixel => json!({
                "value": fields.value,
                "currency": fields.currency,
                "num_items": fields.quantity(),
                "content_ids": fields.item_ids(),
                "order_id": fields.transaction_id,
                "search_string": fields.search_term,
            }),
            Platform::LinkedinInsight => json!({
                "conversion_id": destination_id,
                "value": fields.value,
                "currency": fields.currency,
            }),
            Platform::MicrosoftUet => json!({
                "revenue_value": fields.value,
                "currency": fields.currency,
                "ecomm_prodid": fields.item_ids(),
                "ecomm_totalvalue": fields.value,
                "transaction_id": fields.transaction_id,
                "search_term": fields.search_term,
            }),
            Platform::RedditPixel => json!({
                "value": fields.value,
                "currency": fields.currency,
                "itemCount": fields.quantity(),
                "transactionId": fields.transaction_id,
                "customEventName": custom_name(event),
                "products": fields
                    .items
                    .iter()
                    .map(|item| {
                        json!({"id": item.id, "name": item.name, "category": item.category})
                    })
                    .collect::<Vec<_>>(),
            }),
            _ => Value::Object(event.payload.clone()),
        };
        compact(params)
    }

    /// Build the hook call for `name`: `(method, args)`.
    fn call_shape(
        &self,
        name: &str,
        params: Value,
        destination_id: &str,
    ) -> (&'static str, Vec<Value>) {
        match self.platform {
            Platform::LinkedinInsight => ("track", vec![params]),
            Platform::MicrosoftUet => ("push", vec![json!("event"), json!(name), params]),
            // The event tag id addresses the account: twq('event', id, params).
            Platform::TwitterPixel => {
                let mut params = params;
                if let Value::Object(ref mut map) = params {
                    map.insert("event".to_owned(), json!(name));
                }
                ("event", vec![json!(destination_id), params])
            }
            _ => ("track", vec![json!(name), params]),
        }
    }
}

fn custom_name(event: &CanonicalEvent) -> Option<&str> {
    match &event.event_type {
        EventType::Custom(name) => Some(name),
        _ => None,
    }
}

impl PixelAdapter for StandardEventAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn is_available(&self) -> bool {
        self.hook.is_available()
    }

    fn dispatch(
        &self,
        event: &CanonicalEvent,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(name) = self.event_name(&event.event_type) else {
            return Ok(DispatchOutcome::Unsupported);
        };
        let params = self.params(event, destination_id);
        let (method, args) = self.call_shape(name, params, destination_id);
        self.hook.call(method, args)
    }

    fn sync_catalog(
        &self,
        catalog: &CatalogSnapshot,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let ids = catalog.content_ids();
        let (name, params) = match self.platform {
            Platform::PinterestTag => (
                "pagevisit",
                json!({
                    "value": catalog.total_value(),
                    "currency": catalog.currency(),
                    "line_items": catalog
                        .priced_products()
                        .map(|(product, price)| json!({
                            "product_id": product.id,
                            "product_name": product.name,
                            "product_price": price,
                        }))
                        .collect::<Vec<_>>(),
                }),
            ),
            Platform::SnapchatPixel => (
                "VIEW_CONTENT",
                json!({
                    "price": catalog.total_value(),
                    "currency": catalog.currency(),
                    "item_ids": ids,
                    "number_items": catalog.len(),
                }),
            ),
            Platform::TwitterPixel => (
                "ViewContent",
                json!({
                    "value": catalog.total_value(),
                    "currency": catalog.currency(),
                    "content_ids": ids,
                    "num_items": catalog.len(),
                }),
            ),
            Platform::MicrosoftUet => (
                "view_item_list",
                json!({
                    "ecomm_prodid": ids,
                    "ecomm_pagetype": "category",
                    "ecomm_totalvalue": catalog.total_value(),
                    "currency": catalog.currency(),
                }),
            ),
            Platform::RedditPixel => (
                "ViewContent",
                json!({
                    "value": catalog.total_value(),
                    "currency": catalog.currency(),
                    "itemCount": catalog.len(),
                    "products": ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
                }),
            ),
            _ => return Ok(DispatchOutcome::Unsupported),
        };

        let (method, args) = self.call_shape(name, params, destination_id);
        self.hook.call(method, args)
    }
}
