use std::sync::Arc;

use pixel_common::event::{CanonicalEvent, EventType};
use pixel_common::platform::Platform;
use serde_json::{json, Value};

use super::{compact, CommerceFields, DispatchOutcome, HookHandle, PixelAdapter};
use crate::catalog::CatalogSnapshot;
use crate::error::DispatchError;
use crate::hooks::HookRegistry;

fn event_name(event_type: &EventType) -> &str {
    match event_type {
        EventType::PageView => "Pageview",
        EventType::ViewContent => "ViewContent",
        EventType::AddToCart => "AddToCart",
        EventType::BeginCheckout => "InitiateCheckout",
        EventType::Purchase => "CompletePayment",
        EventType::Search => "Search",
        EventType::Custom(name) => name,
    }
}

/// TikTok Pixel. Calls are addressed to one pixel instance:
/// `ttq.instance(id).page()` and `ttq.instance(id).track(name, params)`.
pub struct TiktokPixelAdapter {
    hook: HookHandle,
    default_currency: String,
}

impl TiktokPixelAdapter {
    pub fn new(hooks: Arc<HookRegistry>, default_currency: &str) -> Self {
        Self {
            hook: HookHandle::new(Platform::TiktokPixel, hooks),
            default_currency: default_currency.to_owned(),
        }
    }
}

impl PixelAdapter for TiktokPixelAdapter {
    fn platform(&self) -> Platform {
        Platform::TiktokPixel
    }

    fn is_available(&self) -> bool {
        self.hook.is_available()
    }

    fn dispatch(
        &self,
        event: &CanonicalEvent,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        if event.event_type == EventType::PageView {
            return self.hook.call("instance.page", vec![json!(destination_id)]);
        }

        let fields = CommerceFields::from_event(event, &self.default_currency);
        let params = compact(json!({
            "contents": fields
                .items
                .iter()
                .map(|item| json!({
                    "content_id": item.id,
                    "content_name": item.name,
                    "content_category": item.category,
                    "quantity": item.quantity,
                    "price": item.price,
                }))
                .collect::<Vec<_>>(),
            "content_type": "product",
            "value": fields.value,
            "currency": fields.currency,
            "query": fields.search_term,
            "order_id": fields.transaction_id,
        }));

        self.hook.call(
            "instance.track",
            vec![json!(destination_id), json!(event_name(&event.event_type)), params],
        )
    }

    fn sync_catalog(
        &self,
        catalog: &CatalogSnapshot,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let contents: Vec<Value> = catalog
            .priced_products()
            .map(|(product, price)| {
                json!({"content_id": product.id, "content_name": product.name, "price": price})
            })
            .collect();

        self.hook.call(
            "instance.track",
            vec![
                json!(destination_id),
                json!("ViewContent"),
                json!({
                    "contents": contents,
                    "content_type": "product_group",
                    "value": catalog.total_value(),
                    "currency": catalog.currency(),
                }),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingHook;

    #[test]
    fn page_view_targets_instance() {
        let hooks = Arc::new(HookRegistry::new());
        let hook = RecordingHook::default();
        hooks.install(Platform::TiktokPixel, Arc::new(hook.clone()));
        let adapter = TiktokPixelAdapter::new(hooks, "USD");

        adapter
            .dispatch(&CanonicalEvent::new(EventType::PageView, Default::default()), "TT-1")
            .unwrap();
        adapter
            .dispatch(
                &CanonicalEvent::purchase(
                    "ORD-1",
                    json!({"item_id": "neem", "price": -5}).as_object().unwrap().clone(),
                ),
                "TT-1",
            )
            .unwrap();

        let calls = hook.calls();
        assert_eq!(calls[0].method, "instance.page");
        assert_eq!(calls[0].args, vec![json!("TT-1")]);
        assert_eq!(calls[1].method, "instance.track");
        assert_eq!(calls[1].args[1], json!("CompletePayment"));
        assert_eq!(calls[1].args[2]["contents"][0]["price"], json!(0.0));
        assert_eq!(calls[1].args[2]["order_id"], json!("ORD-1"));
    }
}
