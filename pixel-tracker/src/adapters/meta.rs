use std::sync::Arc;

use pixel_common::event::{CanonicalEvent, EventType};
use pixel_common::platform::Platform;
use serde_json::{json, Value};

use super::{
    catalog_summary_fields, compact, CommerceFields, DispatchOutcome, HookHandle, PixelAdapter,
};
use crate::catalog::CatalogSnapshot;
use crate::error::DispatchError;
use crate::hooks::HookRegistry;

/// Meta standard event names.
fn standard_event_name(event_type: &EventType) -> Option<&'static str> {
    match event_type {
        EventType::PageView => Some("PageView"),
        EventType::ViewContent => Some("ViewContent"),
        EventType::AddToCart => Some("AddToCart"),
        EventType::BeginCheckout => Some("InitiateCheckout"),
        EventType::Purchase => Some("Purchase"),
        EventType::Search => Some("Search"),
        EventType::Custom(_) => None,
    }
}

/// Meta Pixel through `fbq('trackSingle', pixelId, name, params, options)`, so several pixels
/// on one page each only receive their own events.
pub struct MetaPixelAdapter {
    hook: HookHandle,
    default_currency: String,
}

impl MetaPixelAdapter {
    pub fn new(hooks: Arc<HookRegistry>, default_currency: &str) -> Self {
        Self {
            hook: HookHandle::new(Platform::MetaPixel, hooks),
            default_currency: default_currency.to_owned(),
        }
    }
}

impl PixelAdapter for MetaPixelAdapter {
    fn platform(&self) -> Platform {
        Platform::MetaPixel
    }

    fn is_available(&self) -> bool {
        self.hook.is_available()
    }

    fn dispatch(
        &self,
        event: &CanonicalEvent,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(name) = standard_event_name(&event.event_type) else {
            return self.hook.call(
                "trackSingleCustom",
                vec![
                    json!(destination_id),
                    json!(event.event_type.as_str()),
                    Value::Object(event.payload.clone()),
                ],
            );
        };

        if event.event_type == EventType::PageView {
            return self
                .hook
                .call("trackSingle", vec![json!(destination_id), json!(name)]);
        }

        let fields = CommerceFields::from_event(event, &self.default_currency);
        let params = compact(json!({
            "content_ids": fields.item_ids(),
            "content_type": "product",
            "contents": fields
                .items
                .iter()
                .map(|item| {
                    json!({"id": item.id, "quantity": item.quantity, "item_price": item.price})
                })
                .collect::<Vec<_>>(),
            "content_name": fields.items.first().and_then(|item| item.name.clone()),
            "content_category": fields.items.first().and_then(|item| item.category.clone()),
            "value": fields.value,
            "currency": fields.currency,
            "num_items": fields.quantity(),
            "search_string": fields.search_term,
        }));

        let mut args = vec![json!(destination_id), json!(name), params];
        // The order id doubles as Meta's event id, letting Meta drop copies sent server-side.
        if let Some(order_id) = fields.transaction_id {
            args.push(json!({ "eventID": order_id }));
        }
        self.hook.call("trackSingle", args)
    }

    fn sync_catalog(
        &self,
        catalog: &CatalogSnapshot,
        destination_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut params = catalog_summary_fields(catalog);
        params["content_type"] = json!("product_group");
        self.hook.call(
            "trackSingle",
            vec![json!(destination_id), json!("ViewContent"), params],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingHook;

    fn setup() -> (MetaPixelAdapter, RecordingHook) {
        let hooks = Arc::new(HookRegistry::new());
        let hook = RecordingHook::default();
        hooks.install(Platform::MetaPixel, Arc::new(hook.clone()));
        (MetaPixelAdapter::new(hooks, "USD"), hook)
    }

    #[test]
    fn purchase_carries_event_id() {
        let (adapter, hook) = setup();
        let purchase = CanonicalEvent::purchase(
            "ORD-42",
            json!({"items": [{"id": "tulsi", "price": 10, "quantity": 3}]})
                .as_object()
                .unwrap()
                .clone(),
        );

        adapter.dispatch(&purchase, "PIXEL-1").unwrap();

        let call = hook.last().unwrap();
        assert_eq!(call.method, "trackSingle");
        assert_eq!(call.args[0], json!("PIXEL-1"));
        assert_eq!(call.args[1], json!("Purchase"));
        assert_eq!(call.args[2]["value"], json!(30.0));
        assert_eq!(call.args[2]["num_items"], json!(3));
        assert_eq!(call.args[2]["content_ids"], json!(["tulsi"]));
        assert_eq!(call.args[3], json!({"eventID": "ORD-42"}));
    }

    #[test]
    fn begin_checkout_maps_to_initiate_checkout() {
        let (adapter, hook) = setup();
        adapter
            .dispatch(
                &CanonicalEvent::new(
                    EventType::BeginCheckout,
                    json!({"value": "oops"}).as_object().unwrap().clone(),
                ),
                "PIXEL-1",
            )
            .unwrap();

        let call = hook.last().unwrap();
        assert_eq!(call.args[1], json!("InitiateCheckout"));
        assert_eq!(call.args[2]["value"], json!(0.0));
        assert_eq!(call.args.len(), 3);
    }

    #[test]
    fn custom_events_use_track_single_custom() {
        let (adapter, hook) = setup();
        adapter
            .dispatch(
                &CanonicalEvent::new(
                    EventType::Custom("consultation_booked".to_owned()),
                    json!({"doctor": "vaidya"}).as_object().unwrap().clone(),
                ),
                "PIXEL-1",
            )
            .unwrap();

        let call = hook.last().unwrap();
        assert_eq!(call.method, "trackSingleCustom");
        assert_eq!(
            call.args,
            vec![
                json!("PIXEL-1"),
                json!("consultation_booked"),
                json!({"doctor": "vaidya"})
            ]
        );
    }
}
