use std::fmt;
use std::str::FromStr;

use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event properties as submitted by the storefront. Key order is irrelevant for deduplication.
pub type Payload = Map<String, Value>;

/// Commerce events mirrored to the advertising platforms.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum EventType {
    PageView,
    ViewContent,
    AddToCart,
    BeginCheckout,
    Purchase,
    Search,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::PageView => "page_view",
            EventType::ViewContent => "view_content",
            EventType::AddToCart => "add_to_cart",
            EventType::BeginCheckout => "begin_checkout",
            EventType::Purchase => "purchase",
            EventType::Search => "search",
            EventType::Custom(name) => name,
        }
    }
}

/// Unknown names are kept as `Custom` events, so parsing never fails.
impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "page_view" => EventType::PageView,
            "view_content" => EventType::ViewContent,
            "add_to_cart" => EventType::AddToCart,
            "begin_checkout" => EventType::BeginCheckout,
            "purchase" => EventType::Purchase,
            "search" => EventType::Search,
            custom => EventType::Custom(custom.to_owned()),
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct EventTypeVisitor;

impl<'de> Visitor<'de> for EventTypeVisitor {
    type Value = EventType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an event type name")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if s.is_empty() {
            return Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            ));
        }
        match EventType::from_str(s) {
            Ok(event_type) => Ok(event_type),
            Err(never) => match never {},
        }
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(EventTypeVisitor)
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A business event in the shape every platform adapter consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl CanonicalEvent {
    pub fn new(event_type: EventType, payload: Payload) -> Self {
        Self {
            event_type,
            payload,
            order_id: None,
        }
    }

    pub fn purchase(order_id: &str, payload: Payload) -> Self {
        Self {
            event_type: EventType::Purchase,
            payload,
            order_id: Some(order_id.to_owned()),
        }
    }

    /// Lookup a payload field, returning `None` for missing keys and JSON nulls.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

/// Serialize a JSON value with every object's keys sorted lexicographically, at any depth.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

pub fn canonicalize_payload(payload: &Payload) -> String {
    let mut out = String::new();
    write_object(payload, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single JSON representation.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (idx, key) in keys.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}
