//! Change hints carried by notification payloads.

use serde_json::Value as JsonValue;

/// What a notification says changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeHint {
    /// One variant, by surrogate id.
    Variant(String),
    /// Every variant of a config.
    Config(String),
}

impl ChangeHint {
    /// Reads `{variantId}`, `{entityId}` or `{configId}` from a payload.
    ///
    /// Returns `None` for anything else, including empty ids.
    pub fn from_payload(payload: &JsonValue) -> Option<Self> {
        let object = payload.as_object()?;
        let id = |field: &str| {
            object
                .get(field)
                .and_then(id_text)
                .filter(|id| !id.is_empty())
        };

        if let Some(id) = id("variantId").or_else(|| id("entityId")) {
            return Some(ChangeHint::Variant(id));
        }
        id("configId").map(ChangeHint::Config)
    }
}

fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
