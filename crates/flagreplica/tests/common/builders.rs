//! Builders for test variants and overrides.

#![allow(dead_code)]

use serde_json::{json, Value as JsonValue};

use flagreplica::model::{
    Condition, Override, PathSegment, PropertyCondition, Reference, RenderedOverride,
    ReplicatedVariant, Value,
};
use flagreplica::Context;

/// Builder for `ReplicatedVariant` instances.
pub struct VariantBuilder {
    variant: ReplicatedVariant,
}

impl VariantBuilder {
    /// A variant of project `P`, environment `prod`, version 1.
    pub fn new(variant_id: &str, config_name: &str) -> Self {
        Self {
            variant: ReplicatedVariant {
                variant_id: variant_id.to_string(),
                config_name: config_name.to_string(),
                project_id: "P".to_string(),
                environment_id: "prod".to_string(),
                value: JsonValue::Null,
                overrides: vec![],
                version: 1,
                references: vec![],
            },
        }
    }

    pub fn project(mut self, project_id: &str) -> Self {
        self.variant.project_id = project_id.to_string();
        self
    }

    pub fn environment(mut self, environment_id: &str) -> Self {
        self.variant.environment_id = environment_id.to_string();
        self
    }

    pub fn value(mut self, value: JsonValue) -> Self {
        self.variant.value = value;
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.variant.version = version;
        self
    }

    /// Adds an override returning `value` when `context[property] == expected`.
    pub fn when_equals(mut self, property: &str, expected: JsonValue, value: JsonValue) -> Self {
        let name = format!("{}={}", property, expected);
        self.variant.overrides.push(RenderedOverride {
            name,
            conditions: vec![Condition::Equals(PropertyCondition {
                property: property.to_string(),
                value: expected,
            })],
            value,
        });
        self
    }

    pub fn build(self) -> ReplicatedVariant {
        self.variant
    }
}

/// Authored override returning `true` for users listed under `users` in the
/// value of config `allowlist` of project `P`.
pub fn allowlist_override(allowlist: &str) -> Override {
    Override {
        name: "allowlisted".to_string(),
        conditions: vec![Condition::In(PropertyCondition {
            property: "userId".to_string(),
            value: Value::Reference(Reference {
                project_id: "P".to_string(),
                config_name: allowlist.to_string(),
                path: vec![PathSegment::Key("users".to_string())],
            }),
        })],
        value: json!(true),
    }
}

/// Context from a JSON object literal.
pub fn context(value: JsonValue) -> Context {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("context must be a JSON object, got {}", other),
    }
}

/// The `{"variantId": id}` hint writers send.
pub fn variant_hint(variant_id: &str) -> String {
    json!({ "variantId": variant_id }).to_string()
}

pub fn config_hint(config_id: &str) -> String {
    json!({ "configId": config_id }).to_string()
}
