//! Resolution of reference values into literals.

use serde_json::Value as JsonValue;

use crate::model::{Condition, Override, Reference, RenderedOverride, Value};

/// Renders authored overrides, resolving every reference through `resolve`.
///
/// `resolve` returns the current value of the referenced config, or `None`
/// when it does not exist. The referenced `path` is applied here. Missing
/// configs and missing paths render as `null`; [`condition_matches`] treats
/// a `null` leaf as never matching, `not_in` included.
///
/// [`condition_matches`]: super::condition_matches
pub fn render_overrides<F>(overrides: &[Override], mut resolve: F) -> Vec<RenderedOverride>
where
    F: FnMut(&Reference) -> Option<JsonValue>,
{
    overrides
        .iter()
        .map(|item| RenderedOverride {
            name: item.name.clone(),
            conditions: item
                .conditions
                .iter()
                .map(|condition| render_condition(condition, &mut resolve))
                .collect(),
            value: item.value.clone(),
        })
        .collect()
}

fn render_condition<F>(condition: &Condition, resolve: &mut F) -> Condition<JsonValue>
where
    F: FnMut(&Reference) -> Option<JsonValue>,
{
    condition.map_values(&mut |value| match value {
        Value::Literal { value } => value.clone(),
        Value::Reference(reference) => match resolve(reference) {
            Some(document) => match reference.extract(&document) {
                Some(found) => found.clone(),
                None => {
                    log::warn!(
                        "Reference {}/{} has no value at path {:?}",
                        reference.project_id,
                        reference.config_name,
                        reference.path
                    );
                    JsonValue::Null
                }
            },
            None => {
                log::warn!(
                    "Reference {}/{} does not resolve to a config",
                    reference.project_id,
                    reference.config_name
                );
                JsonValue::Null
            }
        },
    })
}

/// Collects the distinct references used by `overrides`.
pub fn collect_references(overrides: &[Override]) -> Vec<Reference> {
    let mut found: Vec<Reference> = Vec::new();
    for item in overrides {
        for condition in &item.conditions {
            condition.for_each_value(&mut |_, value| {
                if let Value::Reference(reference) = value {
                    if !found.contains(reference) {
                        found.push(reference.clone());
                    }
                }
            });
        }
    }
    found
}
