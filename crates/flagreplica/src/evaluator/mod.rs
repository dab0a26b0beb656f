//! Override evaluation.
//!
//! Evaluation is pure: it only looks at the rendered overrides and the
//! caller's context. References are resolved earlier, once per refresh, by
//! [`render_overrides`].

pub mod render;
pub mod segmentation;

use std::cmp::Ordering;

use serde_json::{Map, Value as JsonValue};

use crate::model::{Condition, PropertyCondition, RenderedCondition, RenderedOverride};

pub use render::{collect_references, render_overrides};
pub use segmentation::bucket;

/// Runtime properties of the caller (user id, tier, country, ...).
pub type Context = Map<String, JsonValue>;

/// Returns the value of the first override whose conditions all hold, or
/// `base` when none does.
pub fn evaluate<'a>(
    base: &'a JsonValue,
    overrides: &'a [RenderedOverride],
    context: &Context,
) -> &'a JsonValue {
    overrides
        .iter()
        .find(|item| {
            item.conditions
                .iter()
                .all(|condition| condition_matches(condition, context))
        })
        .map(|item| &item.value)
        .unwrap_or(base)
}

/// Whether `condition` holds for `context`.
///
/// Leaves whose property is absent from the context never match, and
/// neither do leaves whose value is `null`, i.e. an unresolved reference.
/// The latter holds for `not_in` too, so a broken reference fails closed.
pub fn condition_matches(condition: &RenderedCondition, context: &Context) -> bool {
    match condition {
        Condition::Equals(leaf) => with_property(leaf, context, values_equal),
        Condition::In(leaf) => with_property(leaf, context, contains),
        Condition::NotIn(leaf) => with_property(leaf, context, |actual, expected| {
            !contains(actual, expected)
        }),
        Condition::LessThan(leaf) => with_property(leaf, context, |actual, expected| {
            compare(actual, expected) == Some(Ordering::Less)
        }),
        Condition::LessThanOrEqual(leaf) => with_property(leaf, context, |actual, expected| {
            matches!(
                compare(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            )
        }),
        Condition::GreaterThan(leaf) => with_property(leaf, context, |actual, expected| {
            compare(actual, expected) == Some(Ordering::Greater)
        }),
        Condition::GreaterThanOrEqual(leaf) => with_property(leaf, context, |actual, expected| {
            matches!(
                compare(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            )
        }),
        Condition::Segmentation(segment) => match context.get(&segment.property) {
            Some(actual) => segmentation::in_segment(
                &segment.seed,
                actual,
                segment.from_percentage,
                segment.to_percentage,
            ),
            None => false,
        },
        Condition::And { conditions } => conditions.iter().all(|c| condition_matches(c, context)),
        Condition::Or { conditions } => conditions.iter().any(|c| condition_matches(c, context)),
        Condition::Not { condition } => !condition_matches(condition, context),
    }
}

fn with_property<F>(leaf: &PropertyCondition<JsonValue>, context: &Context, op: F) -> bool
where
    F: Fn(&JsonValue, &JsonValue) -> bool,
{
    if leaf.value.is_null() {
        return false;
    }
    context
        .get(&leaf.property)
        .map(|actual| op(actual, &leaf.value))
        .unwrap_or(false)
}

fn values_equal(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (actual, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn contains(actual: &JsonValue, expected: &JsonValue) -> bool {
    match expected {
        JsonValue::Array(items) => items.iter().any(|item| values_equal(actual, item)),
        scalar => values_equal(actual, scalar),
    }
}

fn compare(actual: &JsonValue, expected: &JsonValue) -> Option<Ordering> {
    match (actual, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
