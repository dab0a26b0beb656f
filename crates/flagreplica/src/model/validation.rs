//! Write-time validation of authored overrides.
//!
//! Writers run this before persisting a variant. Evaluation assumes it has
//! passed and never re-checks these rules.

use serde_json::Value as JsonValue;
use thiserror::Error;

use super::condition::{Condition, Override, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error(
        "Override '{override_name}' references project '{referenced}' from project '{project}'"
    )]
    CrossProjectReference {
        override_name: String,
        project: String,
        referenced: String,
    },

    #[error(
        "Override '{override_name}' has a null or non-primitive literal for property '{property}'"
    )]
    InvalidLiteral {
        override_name: String,
        property: String,
    },

    #[error("Override '{override_name}' has an empty property name")]
    EmptyProperty { override_name: String },

    #[error("Override '{override_name}' has invalid segmentation range {from}..{to}")]
    InvalidSegmentRange {
        override_name: String,
        from: f64,
        to: f64,
    },

    #[error("Override '{override_name}' references a config with an empty name")]
    EmptyReference { override_name: String },
}

/// Validates the overrides of a variant belonging to `project_id`.
pub fn validate_overrides(project_id: &str, overrides: &[Override]) -> Result<(), ValidationError> {
    for item in overrides {
        for condition in &item.conditions {
            validate_condition(project_id, &item.name, condition)?;
        }
    }
    Ok(())
}

fn validate_condition(
    project_id: &str,
    override_name: &str,
    condition: &Condition,
) -> Result<(), ValidationError> {
    match condition {
        Condition::Segmentation(segment) => {
            if segment.property.is_empty() {
                return Err(ValidationError::EmptyProperty {
                    override_name: override_name.to_string(),
                });
            }
            let (from, to) = (segment.from_percentage, segment.to_percentage);
            if !(0.0..=100.0).contains(&from) || !(0.0..=100.0).contains(&to) || from > to {
                return Err(ValidationError::InvalidSegmentRange {
                    override_name: override_name.to_string(),
                    from,
                    to,
                });
            }
            Ok(())
        }
        Condition::And { conditions } | Condition::Or { conditions } => {
            for child in conditions {
                validate_condition(project_id, override_name, child)?;
            }
            Ok(())
        }
        Condition::Not { condition } => validate_condition(project_id, override_name, condition),
        leaf => {
            let mut result = Ok(());
            leaf.for_each_value(&mut |property, value| {
                if result.is_ok() {
                    result = validate_leaf(project_id, override_name, property, value);
                }
            });
            result
        }
    }
}

fn validate_leaf(
    project_id: &str,
    override_name: &str,
    property: &str,
    value: &Value,
) -> Result<(), ValidationError> {
    if property.is_empty() {
        return Err(ValidationError::EmptyProperty {
            override_name: override_name.to_string(),
        });
    }

    match value {
        Value::Literal { value } => {
            let valid = match value {
                JsonValue::Array(items) => items.iter().all(is_primitive),
                other => is_primitive(other),
            };
            if valid {
                Ok(())
            } else {
                Err(ValidationError::InvalidLiteral {
                    override_name: override_name.to_string(),
                    property: property.to_string(),
                })
            }
        }
        Value::Reference(reference) => {
            if reference.project_id != project_id {
                return Err(ValidationError::CrossProjectReference {
                    override_name: override_name.to_string(),
                    project: project_id.to_string(),
                    referenced: reference.project_id.clone(),
                });
            }
            if reference.config_name.is_empty() {
                return Err(ValidationError::EmptyReference {
                    override_name: override_name.to_string(),
                });
            }
            Ok(())
        }
    }
}

/// `null` is reserved for unresolved references.
fn is_primitive(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_))
}
