//! Override conditions and the values they compare against.
//!
//! Conditions are generic over their leaf value type. Authored overrides use
//! [`Value`], which may reference another config; rendered overrides use plain
//! JSON, with every reference already resolved.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A condition tree node, tagged by `operator` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum Condition<V = Value> {
    Equals(PropertyCondition<V>),
    In(PropertyCondition<V>),
    NotIn(PropertyCondition<V>),
    LessThan(PropertyCondition<V>),
    LessThanOrEqual(PropertyCondition<V>),
    GreaterThan(PropertyCondition<V>),
    GreaterThanOrEqual(PropertyCondition<V>),
    Segmentation(Segmentation),
    And { conditions: Vec<Condition<V>> },
    Or { conditions: Vec<Condition<V>> },
    Not { condition: Box<Condition<V>> },
}

/// Leaf comparing `context[property]` with `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCondition<V> {
    pub property: String,
    pub value: V,
}

/// Percentage rollout leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segmentation {
    pub property: String,
    pub from_percentage: f64,
    pub to_percentage: f64,
    pub seed: String,
}

/// Authored leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Value {
    /// A primitive or an array of primitives.
    Literal { value: JsonValue },
    /// A pointer into another config's value within the same project.
    Reference(Reference),
}

impl Value {
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Value::Literal {
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub project_id: String,
    pub config_name: String,
    #[serde(default)]
    pub path: Vec<PathSegment>,
}

/// One step into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl Reference {
    /// Follows `path` inside `document`.
    pub fn extract<'a>(&self, document: &'a JsonValue) -> Option<&'a JsonValue> {
        self.path
            .iter()
            .try_fold(document, |current, segment| match segment {
                PathSegment::Key(key) => current.get(key.as_str()),
                PathSegment::Index(index) => current.get(*index),
            })
    }
}

/// A named, conditional replacement of a config's base value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override<V = Value> {
    pub name: String,
    /// All conditions must hold for the override to apply.
    #[serde(default = "Vec::new")]
    pub conditions: Vec<Condition<V>>,
    pub value: JsonValue,
}

pub type RenderedCondition = Condition<JsonValue>;
pub type RenderedOverride = Override<JsonValue>;

impl<V> Condition<V> {
    /// Rebuilds the tree with every leaf value mapped through `f`.
    pub fn map_values<W, F>(&self, f: &mut F) -> Condition<W>
    where
        F: FnMut(&V) -> W,
    {
        let leaf = |c: &PropertyCondition<V>, f: &mut F| PropertyCondition {
            property: c.property.clone(),
            value: f(&c.value),
        };

        match self {
            Condition::Equals(c) => Condition::Equals(leaf(c, f)),
            Condition::In(c) => Condition::In(leaf(c, f)),
            Condition::NotIn(c) => Condition::NotIn(leaf(c, f)),
            Condition::LessThan(c) => Condition::LessThan(leaf(c, f)),
            Condition::LessThanOrEqual(c) => Condition::LessThanOrEqual(leaf(c, f)),
            Condition::GreaterThan(c) => Condition::GreaterThan(leaf(c, f)),
            Condition::GreaterThanOrEqual(c) => Condition::GreaterThanOrEqual(leaf(c, f)),
            Condition::Segmentation(s) => Condition::Segmentation(s.clone()),
            Condition::And { conditions } => Condition::And {
                conditions: conditions.iter().map(|c| c.map_values(f)).collect(),
            },
            Condition::Or { conditions } => Condition::Or {
                conditions: conditions.iter().map(|c| c.map_values(f)).collect(),
            },
            Condition::Not { condition } => Condition::Not {
                condition: Box::new(condition.map_values(f)),
            },
        }
    }

    /// Visits every leaf value in the tree.
    pub fn for_each_value<F>(&self, f: &mut F)
    where
        F: FnMut(&str, &V),
    {
        match self {
            Condition::Equals(c)
            | Condition::In(c)
            | Condition::NotIn(c)
            | Condition::LessThan(c)
            | Condition::LessThanOrEqual(c)
            | Condition::GreaterThan(c)
            | Condition::GreaterThanOrEqual(c) => f(&c.property, &c.value),
            Condition::Segmentation(_) => {}
            Condition::And { conditions } | Condition::Or { conditions } => {
                for condition in conditions {
                    condition.for_each_value(f);
                }
            }
            Condition::Not { condition } => condition.for_each_value(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_wire_format() {
        let condition: Condition = serde_json::from_value(json!({
            "operator": "and",
            "conditions": [
                {"operator": "equals", "property": "tier", "value": {"type": "literal", "value": "premium"}},
                {"operator": "not", "condition": {
                    "operator": "in",
                    "property": "userId",
                    "value": {"type": "reference", "projectId": "p1", "configName": "blocked", "path": ["users", 0]}
                }},
                {"operator": "segmentation", "property": "userId", "fromPercentage": 0, "toPercentage": 25, "seed": "s1"}
            ]
        }))
        .unwrap();

        let Condition::And { conditions } = &condition else {
            panic!("expected and, got {:?}", condition);
        };
        assert_eq!(conditions.len(), 3);
        assert!(matches!(&conditions[0], Condition::Equals(c) if c.property == "tier"));

        let Condition::Not { condition: inner } = &conditions[1] else {
            panic!("expected not");
        };
        let Condition::In(leaf) = inner.as_ref() else {
            panic!("expected in");
        };
        assert_eq!(
            leaf.value,
            Value::Reference(Reference {
                project_id: "p1".to_string(),
                config_name: "blocked".to_string(),
                path: vec![PathSegment::Key("users".to_string()), PathSegment::Index(0)],
            })
        );
        assert!(matches!(&conditions[2], Condition::Segmentation(s) if s.to_percentage == 25.0));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let result: Result<Condition, _> = serde_json::from_value(json!({
            "operator": "matches",
            "property": "email",
            "value": {"type": "literal", "value": ".*"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_reference_extract() {
        let reference = Reference {
            project_id: "p1".to_string(),
            config_name: "lists".to_string(),
            path: vec![PathSegment::Key("users".to_string()), PathSegment::Index(1)],
        };
        let doc = json!({"users": ["a", "b"]});
        assert_eq!(reference.extract(&doc), Some(&json!("b")));
        assert_eq!(reference.extract(&json!({"users": []})), None);
    }

    #[test]
    fn test_map_values_preserves_shape() {
        let condition = Condition::Or {
            conditions: vec![
                Condition::Equals(PropertyCondition {
                    property: "a".to_string(),
                    value: Value::literal(1),
                }),
                Condition::Not {
                    condition: Box::new(Condition::LessThan(PropertyCondition {
                        property: "b".to_string(),
                        value: Value::literal(2),
                    })),
                },
            ],
        };

        let mut seen = Vec::new();
        let rendered: RenderedCondition = condition.map_values(&mut |v| match v {
            Value::Literal { value } => value.clone(),
            Value::Reference(_) => JsonValue::Null,
        });
        rendered.for_each_value(&mut |property, value| {
            seen.push((property.to_string(), value.clone()))
        });

        assert_eq!(
            seen,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
    }
}
