//! Condition predicates over event payloads.
//!
//! Definitions carry their condition as authored JSON. It is parsed at match
//! time so that one malformed condition can be reported and skipped without
//! affecting other definitions.
//!
//! ```json
//! {"op": "all", "conditions": [
//!     {"op": "equals", "field": "status", "value": "signed"},
//!     {"op": "contains", "field": "tags", "value": "vip"}
//! ]}
//! ```

use crate::error::ConditionError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A field-level predicate over an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Every member must hold.
    All { conditions: Vec<Condition> },
    /// At least one member must hold.
    Any { conditions: Vec<Condition> },
    /// The member must not hold.
    Not { condition: Box<Condition> },
    /// The field equals the value.
    Equals { field: String, value: JsonValue },
    /// The field exists and differs from the value.
    NotEquals { field: String, value: JsonValue },
    /// The field (string or array) contains the value.
    Contains { field: String, value: JsonValue },
    /// The field equals one of the values.
    In { field: String, values: Vec<JsonValue> },
    /// The field is present and not null.
    Exists { field: String },
}

impl Condition {
    /// Parses an authored condition.
    ///
    /// A missing or null condition yields `None`, which always matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a valid condition.
    pub fn parse(raw: Option<&JsonValue>) -> Result<Option<Self>, ConditionError> {
        let Some(raw) = raw.filter(|v| !v.is_null()) else {
            return Ok(None);
        };

        let condition: Self =
            serde_json::from_value(raw.clone()).map_err(|e| ConditionError::Malformed {
                reason: e.to_string(),
            })?;
        condition.check()?;
        Ok(Some(condition))
    }

    /// Checks structural rules that serde cannot express.
    fn check(&self) -> Result<(), ConditionError> {
        match self {
            Self::All { conditions } | Self::Any { conditions } => {
                if conditions.is_empty() {
                    let op = if matches!(self, Self::All { .. }) {
                        "all"
                    } else {
                        "any"
                    };
                    return Err(ConditionError::EmptyGroup { op });
                }
                conditions.iter().try_for_each(Self::check)
            }
            Self::Not { condition } => condition.check(),
            Self::Equals { field, .. }
            | Self::NotEquals { field, .. }
            | Self::Contains { field, .. }
            | Self::In { field, .. }
            | Self::Exists { field } => {
                if field.split('.').any(str::is_empty) {
                    Err(ConditionError::EmptyFieldPath)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Evaluates the condition against a payload.
    ///
    /// Missing fields make comparisons false rather than erroring.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be compared with the operand.
    pub fn evaluate(&self, payload: &JsonValue) -> Result<bool, ConditionError> {
        match self {
            Self::All { conditions } => {
                for condition in conditions {
                    if !condition.evaluate(payload)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any { conditions } => {
                for condition in conditions {
                    if condition.evaluate(payload)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { condition } => Ok(!condition.evaluate(payload)?),
            Self::Equals { field, value } => Ok(lookup(payload, field) == Some(value)),
            Self::NotEquals { field, value } => {
                Ok(lookup(payload, field).is_some_and(|found| found != value))
            }
            Self::Contains { field, value } => contains(field, lookup(payload, field), value),
            Self::In { field, values } => {
                Ok(lookup(payload, field).is_some_and(|found| values.contains(found)))
            }
            Self::Exists { field } => Ok(lookup(payload, field).is_some_and(|v| !v.is_null())),
        }
    }
}

/// Resolves a dotted path (`customer.tier`, `items.0.sku`) inside a payload.
fn lookup<'a>(payload: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(payload, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn contains(
    field: &str,
    found: Option<&JsonValue>,
    needle: &JsonValue,
) -> Result<bool, ConditionError> {
    match found {
        Some(JsonValue::String(haystack)) => match needle {
            JsonValue::String(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(ConditionError::TypeMismatch {
                field: field.to_string(),
                reason: format!("string field needs a string operand, got {other}"),
            }),
        },
        Some(JsonValue::Array(items)) => Ok(items.contains(needle)),
        Some(JsonValue::Object(map)) => Ok(needle.as_str().is_some_and(|k| map.contains_key(k))),
        _ => Ok(false),
    }
}
