//! Argument validation and coercion against capability descriptors.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::capability::{CapabilityDescriptor, SemanticType};

/// Reasons a structured call fails its capability schema.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    /// Arguments were not a keyword mapping.
    #[error("arguments for `{capability}` must be an object of named parameters")]
    NotAnObject {
        /// Capability being called.
        capability: String,
    },
    /// A required parameter was not supplied.
    #[error("`{capability}` is missing required argument `{parameter}`")]
    MissingArgument {
        /// Capability being called.
        capability: String,
        /// Missing parameter name.
        parameter: String,
    },
    /// An argument does not match any declared parameter.
    #[error("`{capability}` has no parameter named `{parameter}`")]
    UnknownArgument {
        /// Capability being called.
        capability: String,
        /// Unexpected argument name.
        parameter: String,
    },
    /// `null` passed for a parameter that is not nullable.
    #[error("argument `{parameter}` of `{capability}` may not be null")]
    NullNotAllowed {
        /// Capability being called.
        capability: String,
        /// Parameter name.
        parameter: String,
    },
    /// The value cannot be coerced to the declared type.
    #[error("argument `{parameter}` of `{capability}` expects {expected}, got {found}")]
    TypeMismatch {
        /// Capability being called.
        capability: String,
        /// Parameter name.
        parameter: String,
        /// Declared type.
        expected: SemanticType,
        /// Short description of the supplied value.
        found: String,
    },
}

/// Validates keyword arguments for `descriptor` and returns them coerced to
/// the declared semantic types. Pure: nothing is invoked.
///
/// # Errors
///
/// Returns the first [`SchemaViolation`] found, checking unknown arguments
/// first, then missing ones, then types in declaration order.
pub fn validate_arguments(
    descriptor: &CapabilityDescriptor,
    arguments: &Map<String, Value>,
) -> Result<Map<String, Value>, SchemaViolation> {
    let capability = descriptor.name();

    if let Some(unknown) = arguments
        .keys()
        .find(|key| descriptor.parameter(key).is_none())
    {
        return Err(SchemaViolation::UnknownArgument {
            capability: capability.to_owned(),
            parameter: unknown.clone(),
        });
    }

    let mut coerced = Map::new();
    for param in descriptor.parameters() {
        let Some(value) = arguments.get(param.name()) else {
            if param.is_required() {
                return Err(SchemaViolation::MissingArgument {
                    capability: capability.to_owned(),
                    parameter: param.name().to_owned(),
                });
            }
            continue;
        };

        if value.is_null() {
            let null_ok = param.is_nullable()
                || matches!(param.semantic_type(), SemanticType::Any | SemanticType::Null);
            if !null_ok {
                return Err(SchemaViolation::NullNotAllowed {
                    capability: capability.to_owned(),
                    parameter: param.name().to_owned(),
                });
            }
            coerced.insert(param.name().to_owned(), Value::Null);
            continue;
        }

        let value = coerce(value, param.semantic_type()).ok_or_else(|| {
            SchemaViolation::TypeMismatch {
                capability: capability.to_owned(),
                parameter: param.name().to_owned(),
                expected: param.semantic_type(),
                found: describe(value),
            }
        })?;
        coerced.insert(param.name().to_owned(), value);
    }

    Ok(coerced)
}

/// Coerces a single value to `target`, returning `None` when it is not
/// representable.
#[must_use]
pub fn coerce(value: &Value, target: SemanticType) -> Option<Value> {
    match target {
        SemanticType::Any => Some(value.clone()),
        SemanticType::Null => value.is_null().then_some(Value::Null),
        SemanticType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        SemanticType::Integer => match value {
            Value::Number(n) => integer_from_number(n),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        SemanticType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(int) = trimmed.parse::<i64>() {
                    return Some(Value::from(int));
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            }
            _ => None,
        },
        SemanticType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        SemanticType::Array => match value {
            Value::Array(_) => Some(value.clone()),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_array),
            _ => None,
        },
        SemanticType::Object => match value {
            Value::Object(_) => Some(value.clone()),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_object),
            _ => None,
        },
        SemanticType::BinaryImage | SemanticType::BinaryAudio => match value {
            Value::String(_) | Value::Object(_) => Some(value.clone()),
            _ => None,
        },
    }
}

fn integer_from_number(n: &Number) -> Option<Value> {
    if n.is_i64() || n.is_u64() {
        return Some(Value::Number(n.clone()));
    }
    let float = n.as_f64()?;
    if float.fract() != 0.0 || !float.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let whole = float as i64;
    Some(Value::from(whole))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(n) if n.is_f64() => format!("number {n}"),
        Value::Number(n) => format!("integer {n}"),
        Value::String(s) if s.len() > 32 => "string".into(),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "array".into(),
        Value::Object(_) => "object".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityBuilder, Parameter};
    use serde_json::json;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::builder("search")
            .description("search the index")
            .parameter(Parameter::required("query", SemanticType::String, "text"))
            .and_then(|b| b.parameter(Parameter::optional("limit", SemanticType::Integer, "max")))
            .and_then(|b| {
                b.parameter(Parameter::optional("exact", SemanticType::Boolean, "flag").nullable())
            })
            .and_then(CapabilityBuilder::build)
            .unwrap()
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn coerces_declared_types() {
        let coerced = validate_arguments(
            &descriptor(),
            &args(json!({"query": 42, "limit": "5", "exact": "TRUE"})),
        )
        .unwrap();
        assert_eq!(coerced["query"], json!("42"));
        assert_eq!(coerced["limit"], json!(5));
        assert_eq!(coerced["exact"], json!(true));
    }

    #[test]
    fn missing_required_argument_fails() {
        let err = validate_arguments(&descriptor(), &args(json!({"limit": 1}))).unwrap_err();
        assert!(matches!(err, SchemaViolation::MissingArgument { parameter, .. } if parameter == "query"));
    }

    #[test]
    fn unknown_argument_fails() {
        let err =
            validate_arguments(&descriptor(), &args(json!({"query": "x", "page": 2}))).unwrap_err();
        assert!(matches!(err, SchemaViolation::UnknownArgument { parameter, .. } if parameter == "page"));
    }

    #[test]
    fn null_respects_nullable_flag() {
        let ok = validate_arguments(&descriptor(), &args(json!({"query": "x", "exact": null})));
        assert!(ok.is_ok());
        let err = validate_arguments(&descriptor(), &args(json!({"query": null}))).unwrap_err();
        assert!(matches!(err, SchemaViolation::NullNotAllowed { .. }));
    }

    #[test]
    fn fractional_integer_is_a_mismatch() {
        let err =
            validate_arguments(&descriptor(), &args(json!({"query": "x", "limit": 2.5}))).unwrap_err();
        assert!(matches!(err, SchemaViolation::TypeMismatch { expected: SemanticType::Integer, .. }));
        assert_eq!(coerce(&json!(3.0), SemanticType::Integer), Some(json!(3)));
    }

    #[test]
    fn json_strings_coerce_to_containers() {
        assert_eq!(
            coerce(&json!("[1, 2]"), SemanticType::Array),
            Some(json!([1, 2]))
        );
        assert_eq!(coerce(&json!("[1, 2]"), SemanticType::Object), None);
    }

    #[test]
    fn zero_argument_capability_accepts_empty_map() {
        let noop = CapabilityDescriptor::builder("now")
            .description("current time")
            .build()
            .unwrap();
        assert!(validate_arguments(&noop, &Map::new()).unwrap().is_empty());
    }
}
