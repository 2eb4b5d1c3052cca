//! Model-chosen units of work.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a model expresses its actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionMode {
    /// Python-flavoured code blocks run by an executor.
    #[default]
    Code,
    /// Structured calls, native or as a JSON blob.
    ToolCalling,
}

/// One action produced by a model response. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Direct invocation of a named capability with keyword arguments.
    StructuredCall(ToolCall),
    /// Source text to run through the configured executor.
    CodeBlock {
        /// Code exactly as extracted from the model output.
        source: String,
    },
}

impl Action {
    /// Creates a code action.
    #[must_use]
    pub fn code(source: impl Into<String>) -> Self {
        Self::CodeBlock {
            source: source.into(),
        }
    }

    /// Creates a structured call action.
    #[must_use]
    pub fn call(name: impl Into<String>, arguments: Value) -> Self {
        Self::StructuredCall(ToolCall::new(name, arguments))
    }

    /// Short label used in logs: the capability name or `code`.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::StructuredCall(call) => call.name(),
            Self::CodeBlock { .. } => "code",
        }
    }
}

/// Structured call emitted by a model (natively or as a JSON blob).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ToolCall {
    /// Creates a call without a provider-assigned id.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    /// Attaches the provider-assigned call id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Provider-assigned call id, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Name of the capability being called.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw arguments as produced by the model.
    #[must_use]
    pub fn arguments(&self) -> &Value {
        &self.arguments
    }

    /// Arguments as a keyword map. Providers sometimes send the object
    /// JSON-encoded inside a string, and `null` means no arguments.
    ///
    /// Returns `None` when the arguments are neither.
    #[must_use]
    pub fn argument_map(&self) -> Option<Map<String, Value>> {
        match &self.arguments {
            Value::Object(map) => Some(map.clone()),
            Value::Null => Some(Map::new()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_string_encoded_arguments() {
        let call = ToolCall::new("divide", Value::from(r#"{"a": 1, "b": 2}"#));
        let map = call.argument_map().expect("object");
        assert_eq!(map.get("b"), Some(&json!(2)));
    }

    #[test]
    fn rejects_scalar_arguments() {
        let call = ToolCall::new("divide", json!(3));
        assert!(call.argument_map().is_none());
    }

    #[test]
    fn modes_use_kebab_case() {
        assert_eq!(
            serde_json::to_value(ActionMode::ToolCalling).unwrap(),
            json!("tool-calling")
        );
    }

    #[test]
    fn serializes_with_type_tag() {
        let action = Action::code("final_answer(4)");
        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded["type"], json!("code_block"));
        let decoded: Action = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, action);
    }
}
