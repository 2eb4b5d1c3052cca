//! Capability descriptors shared across the agent runtime.
//!
//! A capability is anything the step loop can call: a tool or a managed agent.
//! Both are normalised into a [`CapabilityDescriptor`] so prompts, schema
//! validation and dispatch never need to know which kind they are looking at.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 64;

/// Semantic type tag for a parameter or a capability output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticType {
    /// UTF-8 text.
    String,
    /// Whole number.
    Integer,
    /// Floating point (or whole) number.
    Number,
    /// `true` / `false`.
    Boolean,
    /// Ordered list of values.
    Array,
    /// String-keyed mapping.
    Object,
    /// Image payload: a path, URL, data URI or an object describing one.
    BinaryImage,
    /// Audio payload: a path, URL, data URI or an object describing one.
    BinaryAudio,
    /// Accepts anything.
    Any,
    /// Absence of a value.
    Null,
}

impl SemanticType {
    /// Returns the tag as written in prompts and serialized descriptors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::BinaryImage => "binary-image",
            Self::BinaryAudio => "binary-audio",
            Self::Any => "any",
            Self::Null => "null",
        }
    }

    fn json_schema(self) -> Value {
        match self {
            Self::String | Self::BinaryImage | Self::BinaryAudio => json!({ "type": "string" }),
            Self::Integer => json!({ "type": "integer" }),
            Self::Number => json!({ "type": "number" }),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Array => json!({ "type": "array" }),
            Self::Object => json!({ "type": "object" }),
            Self::Null => json!({ "type": "null" }),
            Self::Any => json!({}),
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named input of a capability.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    #[serde(rename = "type")]
    semantic_type: SemanticType,
    description: String,
    #[serde(default = "default_true")]
    required: bool,
    #[serde(default)]
    nullable: bool,
}

const fn default_true() -> bool {
    true
}

impl Parameter {
    /// Declares a parameter that must be supplied on every call.
    #[must_use]
    pub fn required(
        name: impl Into<String>,
        semantic_type: SemanticType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            description: description.into(),
            required: true,
            nullable: false,
        }
    }

    /// Declares a parameter that may be omitted.
    #[must_use]
    pub fn optional(
        name: impl Into<String>,
        semantic_type: SemanticType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, semantic_type, description)
        }
    }

    /// Allows an explicit `null` to be passed for this parameter.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared semantic type.
    #[must_use]
    pub const fn semantic_type(&self) -> SemanticType {
        self.semantic_type
    }

    /// Human description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether callers must supply the parameter.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    /// Whether `null` is an acceptable value.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// Uniform callable descriptor for a tool or managed agent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    name: String,
    description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parameters: Vec<Parameter>,
    output_type: SemanticType,
}

impl CapabilityDescriptor {
    /// Starts building a descriptor for the named capability.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> CapabilityBuilder {
        CapabilityBuilder {
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            output_type: SemanticType::Any,
        }
    }

    /// Capability name, unique within one agent's capability set.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description shown to the model.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared parameters in positional order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|param| param.name == name)
    }

    /// Declared output type.
    #[must_use]
    pub const fn output_type(&self) -> SemanticType {
        self.output_type
    }

    /// Renders a one-line signature such as `divide(a: number, b: number) -> number`.
    #[must_use]
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|param| {
                let optional = if param.required { "" } else { "?" };
                format!("{}{optional}: {}", param.name, param.semantic_type)
            })
            .collect();
        format!("{}({}) -> {}", self.name, params.join(", "), self.output_type)
    }

    /// Returns a JSON schema object describing the arguments, as expected by
    /// tool-calling model APIs.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut schema = param.semantic_type.json_schema();
            if let Value::Object(map) = &mut schema {
                map.insert("description".into(), Value::from(param.description.clone()));
                if param.nullable {
                    map.insert("nullable".into(), Value::Bool(true));
                }
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(Value::from(param.name.clone()));
            }
        }

        json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }
}

/// Builder for [`CapabilityDescriptor`].
#[derive(Debug)]
pub struct CapabilityBuilder {
    name: String,
    description: Option<String>,
    parameters: Vec<Parameter>,
    output_type: SemanticType,
}

impl CapabilityBuilder {
    /// Sets the human description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Appends a parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if a parameter with the same name
    /// was already declared or the name is not a valid identifier.
    pub fn parameter(mut self, parameter: Parameter) -> Result<Self> {
        validate_identifier(&parameter.name)?;
        if self.parameters.iter().any(|p| p.name == parameter.name) {
            return Err(Error::InvalidCapability {
                reason: format!("parameter `{}` declared twice", parameter.name),
            });
        }
        self.parameters.push(parameter);
        Ok(self)
    }

    /// Sets the output type (defaults to [`SemanticType::Any`]).
    #[must_use]
    pub fn output(mut self, output_type: SemanticType) -> Self {
        self.output_type = output_type;
        self
    }

    /// Finalises the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapabilityName`] when the name is not an
    /// identifier, or [`Error::InvalidCapability`] when the description is
    /// missing.
    pub fn build(self) -> Result<CapabilityDescriptor> {
        validate_identifier(&self.name)?;
        let description = self
            .description
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| Error::InvalidCapability {
                reason: format!("capability `{}` needs a description", self.name),
            })?;

        Ok(CapabilityDescriptor {
            name: self.name,
            description,
            parameters: self.parameters,
            output_type: self.output_type,
        })
    }
}

/// Checks that a capability or parameter name can be called from code:
/// ASCII letter or underscore first, then letters, digits or underscores.
///
/// # Errors
///
/// Returns [`Error::InvalidCapabilityName`] describing the violation.
pub fn validate_identifier(name: &str) -> Result<()> {
    let reject = |reason: String| Error::InvalidCapabilityName {
        name: name.to_owned(),
        reason,
    };

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(reject("name cannot be empty".into()));
    };
    if name.len() > MAX_NAME_LEN {
        return Err(reject(format!("name length must be <= {MAX_NAME_LEN}")));
    }
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(reject("name must start with a letter or underscore".into()));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(reject(
            "name must contain only ASCII letters, digits, or underscores".into(),
        ));
    }
    Ok(())
}

/// Returns the first name that occurs more than once, if any.
#[must_use]
pub fn first_duplicate<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = BTreeSet::new();
    names.into_iter().find(|name| !seen.insert(*name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn divide() -> CapabilityDescriptor {
        CapabilityDescriptor::builder("divide")
            .description("Divides a by b")
            .parameter(Parameter::required("a", SemanticType::Number, "dividend"))
            .and_then(|b| b.parameter(Parameter::required("b", SemanticType::Number, "divisor")))
            .map(|b| b.output(SemanticType::Number))
            .and_then(CapabilityBuilder::build)
            .expect("build")
    }

    #[test]
    fn builds_descriptor_with_signature() {
        let descriptor = divide();
        assert_eq!(descriptor.parameters().len(), 2);
        assert_eq!(
            descriptor.signature(),
            "divide(a: number, b: number) -> number"
        );
    }

    #[test]
    fn json_schema_lists_required_parameters() {
        let schema = divide().to_json_schema();
        assert_eq!(schema["parameters"]["required"], json!(["a", "b"]));
        assert_eq!(
            schema["parameters"]["properties"]["a"]["type"],
            json!("number")
        );
    }

    #[test]
    fn rejects_non_identifier_names() {
        let err = CapabilityDescriptor::builder("web search")
            .description("search")
            .build()
            .expect_err("space is not allowed");
        assert!(matches!(err, Error::InvalidCapabilityName { .. }));

        let err = validate_identifier("9lives").expect_err("leading digit");
        assert!(matches!(err, Error::InvalidCapabilityName { .. }));
    }

    #[test]
    fn requires_description() {
        let err = CapabilityDescriptor::builder("noop")
            .build()
            .expect_err("description required");
        assert!(matches!(err, Error::InvalidCapability { .. }));
    }

    #[test]
    fn rejects_duplicate_parameters() {
        let err = CapabilityDescriptor::builder("twice")
            .parameter(Parameter::required("x", SemanticType::Any, "x"))
            .and_then(|b| b.parameter(Parameter::optional("x", SemanticType::Any, "x again")))
            .expect_err("duplicate parameter");
        assert!(matches!(err, Error::InvalidCapability { .. }));
    }

    #[test]
    fn finds_duplicate_names() {
        assert_eq!(first_duplicate(["a", "b", "a"]), Some("a"));
        assert_eq!(first_duplicate(["a", "b"]), None);
    }
}
