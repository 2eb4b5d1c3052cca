//! Execution results and the in-loop error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of a failed action.
///
/// Every kind except [`ErrorKind::Infrastructure`] is recoverable: the loop
/// turns it into an observation and lets the model correct itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The action was malformed or its arguments failed schema validation.
    #[serde(rename = "schema-error")]
    Schema,
    /// A capability raised while handling a structured call.
    #[serde(rename = "tool-error")]
    Tool,
    /// Code raised inside the executor.
    #[serde(rename = "execution-error")]
    Execution,
    /// The action named a capability that is not in the agent's set.
    #[serde(rename = "unknown-capability")]
    UnknownCapability,
    /// The model call or the execution exceeded its time limit.
    #[serde(rename = "timeout")]
    Timeout,
    /// The execution backend itself failed (sandbox unreachable, container down).
    #[serde(rename = "infrastructure-error")]
    Infrastructure,
}

impl ErrorKind {
    /// Returns the kebab-case tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema-error",
            Self::Tool => "tool-error",
            Self::Execution => "execution-error",
            Self::UnknownCapability => "unknown-capability",
            Self::Timeout => "timeout",
            Self::Infrastructure => "infrastructure-error",
        }
    }

    /// Whether the loop may feed this error back to the model and continue.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        !matches!(self, Self::Infrastructure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure attached to an [`ExecutionResult`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    kind: ErrorKind,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
}

impl ErrorInfo {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    /// Shorthand for [`ErrorKind::Schema`].
    #[must_use]
    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, message)
    }

    /// Shorthand for [`ErrorKind::Tool`].
    #[must_use]
    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tool, message)
    }

    /// Shorthand for [`ErrorKind::Execution`].
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    /// Shorthand for [`ErrorKind::Timeout`].
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Shorthand for [`ErrorKind::Infrastructure`].
    #[must_use]
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, message)
    }

    /// Error raised when an action names a capability the agent lacks.
    #[must_use]
    pub fn unknown_capability(name: &str, available: &[&str]) -> Self {
        let listing = if available.is_empty() {
            "none".to_owned()
        } else {
            available.join(", ")
        };
        Self::new(
            ErrorKind::UnknownCapability,
            format!("unknown capability `{name}`; available capabilities: {listing}"),
        )
    }

    /// Attaches a traceback.
    #[must_use]
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Optional traceback text.
    #[must_use]
    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of dispatching one action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    output: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
    #[serde(default)]
    is_final_answer: bool,
}

impl ExecutionResult {
    /// A successful, non-terminal result.
    #[must_use]
    pub fn success(output: Value, logs: impl Into<String>) -> Self {
        Self {
            output,
            logs: logs.into(),
            error: None,
            is_final_answer: false,
        }
    }

    /// A result carrying the final-answer signal.
    #[must_use]
    pub fn final_answer(output: Value, logs: impl Into<String>) -> Self {
        Self {
            is_final_answer: true,
            ..Self::success(output, logs)
        }
    }

    /// A failed result; logs captured before the failure are kept.
    #[must_use]
    pub fn failure(error: ErrorInfo, logs: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            logs: logs.into(),
            error: Some(error),
            is_final_answer: false,
        }
    }

    /// Output value (or `null`).
    #[must_use]
    pub fn output(&self) -> &Value {
        &self.output
    }

    /// Captured printed output.
    #[must_use]
    pub fn logs(&self) -> &str {
        &self.logs
    }

    /// Classified error, if the action failed.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// Whether the action produced the final answer.
    #[must_use]
    pub const fn is_final_answer(&self) -> bool {
        self.is_final_answer
    }

    /// Consumes the result and returns its output.
    #[must_use]
    pub fn into_output(self) -> Value {
        self.output
    }

    /// Replaces the error, clearing the final-answer signal.
    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self.is_final_answer = false;
        self
    }

    /// Text fed back to the model as the observation for this step.
    #[must_use]
    pub fn observation(&self) -> String {
        let mut text = String::new();
        if !self.logs.is_empty() {
            text.push_str("Execution logs:\n");
            text.push_str(&self.logs);
            if !self.logs.ends_with('\n') {
                text.push('\n');
            }
        }

        match &self.error {
            Some(error) => {
                text.push_str(&format!("Error ({}): {}", error.kind, error.message));
                if let Some(traceback) = &error.traceback {
                    text.push('\n');
                    text.push_str(traceback);
                }
                text.push_str(
                    "\nNow let's retry: take care not to repeat previous errors! \
                     Try a different approach if the same error keeps occurring.",
                );
            }
            None => {
                text.push_str("Last output: ");
                text.push_str(&render_value(&self.output));
            }
        }
        text
    }
}

/// Renders a value for prompts: strings without quotes, everything else as JSON.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_infrastructure_is_unrecoverable() {
        for kind in [
            ErrorKind::Schema,
            ErrorKind::Tool,
            ErrorKind::Execution,
            ErrorKind::UnknownCapability,
            ErrorKind::Timeout,
        ] {
            assert!(kind.is_recoverable(), "{kind} should be recoverable");
        }
        assert!(!ErrorKind::Infrastructure.is_recoverable());
    }

    #[test]
    fn kinds_serialize_as_kebab_tags() {
        let encoded = serde_json::to_value(ErrorKind::UnknownCapability).unwrap();
        assert_eq!(encoded, json!("unknown-capability"));
        let decoded: ErrorKind = serde_json::from_value(json!("infrastructure-error")).unwrap();
        assert_eq!(decoded, ErrorKind::Infrastructure);
    }

    #[test]
    fn observation_includes_logs_and_output() {
        let result = ExecutionResult::success(json!(4), "thinking\n");
        let text = result.observation();
        assert!(text.starts_with("Execution logs:\nthinking\n"));
        assert!(text.ends_with("Last output: 4"));
    }

    #[test]
    fn observation_reports_error_kind() {
        let result = ExecutionResult::failure(ErrorInfo::tool("division by zero"), "");
        let text = result.observation();
        assert!(text.contains("Error (tool-error): division by zero"));
        assert!(!text.contains("Last output"));
    }

    #[test]
    fn with_error_clears_final_answer() {
        let result = ExecutionResult::final_answer(json!("x"), "")
            .with_error(ErrorInfo::execution("rejected"));
        assert!(!result.is_final_answer());
        assert_eq!(result.error().map(ErrorInfo::kind), Some(ErrorKind::Execution));
    }
}
