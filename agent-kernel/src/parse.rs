//! Extraction of actions from model output.

use std::sync::LazyLock;

use agent_adapters::ModelResponse;
use agent_primitives::{Action, ActionMode, ErrorInfo, ToolCall};
use regex::Regex;
use serde_json::{Value, json};
use tracing::warn;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:py|python|code)?[ \t]*\r?\n(.*?)```").expect("static regex is valid")
});

/// JSON schema requested from the model when structured outputs are enabled
/// in code mode.
#[must_use]
pub fn structured_output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "thought": {"type": "string", "description": "Reasoning behind the code"},
            "code": {"type": "string", "description": "Python code to run"}
        },
        "required": ["thought", "code"],
        "additionalProperties": false
    })
}

/// Extracts the step's action from a model response.
///
/// # Errors
///
/// Returns a `schema-error` describing the expected format when the response
/// carries no usable action.
pub fn parse_action(
    mode: ActionMode,
    structured: bool,
    response: &ModelResponse,
) -> Result<Action, ErrorInfo> {
    match mode {
        ActionMode::Code if structured => parse_structured_code(&response.content).map(Action::code),
        ActionMode::Code => parse_code(&response.content).map(Action::code),
        ActionMode::ToolCalling => {
            if let Some(first) = response.tool_calls.first() {
                if response.tool_calls.len() > 1 {
                    warn!(
                        calls = response.tool_calls.len(),
                        "model requested several tool calls; only the first runs"
                    );
                }
                return Ok(Action::StructuredCall(first.clone()));
            }
            parse_tool_call(&response.content).map(Action::StructuredCall)
        }
    }
}

/// Returns the body of the first fenced code block in `content`.
///
/// # Errors
///
/// Returns a `schema-error` when no non-empty block is present.
pub fn parse_code(content: &str) -> Result<String, ErrorInfo> {
    let code = CODE_FENCE
        .captures(content)
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str().trim_end().to_owned())
        .filter(|code| !code.trim().is_empty());
    code.ok_or_else(|| {
        ErrorInfo::schema(format!(
            "no code block found in the model output. Make sure to provide your code as\n\
             Thought: your reasoning\nCode:\n```py\n# your code\n```<end_code>\n\
             Model output was:\n{}",
            excerpt(content)
        ))
    })
}

/// Reads the `code` field of a `{thought, code}` JSON answer. A fenced block
/// inside the field is unwrapped.
///
/// # Errors
///
/// Returns a `schema-error` when the content is not such an object.
pub fn parse_structured_code(content: &str) -> Result<String, ErrorInfo> {
    let value = json_object(content).ok_or_else(|| {
        ErrorInfo::schema(format!(
            "expected a JSON object with `thought` and `code` fields, got:\n{}",
            excerpt(content)
        ))
    })?;
    let code = value
        .get("code")
        .and_then(Value::as_str)
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| ErrorInfo::schema("the JSON answer has no non-empty `code` string"))?;
    if code.contains("```") {
        return parse_code(code);
    }
    Ok(code.to_owned())
}

/// Reads a `{"name": .., "arguments": ..}` blob embedded in `content`.
///
/// # Errors
///
/// Returns a `schema-error` when no such blob is present.
pub fn parse_tool_call(content: &str) -> Result<ToolCall, ErrorInfo> {
    let value = json_object(content).ok_or_else(|| {
        ErrorInfo::schema(format!(
            "no tool call found. Call exactly one tool with a JSON blob like \
             {{\"name\": \"tool_name\", \"arguments\": {{\"arg\": \"value\"}}}}. \
             Model output was:\n{}",
            excerpt(content)
        ))
    })?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorInfo::schema("the tool call blob has no `name` string"))?;
    let arguments = value.get("arguments").cloned().unwrap_or(Value::Null);
    Ok(ToolCall::new(name, arguments))
}

/// Parses the span from the first `{` to the last `}` as a JSON object.
fn json_object(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&content[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn excerpt(content: &str) -> &str {
    const LIMIT: usize = 500;
    if content.len() <= LIMIT {
        return content;
    }
    let mut end = LIMIT;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_primitives::ErrorKind;

    fn response(content: &str) -> ModelResponse {
        ModelResponse {
            content: content.to_owned(),
            ..ModelResponse::default()
        }
    }

    #[test]
    fn extracts_the_first_code_block() {
        let content = "Thought: add.\n```py\nx = 2 + 2\nfinal_answer(x)\n```<end_code>\n```py\nignored()\n```";
        assert_eq!(parse_code(content).unwrap(), "x = 2 + 2\nfinal_answer(x)");

        let bare = "```\nprint(1)\n```";
        assert_eq!(parse_code(bare).unwrap(), "print(1)");
    }

    #[test]
    fn missing_code_is_a_schema_error() {
        let err = parse_code("I think the answer is 4.").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.message().contains("I think the answer is 4."));
    }

    #[test]
    fn reads_structured_code() {
        let content = r#"{"thought": "easy", "code": "final_answer(4)"}"#;
        assert_eq!(parse_structured_code(content).unwrap(), "final_answer(4)");

        let err = parse_structured_code(r#"{"thought": "no code"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn reads_tool_call_blobs() {
        let content = "Action:\n{\"name\": \"divide\", \"arguments\": {\"a\": 1, \"b\": 2}}";
        let call = parse_tool_call(content).unwrap();
        assert_eq!(call.name(), "divide");
        assert_eq!(call.arguments()["b"], 2);

        assert!(parse_tool_call("no json here").is_err());
        assert!(parse_tool_call("{\"arguments\": {}}").is_err());
    }

    #[test]
    fn native_tool_calls_win_over_content() {
        let mut model = response("{\"name\": \"ignored\"}");
        model.tool_calls = vec![
            ToolCall::new("final_answer", json!({"answer": 4})),
            ToolCall::new("second", Value::Null),
        ];
        let action = parse_action(ActionMode::ToolCalling, false, &model).unwrap();
        assert_eq!(action.label(), "final_answer");
    }

    #[test]
    fn code_mode_uses_the_fence() {
        let action = parse_action(ActionMode::Code, false, &response("```py\nfinal_answer(4)\n```"))
            .unwrap();
        assert_eq!(action, Action::code("final_answer(4)"));
    }
}
