//! Step records forming the memory log.

use std::fmt;
use std::time::Duration;

use agent_primitives::{Action, ExecutionResult, TokenUsage, render_value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wall-clock span of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl Timing {
    /// Starts a span now. The end equals the start until [`Self::finish`].
    #[must_use]
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            ended_at: now,
        }
    }

    /// Closes the span now.
    #[must_use]
    pub fn finish(mut self) -> Self {
        self.ended_at = Utc::now();
        self
    }

    /// When the step started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the step ended.
    #[must_use]
    pub const fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    /// Elapsed time, zero if the clock went backwards.
    #[must_use]
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Role of a message in the reconstructed conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// Task text from the caller.
    User,
    /// Model output.
    Assistant,
    /// Feedback from executing an action.
    Observation,
}

impl Role {
    /// Lowercase role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Observation => "observation",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role-tagged message fed to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who speaks.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// System message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// User message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Observation message.
    #[must_use]
    pub fn observation(content: impl Into<String>) -> Self {
        Self::new(Role::Observation, content)
    }
}

/// Discriminant of a [`StepRecord`], used to key callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// [`StepRecord::SystemPrompt`].
    SystemPrompt,
    /// [`StepRecord::Task`].
    Task,
    /// [`StepRecord::Planning`].
    Planning,
    /// [`StepRecord::Action`].
    Action,
    /// [`StepRecord::FinalAnswer`].
    FinalAnswer,
}

impl RecordKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SystemPrompt => "system_prompt",
            Self::Task => "task",
            Self::Planning => "planning",
            Self::Action => "action",
            Self::FinalAnswer => "final_answer",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instructions the agent was built with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptRecord {
    prompt: String,
}

impl SystemPromptRecord {
    /// Creates the record.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }

    /// Prompt text.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

/// Task given to one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    task: String,
}

impl TaskRecord {
    /// Creates the record.
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }

    /// Task text.
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }
}

/// Plan produced between action steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanningRecord {
    plan: String,
    #[serde(default)]
    token_usage: Option<TokenUsage>,
    timing: Timing,
}

impl PlanningRecord {
    /// Creates the record.
    #[must_use]
    pub fn new(plan: impl Into<String>, token_usage: Option<TokenUsage>, timing: Timing) -> Self {
        Self {
            plan: plan.into(),
            token_usage,
            timing,
        }
    }

    /// Plan text.
    #[must_use]
    pub fn plan(&self) -> &str {
        &self.plan
    }

    /// Tokens spent producing the plan.
    #[must_use]
    pub const fn token_usage(&self) -> Option<TokenUsage> {
        self.token_usage
    }

    /// When the plan was produced.
    #[must_use]
    pub const fn timing(&self) -> Timing {
        self.timing
    }
}

/// One iteration of the loop: model output, the action parsed from it and
/// the result of dispatching that action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    step_number: u32,
    #[serde(default)]
    action: Option<Action>,
    #[serde(default)]
    model_output: String,
    result: ExecutionResult,
    #[serde(default)]
    token_usage: Option<TokenUsage>,
    timing: Timing,
}

impl ActionRecord {
    /// Creates the record. `action` is `None` when nothing could be parsed
    /// from the model output.
    #[must_use]
    pub fn new(
        step_number: u32,
        action: Option<Action>,
        model_output: impl Into<String>,
        result: ExecutionResult,
    ) -> Self {
        Self {
            step_number,
            action,
            model_output: model_output.into(),
            result,
            token_usage: None,
            timing: Timing::start(),
        }
    }

    /// Attaches the model call's token usage.
    #[must_use]
    pub fn with_token_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.token_usage = usage;
        self
    }

    /// Sets the step's span.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// One-based step number within the run.
    #[must_use]
    pub const fn step_number(&self) -> u32 {
        self.step_number
    }

    /// Parsed action, if any.
    #[must_use]
    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    /// Raw model output.
    #[must_use]
    pub fn model_output(&self) -> &str {
        &self.model_output
    }

    /// Dispatch result.
    #[must_use]
    pub fn result(&self) -> &ExecutionResult {
        &self.result
    }

    /// Tokens spent on the model call.
    #[must_use]
    pub const fn token_usage(&self) -> Option<TokenUsage> {
        self.token_usage
    }

    /// When the step ran.
    #[must_use]
    pub const fn timing(&self) -> Timing {
        self.timing
    }

    fn action_message(&self) -> String {
        if !self.model_output.trim().is_empty() {
            return self.model_output.clone();
        }
        match &self.action {
            Some(Action::CodeBlock { source }) => format!("```py\n{source}\n```"),
            Some(Action::StructuredCall(call)) => format!(
                "Calling tool: {}",
                serde_json::json!({ "name": call.name(), "arguments": call.arguments() })
            ),
            None => String::new(),
        }
    }
}

/// Terminal record of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswerRecord {
    #[serde(default)]
    output: Option<Value>,
}

impl FinalAnswerRecord {
    /// Creates the record. `None` when the run ended without an answer.
    #[must_use]
    pub fn new(output: Option<Value>) -> Self {
        Self { output }
    }

    /// Answer, if one was produced.
    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }
}

/// Entry of the memory log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepRecord {
    /// Agent instructions; first record of the log.
    SystemPrompt(SystemPromptRecord),
    /// Start of a run.
    Task(TaskRecord),
    /// Plan between action steps.
    Planning(PlanningRecord),
    /// One loop iteration.
    Action(ActionRecord),
    /// End of a run.
    FinalAnswer(FinalAnswerRecord),
}

impl StepRecord {
    /// Discriminant of the record.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::SystemPrompt(_) => RecordKind::SystemPrompt,
            Self::Task(_) => RecordKind::Task,
            Self::Planning(_) => RecordKind::Planning,
            Self::Action(_) => RecordKind::Action,
            Self::FinalAnswer(_) => RecordKind::FinalAnswer,
        }
    }

    /// Token usage carried by the record.
    #[must_use]
    pub const fn token_usage(&self) -> Option<TokenUsage> {
        match self {
            Self::Planning(record) => record.token_usage,
            Self::Action(record) => record.token_usage,
            _ => None,
        }
    }

    /// The record's contribution to the reconstructed conversation.
    #[must_use]
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            Self::SystemPrompt(record) => vec![Message::system(record.prompt.clone())],
            Self::Task(record) => vec![Message::user(format!("New task:\n{}", record.task))],
            Self::Planning(record) => vec![Message::assistant(record.plan.clone())],
            Self::Action(record) => {
                let mut messages = Vec::with_capacity(2);
                let action = record.action_message();
                if !action.is_empty() {
                    messages.push(Message::assistant(action));
                }
                messages.push(Message::observation(format!(
                    "Observation:\n{}",
                    record.result.observation()
                )));
                messages
            }
            Self::FinalAnswer(record) => {
                let answer = record.output.as_ref().map_or_else(
                    || "no answer was produced".to_owned(),
                    render_value,
                );
                vec![Message::assistant(format!("Final answer: {answer}"))]
            }
        }
    }
}

impl From<SystemPromptRecord> for StepRecord {
    fn from(record: SystemPromptRecord) -> Self {
        Self::SystemPrompt(record)
    }
}

impl From<TaskRecord> for StepRecord {
    fn from(record: TaskRecord) -> Self {
        Self::Task(record)
    }
}

impl From<PlanningRecord> for StepRecord {
    fn from(record: PlanningRecord) -> Self {
        Self::Planning(record)
    }
}

impl From<ActionRecord> for StepRecord {
    fn from(record: ActionRecord) -> Self {
        Self::Action(record)
    }
}

impl From<FinalAnswerRecord> for StepRecord {
    fn from(record: FinalAnswerRecord) -> Self {
        Self::FinalAnswer(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_primitives::ErrorInfo;
    use serde_json::json;

    #[test]
    fn action_projects_to_assistant_and_observation() {
        let record = ActionRecord::new(
            1,
            Some(Action::code("print(1)")),
            "",
            ExecutionResult::success(Value::Null, "1\n"),
        );
        let messages = StepRecord::from(record).to_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "```py\nprint(1)\n```");
        assert_eq!(messages[1].role, Role::Observation);
        assert!(messages[1].content.starts_with("Observation:\nExecution logs:\n1\n"));
    }

    #[test]
    fn unparsed_step_still_reports_its_error() {
        let record = ActionRecord::new(
            2,
            None,
            "  ",
            ExecutionResult::failure(ErrorInfo::schema("no code block found"), ""),
        );
        let messages = StepRecord::from(record).to_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("schema-error"));
    }

    #[test]
    fn records_serialize_with_type_tag() {
        let record = StepRecord::from(FinalAnswerRecord::new(Some(json!(4))));
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded, json!({ "type": "final_answer", "output": 4 }));
    }

    #[test]
    fn timing_measures_elapsed_time() {
        let timing = Timing::start();
        assert_eq!(timing.duration(), Duration::ZERO);
        let finished = timing.finish();
        assert!(finished.ended_at() >= finished.started_at());
    }
}
