//! Per-run options and results.

use std::fmt;
use std::time::Duration;

use agent_memory::{RecordKind, StepRecord, Timing};
use agent_primitives::{ErrorInfo, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Overrides applied to a single run.
///
/// Unset limits fall back to the agent's configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    max_steps: Option<u32>,
    planning_interval: Option<u32>,
    reset: bool,
    return_full_result: bool,
    timeout: Option<Duration>,
    additional_args: Map<String, Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: None,
            planning_interval: None,
            reset: true,
            return_full_result: false,
            timeout: None,
            additional_args: Map::new(),
        }
    }
}

impl RunOptions {
    /// Options using every agent default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of action steps.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Plans before step 1 and every `interval` steps after.
    #[must_use]
    pub const fn planning_interval(mut self, interval: u32) -> Self {
        self.planning_interval = Some(interval);
        self
    }

    /// Whether memory and execution state are cleared first. Defaults to
    /// `true`; `false` continues the previous conversation.
    #[must_use]
    pub const fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Returns a [`RunOutput::Full`] instead of the bare answer.
    #[must_use]
    pub const fn full_result(mut self) -> Self {
        self.return_full_result = true;
        self
    }

    /// Wall-clock deadline for the whole run.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Extra inputs appended to the task and bound as variables in code.
    #[must_use]
    pub fn additional_args(mut self, args: Map<String, Value>) -> Self {
        self.additional_args = args;
        self
    }

    pub(crate) const fn max_steps_override(&self) -> Option<u32> {
        self.max_steps
    }

    pub(crate) const fn planning_interval_override(&self) -> Option<u32> {
        self.planning_interval
    }

    pub(crate) const fn should_reset(&self) -> bool {
        self.reset
    }

    pub(crate) const fn wants_full_result(&self) -> bool {
        self.return_full_result
    }

    pub(crate) const fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn extra_args(&self) -> &Map<String, Value> {
        &self.additional_args
    }
}

/// Terminal state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// An action produced the final answer.
    Succeeded,
    /// The step budget or the run deadline ran out first.
    #[serde(rename = "exhausted-step-budget")]
    Exhausted,
    /// An unrecoverable error ended the run.
    Failed,
}

impl RunState {
    /// Stable tag used in logs and serialized results.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted-step-budget",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a run produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Final answer, if any.
    pub output: Option<Value>,
    /// Terminal state.
    pub state: RunState,
    /// Snapshot of the agent's whole memory log.
    pub records: Vec<StepRecord>,
    /// Sum of every recorded token usage of this run.
    pub token_usage: TokenUsage,
    /// Wall-clock span of the run.
    pub timing: Timing,
    /// Error that ended a failed run.
    pub error: Option<ErrorInfo>,
}

impl RunResult {
    /// Records produced by this run after its task record: planning and
    /// action records followed by the final answer.
    #[must_use]
    pub fn steps(&self) -> &[StepRecord] {
        let start = self
            .records
            .iter()
            .rposition(|record| record.kind() == RecordKind::Task)
            .map_or(0, |index| index + 1);
        &self.records[start..]
    }

    /// Whether the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }
}

/// Value returned by [`Agent::run_with`](crate::Agent::run_with).
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutput {
    /// Final answer only (`null` when none was produced).
    Answer(Value),
    /// Full result, when requested.
    Full(Box<RunResult>),
}

impl RunOutput {
    /// Final answer, whichever form was requested.
    #[must_use]
    pub fn answer(&self) -> Option<&Value> {
        match self {
            Self::Answer(value) => Some(value),
            Self::Full(result) => result.output.as_ref(),
        }
    }

    /// Full result, if it was requested.
    #[must_use]
    pub fn into_result(self) -> Option<RunResult> {
        match self {
            Self::Answer(_) => None,
            Self::Full(result) => Some(*result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_memory::{FinalAnswerRecord, SystemPromptRecord, TaskRecord};
    use serde_json::json;

    #[test]
    fn states_serialize_with_their_tags() {
        assert_eq!(
            serde_json::to_value(RunState::Exhausted).unwrap(),
            json!("exhausted-step-budget")
        );
        assert_eq!(RunState::Succeeded.to_string(), "succeeded");
    }

    #[test]
    fn steps_start_after_the_last_task() {
        let result = RunResult {
            output: Some(json!(4)),
            state: RunState::Succeeded,
            records: vec![
                SystemPromptRecord::new("system").into(),
                TaskRecord::new("first").into(),
                FinalAnswerRecord::new(None).into(),
                TaskRecord::new("second").into(),
                FinalAnswerRecord::new(Some(json!(4))).into(),
            ],
            token_usage: TokenUsage::default(),
            timing: Timing::start(),
            error: None,
        };
        let steps = result.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind(), RecordKind::FinalAnswer);
    }

    #[test]
    fn options_default_to_reset() {
        let options = RunOptions::new().max_steps(3).full_result();
        assert!(options.should_reset());
        assert!(options.wants_full_result());
        assert_eq!(options.max_steps_override(), Some(3));
    }
}
