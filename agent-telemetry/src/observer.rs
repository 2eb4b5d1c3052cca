//! Step observer writing records to `tracing`.

use agent_memory::{MemoryLog, StepObserver, StepRecord};
use tracing::{debug, info, trace, warn};

/// Logs each appended record with structured fields: `debug` for steps,
/// `info` for final answers and `warn` for failed actions.
#[derive(Clone, Debug)]
pub struct TracingStepObserver {
    agent: String,
}

impl TracingStepObserver {
    /// Creates an observer tagging events with `agent`.
    #[must_use]
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl StepObserver for TracingStepObserver {
    fn on_record(&self, record: &StepRecord, log: &MemoryLog) {
        let agent = self.agent.as_str();
        let kind = record.kind().as_str();
        match record {
            StepRecord::Action(action) => {
                let usage = action.token_usage().unwrap_or_default();
                let duration_ms = millis(action.timing().duration());
                match action.result().error() {
                    Some(error) => warn!(
                        agent,
                        kind,
                        step = action.step_number(),
                        duration_ms,
                        error_kind = %error.kind(),
                        error = error.message(),
                        "action failed"
                    ),
                    None => debug!(
                        agent,
                        kind,
                        step = action.step_number(),
                        duration_ms,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        final_answer = action.result().is_final_answer(),
                        "action recorded"
                    ),
                }
            }
            StepRecord::Planning(plan) => {
                let usage = plan.token_usage().unwrap_or_default();
                debug!(
                    agent,
                    kind,
                    duration_ms = millis(plan.timing().duration()),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "plan recorded"
                );
            }
            StepRecord::FinalAnswer(answer) => {
                let usage = log.total_token_usage();
                info!(
                    agent,
                    kind,
                    answered = answer.output().is_some(),
                    steps = log.action_records().count(),
                    total_tokens = usage.total(),
                    "run ended"
                );
            }
            StepRecord::SystemPrompt(_) | StepRecord::Task(_) => {
                debug!(agent, kind, records = log.len(), "record appended");
            }
        }
    }

    fn on_stream_delta(&self, delta: &str) {
        trace!(agent = %self.agent, bytes = delta.len(), "stream delta");
    }
}
