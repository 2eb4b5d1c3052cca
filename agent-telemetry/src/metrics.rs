//! In-memory counters fed by appended records.

use std::collections::BTreeMap;
use std::sync::Mutex;

use agent_memory::{MemoryLog, RecordKind, StepObserver, StepRecord};
use agent_primitives::TokenUsage;
use serde::Serialize;

/// Point-in-time copy of [`RunMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Appended records per kind.
    pub records: BTreeMap<RecordKind, u64>,
    /// Failed actions per error kind tag.
    pub errors: BTreeMap<String, u64>,
    /// Sum of token usage over planning and action records.
    pub token_usage: TokenUsage,
    /// Final answer records carrying an output.
    pub answered: u64,
    /// Final answer records without one.
    pub unanswered: u64,
}

/// Counters aggregated across every run the observer sees.
#[derive(Debug, Default)]
pub struct RunMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl RunMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current counters.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().expect("metrics lock poisoned").clone()
    }

    /// Zeroes every counter.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn reset(&self) {
        *self.inner.lock().expect("metrics lock poisoned") = MetricsSnapshot::default();
    }
}

impl StepObserver for RunMetrics {
    fn on_record(&self, record: &StepRecord, _log: &MemoryLog) {
        let mut metrics = self.inner.lock().expect("metrics lock poisoned");
        *metrics.records.entry(record.kind()).or_default() += 1;
        if let Some(usage) = record.token_usage() {
            metrics.token_usage += usage;
        }
        match record {
            StepRecord::Action(action) => {
                if let Some(error) = action.result().error() {
                    *metrics
                        .errors
                        .entry(error.kind().as_str().to_owned())
                        .or_default() += 1;
                }
            }
            StepRecord::FinalAnswer(answer) if answer.output().is_some() => metrics.answered += 1,
            StepRecord::FinalAnswer(_) => metrics.unanswered += 1,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_memory::{ActionRecord, FinalAnswerRecord, TaskRecord};
    use agent_primitives::{Action, ErrorInfo, ExecutionResult};
    use serde_json::json;

    fn feed(metrics: &RunMetrics, log: &mut MemoryLog, record: StepRecord) {
        log.append(record).unwrap();
        let last = log.last().unwrap().clone();
        metrics.on_record(&last, log);
    }

    #[test]
    fn counts_records_errors_and_tokens() {
        let metrics = RunMetrics::new();
        let mut log = MemoryLog::new();
        feed(&metrics, &mut log, TaskRecord::new("divide").into());
        feed(
            &metrics,
            &mut log,
            ActionRecord::new(
                1,
                Some(Action::call("divide", json!({"a": 1, "b": 0}))),
                "",
                ExecutionResult::failure(ErrorInfo::tool("division by zero"), ""),
            )
            .with_token_usage(Some(TokenUsage::new(10, 2)))
            .into(),
        );
        feed(
            &metrics,
            &mut log,
            ActionRecord::new(
                2,
                Some(Action::call("final_answer", json!({"answer": 1}))),
                "",
                ExecutionResult::final_answer(json!(1), ""),
            )
            .with_token_usage(Some(TokenUsage::new(12, 3)))
            .into(),
        );
        feed(&metrics, &mut log, FinalAnswerRecord::new(Some(json!(1))).into());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records[&RecordKind::Action], 2);
        assert_eq!(snapshot.errors["tool-error"], 1);
        assert_eq!(snapshot.token_usage, TokenUsage::new(22, 5));
        assert_eq!(snapshot.answered, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
