//! Append-only log of step records.

use std::fmt::Write as _;

use agent_primitives::TokenUsage;
use serde::Serialize;

use crate::record::{ActionRecord, Message, RecordKind, StepRecord};
use crate::{MemoryError, MemoryResult};

/// Ordered, append-only sequence of [`StepRecord`]s owned by one agent.
///
/// Ordering rules enforced on append:
///
/// - a system prompt may only open the log;
/// - planning, action and final-answer records need an open task;
/// - action step numbers start at 1 and grow by one within a task;
/// - nothing but a new task follows a final answer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MemoryLog {
    records: Vec<StepRecord>,
    #[serde(skip)]
    cursor: Cursor,
    #[serde(skip)]
    running: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Cursor {
    #[default]
    Idle,
    InTask {
        last_step: u32,
    },
    Finished,
}

impl MemoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record after checking the ordering rules.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfOrder`] when the record breaks an
    /// ordering rule; the log is left unchanged.
    pub fn append(&mut self, record: impl Into<StepRecord>) -> MemoryResult<&StepRecord> {
        let record = record.into();
        self.cursor = self.next_cursor(&record)?;
        self.records.push(record);
        Ok(&self.records[self.records.len() - 1])
    }

    fn next_cursor(&self, record: &StepRecord) -> MemoryResult<Cursor> {
        match (record, self.cursor) {
            (StepRecord::SystemPrompt(_), _) if self.records.is_empty() => Ok(Cursor::Idle),
            (StepRecord::SystemPrompt(_), _) => Err(MemoryError::out_of_order(
                "a system prompt can only open the log",
            )),
            (StepRecord::Task(_), _) => Ok(Cursor::InTask { last_step: 0 }),
            (StepRecord::Planning(_), Cursor::InTask { last_step }) => {
                Ok(Cursor::InTask { last_step })
            }
            (StepRecord::Action(action), Cursor::InTask { last_step }) => {
                let expected = last_step + 1;
                if action.step_number() == expected {
                    Ok(Cursor::InTask {
                        last_step: expected,
                    })
                } else {
                    Err(MemoryError::out_of_order(format!(
                        "expected action step {expected}, got {}",
                        action.step_number()
                    )))
                }
            }
            (StepRecord::FinalAnswer(_), Cursor::InTask { .. }) => Ok(Cursor::Finished),
            (other, _) => Err(MemoryError::out_of_order(format!(
                "{} record without an open task",
                other.kind()
            ))),
        }
    }

    /// All records in append order.
    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent record.
    #[must_use]
    pub fn last(&self) -> Option<&StepRecord> {
        self.records.last()
    }

    /// Action records in order.
    pub fn action_records(&self) -> impl Iterator<Item = &ActionRecord> {
        self.records.iter().filter_map(|record| match record {
            StepRecord::Action(action) => Some(action),
            _ => None,
        })
    }

    /// Records of the most recent task, from its task record on.
    #[must_use]
    pub fn current_run(&self) -> &[StepRecord] {
        let start = self
            .records
            .iter()
            .rposition(|record| record.kind() == RecordKind::Task)
            .unwrap_or(self.records.len());
        &self.records[start..]
    }

    /// Step number of the last action in the current task, 0 if none.
    #[must_use]
    pub const fn last_step(&self) -> u32 {
        match self.cursor {
            Cursor::InTask { last_step } => last_step,
            _ => 0,
        }
    }

    /// Sum of every recorded token usage.
    #[must_use]
    pub fn total_token_usage(&self) -> TokenUsage {
        self.records.iter().filter_map(StepRecord::token_usage).sum()
    }

    /// Marks the start of a run. While running, [`Self::reset`] is refused.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RunInProgress`] if a run is already active.
    pub fn begin_run(&mut self) -> MemoryResult<()> {
        if self.running {
            return Err(MemoryError::RunInProgress);
        }
        self.running = true;
        Ok(())
    }

    /// Marks the end of a run.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NoRunInProgress`] when no run was started.
    pub fn end_run(&mut self) -> MemoryResult<()> {
        if !self.running {
            return Err(MemoryError::NoRunInProgress);
        }
        self.running = false;
        Ok(())
    }

    /// Whether a run is active.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Clears every record.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RunInProgress`] during a run.
    pub fn reset(&mut self) -> MemoryResult<()> {
        if self.running {
            return Err(MemoryError::RunInProgress);
        }
        self.records.clear();
        self.cursor = Cursor::Idle;
        Ok(())
    }

    /// Projects the log into the conversation the model sees.
    ///
    /// Pure and deterministic: the same log always yields the same messages.
    #[must_use]
    pub fn reconstruct_conversation(&self) -> Vec<Message> {
        self.records.iter().flat_map(StepRecord::to_messages).collect()
    }

    /// Compact text rendering of the current task's work, without the system
    /// prompt.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut text = String::new();
        for message in self.current_run().iter().flat_map(StepRecord::to_messages) {
            let _ = writeln!(text, "[{}] {}", message.role, message.content.trim_end());
        }
        text
    }

    /// Serializes the records as newline-delimited JSON.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Serialization`] if a record cannot be encoded.
    pub fn to_jsonl(&self) -> MemoryResult<String> {
        self.records.iter().map(jsonl_line).collect()
    }

    /// Rebuilds a log from [`Self::to_jsonl`] output, re-checking ordering.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Serialization`] for malformed lines and
    /// [`MemoryError::OutOfOrder`] for a sequence the log would not accept.
    pub fn from_jsonl(input: &str) -> MemoryResult<Self> {
        let mut log = Self::new();
        for record in jsonl_records(input) {
            log.append(record?)?;
        }
        Ok(log)
    }
}

/// Encodes one record as a JSON line, newline included.
pub(crate) fn jsonl_line(record: &StepRecord) -> MemoryResult<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Decodes the non-blank lines of `input`.
pub(crate) fn jsonl_records(input: &str) -> impl Iterator<Item = MemoryResult<StepRecord>> + '_ {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
}
