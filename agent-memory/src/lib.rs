//! Memory for agent runs.
//!
//! The [`MemoryLog`] is the single source of truth of a run: an append-only
//! sequence of [`StepRecord`]s from which the conversation sent to the model
//! is reconstructed. [`Callbacks`] observe records as they are appended and a
//! [`FileJournal`] exports them as JSON lines.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod journal;
mod log;
mod observer;
pub mod record;

pub use error::{MemoryError, MemoryResult};
pub use journal::{FileJournal, Journal};
pub use log::MemoryLog;
pub use observer::{Callbacks, JournalObserver, RecordCallback, StepObserver};
pub use record::{
    ActionRecord, FinalAnswerRecord, Message, PlanningRecord, RecordKind, Role, StepRecord,
    SystemPromptRecord, TaskRecord, Timing,
};
