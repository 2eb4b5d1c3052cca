//! Run journals: step records persisted as JSON lines.
//!
//! A journal file is a sequence of sessions, each in the
//! [`MemoryLog::to_jsonl`] format. A system prompt record opens a new
//! session, which is what an agent appends after its memory is reset. The
//! log's ordering rules are checked on every append and again on replay, so a
//! journal always replays into valid [`MemoryLog`]s.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::MemoryResult;
use crate::log::{MemoryLog, jsonl_line, jsonl_records};
use crate::record::{RecordKind, StepRecord};

/// Durable sink for the records of an agent's memory.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Persists `record` after the ones already journaled.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfOrder`](crate::MemoryError::OutOfOrder)
    /// when the record cannot follow the current session, leaving the journal
    /// unchanged, and I/O or serialization errors from the backend.
    async fn append(&self, record: &StepRecord) -> MemoryResult<()>;

    /// Replays every session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns backend errors and ordering violations found in storage.
    async fn sessions(&self) -> MemoryResult<Vec<MemoryLog>>;

    /// The last `limit` records across sessions, oldest first.
    ///
    /// # Errors
    ///
    /// Same as [`Self::sessions`].
    async fn tail(&self, limit: usize) -> MemoryResult<Vec<StepRecord>> {
        let sessions = self.sessions().await?;
        let mut records: Vec<StepRecord> = sessions
            .iter()
            .rev()
            .flat_map(|session| session.records().iter().rev())
            .take(limit)
            .cloned()
            .collect();
        records.reverse();
        Ok(records)
    }

    /// Drops everything journaled so far.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    async fn clear(&self) -> MemoryResult<()>;
}

/// Splits journal text into sessions, checking the ordering of each.
///
/// # Errors
///
/// Returns [`MemoryError::Serialization`](crate::MemoryError::Serialization)
/// for malformed lines and
/// [`MemoryError::OutOfOrder`](crate::MemoryError::OutOfOrder) for records a
/// session would not accept.
pub fn replay(input: &str) -> MemoryResult<Vec<MemoryLog>> {
    let mut sessions = Vec::new();
    let mut current = MemoryLog::new();
    for record in jsonl_records(input) {
        let record = record?;
        if record.kind() == RecordKind::SystemPrompt && !current.is_empty() {
            sessions.push(std::mem::take(&mut current));
        }
        current.append(record)?;
    }
    if !current.is_empty() {
        sessions.push(current);
    }
    Ok(sessions)
}

/// [`Journal`] appending to a local JSONL file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<Writer>,
}

#[derive(Debug)]
struct Writer {
    file: File,
    /// Session the next record has to follow.
    session: MemoryLog,
}

impl FileJournal {
    /// Opens the journal at `path`, creating it and its parent directories
    /// when missing. Appends continue the last session already in the file.
    ///
    /// # Errors
    ///
    /// Returns I/O errors and the replay errors of [`replay`] for existing
    /// content.
    pub async fn open(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let existing = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let mut sessions = replay(&existing)?;
        debug!(path = %path.display(), sessions = sessions.len(), "journal opened");
        let session = sessions.pop().unwrap_or_default();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: Mutex::new(Writer { file, session }),
        })
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, record: &StepRecord) -> MemoryResult<()> {
        let line = jsonl_line(record)?;
        let mut writer = self.writer.lock().await;
        if record.kind() == RecordKind::SystemPrompt {
            writer.session = MemoryLog::new();
        }
        writer.session.append(record.clone())?;
        writer.file.write_all(line.as_bytes()).await?;
        writer.file.flush().await?;
        Ok(())
    }

    async fn sessions(&self) -> MemoryResult<Vec<MemoryLog>> {
        let _writer = self.writer.lock().await;
        let text = fs::read_to_string(&self.path).await?;
        replay(&text)
    }

    async fn clear(&self) -> MemoryResult<()> {
        let mut writer = self.writer.lock().await;
        writer.file.set_len(0).await?;
        writer.file.flush().await?;
        writer.session = MemoryLog::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_primitives::ExecutionResult;
    use serde_json::json;
    use uuid::Uuid;

    use crate::MemoryError;
    use crate::record::{ActionRecord, FinalAnswerRecord, SystemPromptRecord, TaskRecord};

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("run-journal-{}.jsonl", Uuid::new_v4()))
    }

    fn session(prompt: &str, task: &str) -> MemoryLog {
        let mut log = MemoryLog::new();
        log.append(SystemPromptRecord::new(prompt)).unwrap();
        log.append(TaskRecord::new(task)).unwrap();
        log.append(ActionRecord::new(1, None, "", ExecutionResult::success(json!(1), "")))
            .unwrap();
        log.append(FinalAnswerRecord::new(Some(json!(task)))).unwrap();
        log
    }

    async fn journal_all(journal: &FileJournal, log: &MemoryLog) {
        for record in log.records() {
            journal.append(record).await.unwrap();
        }
    }

    #[tokio::test]
    async fn system_prompts_open_new_sessions() {
        let path = temp_path();
        let journal = FileJournal::open(&path).await.unwrap();
        let first = session("be brief", "one");
        let second = session("be brief", "two");
        journal_all(&journal, &first).await;
        journal_all(&journal, &second).await;

        let sessions = journal.sessions().await.unwrap();
        assert_eq!(sessions, [first, second.clone()]);

        let tail = journal.tail(2).await.unwrap();
        assert_eq!(tail, second.records()[2..]);
        assert_eq!(journal.tail(100).await.unwrap().len(), 8);
        assert!(journal.tail(0).await.unwrap().is_empty());

        let text = fs::read_to_string(&path).await.unwrap();
        assert!(text.ends_with(&second.to_jsonl().unwrap()));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn out_of_order_records_are_not_written() {
        let path = temp_path();
        let journal = FileJournal::open(&path).await.unwrap();
        journal.append(&TaskRecord::new("t").into()).await.unwrap();

        let skipped = ActionRecord::new(2, None, "", ExecutionResult::success(json!(null), ""));
        let err = journal.append(&skipped.into()).await.unwrap_err();
        assert!(matches!(err, MemoryError::OutOfOrder { .. }));
        assert_eq!(journal.tail(10).await.unwrap().len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn reopening_continues_the_last_session() {
        let path = temp_path();
        {
            let journal = FileJournal::open(&path).await.unwrap();
            journal.append(&TaskRecord::new("t").into()).await.unwrap();
        }
        let journal = FileJournal::open(&path).await.unwrap();
        let answer = StepRecord::from(FinalAnswerRecord::new(None));
        journal.append(&answer).await.unwrap();
        let err = journal.append(&answer).await.unwrap_err();
        assert!(matches!(err, MemoryError::OutOfOrder { .. }));

        journal.clear().await.unwrap();
        assert!(journal.sessions().await.unwrap().is_empty());
        journal.append(&TaskRecord::new("fresh").into()).await.unwrap();
        assert_eq!(journal.tail(10).await.unwrap().len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn corrupted_files_fail_to_open() {
        let path = temp_path();
        let answer = jsonl_line(&FinalAnswerRecord::new(None).into()).unwrap();
        fs::write(&path, answer).await.unwrap();
        let err = FileJournal::open(&path).await.unwrap_err();
        assert!(matches!(err, MemoryError::OutOfOrder { .. }));

        fs::write(&path, "not json\n").await.unwrap();
        let err = FileJournal::open(&path).await.unwrap_err();
        assert!(matches!(err, MemoryError::Serialization { .. }));
        let _ = std::fs::remove_file(path);
    }
}
