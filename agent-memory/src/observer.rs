//! Synchronous hooks invoked as records are appended.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::journal::Journal;
use crate::log::MemoryLog;
use crate::record::{RecordKind, StepRecord};

/// Observer notified after every appended record and every streamed delta.
///
/// Calls happen on the loop's task, in append order, before the next model
/// call. Implementations should return quickly.
pub trait StepObserver: Send + Sync {
    /// Called once per appended record, with the log already containing it.
    fn on_record(&self, record: &StepRecord, log: &MemoryLog);

    /// Called for each partial content chunk of a streamed model response.
    fn on_stream_delta(&self, delta: &str) {
        let _ = delta;
    }
}

/// Callback registered for one record kind.
pub type RecordCallback = Arc<dyn Fn(&StepRecord, &MemoryLog) + Send + Sync>;

/// Observers and per-kind callbacks of one agent.
#[derive(Clone, Default)]
pub struct Callbacks {
    by_kind: BTreeMap<RecordKind, Vec<RecordCallback>>,
    observers: Vec<Arc<dyn StepObserver>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Callbacks {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for records of `kind`.
    pub fn on<F>(&mut self, kind: RecordKind, callback: F)
    where
        F: Fn(&StepRecord, &MemoryLog) + Send + Sync + 'static,
    {
        self.by_kind.entry(kind).or_default().push(Arc::new(callback));
    }

    /// Registers an observer for every record.
    pub fn observe(&mut self, observer: Arc<dyn StepObserver>) {
        self.observers.push(observer);
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty() && self.observers.is_empty()
    }

    /// Invokes kind callbacks, then observers, in registration order.
    pub fn notify(&self, record: &StepRecord, log: &MemoryLog) {
        if let Some(callbacks) = self.by_kind.get(&record.kind()) {
            for callback in callbacks {
                callback(record, log);
            }
        }
        for observer in &self.observers {
            observer.on_record(record, log);
        }
    }

    /// Forwards a streamed delta to every observer.
    pub fn notify_delta(&self, delta: &str) {
        for observer in &self.observers {
            observer.on_stream_delta(delta);
        }
    }
}

/// Observer that forwards records to a [`Journal`] from a background task.
///
/// Records reach the journal in append order. Write failures are logged and
/// do not interrupt the run.
#[derive(Debug)]
pub struct JournalObserver {
    sender: mpsc::UnboundedSender<StepRecord>,
}

impl JournalObserver {
    /// Spawns the writer task on the current tokio runtime. The task ends
    /// once the observer is dropped and pending records are written.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn spawn(journal: Arc<dyn Journal>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StepRecord>();
        let handle = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(err) = journal.append(&record).await {
                    warn!(kind = %record.kind(), error = %err, "failed to journal step record");
                }
            }
        });
        (Self { sender }, handle)
    }
}

impl StepObserver for JournalObserver {
    fn on_record(&self, record: &StepRecord, _log: &MemoryLog) {
        if self.sender.send(record.clone()).is_err() {
            warn!(kind = %record.kind(), "journal writer has stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use uuid::Uuid;

    use crate::journal::FileJournal;
    use crate::record::{FinalAnswerRecord, TaskRecord};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl StepObserver for Recorder {
        fn on_record(&self, record: &StepRecord, log: &MemoryLog) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}@{}", record.kind(), log.len()));
        }

        fn on_stream_delta(&self, delta: &str) {
            self.seen.lock().unwrap().push(format!("delta:{delta}"));
        }
    }

    #[test]
    fn callbacks_fire_by_kind_then_observers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder::default());
        let mut callbacks = Callbacks::new();
        let seen = Arc::clone(&order);
        callbacks.on(RecordKind::FinalAnswer, move |_, _| {
            seen.lock().unwrap().push("final");
        });
        callbacks.observe(recorder.clone());

        let mut log = MemoryLog::new();
        for record in [
            StepRecord::from(TaskRecord::new("t")),
            StepRecord::from(FinalAnswerRecord::new(None)),
        ] {
            let appended = log.append(record).unwrap().clone();
            callbacks.notify(&appended, &log);
        }
        callbacks.notify_delta("par");

        assert_eq!(*order.lock().unwrap(), ["final"]);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            ["task@1", "final_answer@2", "delta:par"]
        );
    }

    #[tokio::test]
    async fn journal_observer_writes_in_order() {
        let path = std::env::temp_dir().join(format!("journal-observer-{}.jsonl", Uuid::new_v4()));
        let journal = Arc::new(FileJournal::open(&path).await.unwrap());
        let (observer, writer) = JournalObserver::spawn(journal.clone());

        let mut log = MemoryLog::new();
        for task in ["a", "b"] {
            let record = log.append(TaskRecord::new(task)).unwrap().clone();
            observer.on_record(&record, &log);
        }
        drop(observer);
        writer.await.unwrap();

        let written = journal.tail(10).await.unwrap();
        assert_eq!(written, log.records());
        let _ = std::fs::remove_file(path);
    }
}
