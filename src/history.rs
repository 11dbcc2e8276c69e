//! Bounded, in-memory execution history.
//!
//! External execution ids are `index + offset`; every eviction advances the
//! offset so ids stay strictly increasing and are never handed out twice.
//! The buffer's shape is guarded by one lock, while each record guards its own
//! log so running executions do not contend with listings.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::storage::{LogEntry, LogSlice};

/// One execution, shared between the history and the tasks streaming into it.
#[derive(Debug)]
pub struct ExecutionRecord {
    exec_id: u64,
    command_id: String,
    started_at: DateTime<Utc>,
    state: Mutex<ExecutionState>,
}

#[derive(Debug, Default)]
struct ExecutionState {
    log: Vec<LogEntry>,
    exit_code: Option<i32>,
    truncated: bool,
}

/// What happened to a log line offered to [`ExecutionRecord::push_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAppend {
    Appended,
    /// The limit was reached with this line; a truncation marker was appended instead.
    Truncated,
    Dropped,
}

pub const TRUNCATION_NOTICE: &str = "log truncated";

impl ExecutionRecord {
    fn new(exec_id: u64, command_id: String) -> Self {
        Self {
            exec_id,
            command_id,
            started_at: Utc::now(),
            state: Mutex::new(ExecutionState::default()),
        }
    }

    pub fn exec_id(&self) -> u64 {
        self.exec_id
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Append a captured line unless `max_entries` captured lines are already stored.
    pub fn push_log(&self, entry: LogEntry, max_entries: usize) -> LogAppend {
        let mut state = self.state.lock();
        if state.truncated {
            return LogAppend::Dropped;
        }
        if state.log.len() >= max_entries {
            state.truncated = true;
            state.log.push(LogEntry::system(TRUNCATION_NOTICE));
            return LogAppend::Truncated;
        }
        state.log.push(entry);
        LogAppend::Appended
    }

    /// Record the exit code, optionally with a closing system note written in
    /// the same critical section. Returns false if an exit code was already set.
    pub fn finish(&self, exit_code: i32, note: Option<LogEntry>) -> bool {
        let mut state = self.state.lock();
        if state.exit_code.is_some() {
            return false;
        }
        if let Some(note) = note {
            state.log.push(note);
        }
        state.exit_code = Some(exit_code);
        true
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Log, exit code and truncation flag, read atomically.
    pub fn snapshot(&self) -> (Vec<LogEntry>, Option<i32>, bool) {
        let state = self.state.lock();
        (state.log.clone(), state.exit_code, state.truncated)
    }

    pub fn log_since(&self, start: usize) -> LogSlice {
        let state = self.state.lock();
        let entries = state
            .log
            .get(start..)
            .map(<[LogEntry]>::to_vec)
            .unwrap_or_default();
        LogSlice {
            start,
            entries,
            exit_code: state.exit_code,
        }
    }
}

#[derive(Debug)]
struct HistoryBuffer {
    records: VecDeque<Arc<ExecutionRecord>>,
    offset: u64,
}

#[derive(Debug)]
pub struct ExecutionHistory {
    capacity: usize,
    inner: RwLock<HistoryBuffer>,
}

impl ExecutionHistory {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: RwLock::new(HistoryBuffer {
                records: VecDeque::with_capacity(capacity),
                offset: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate the next id and append a fresh record, evicting the oldest
    /// records when full.
    pub fn append(&self, command_id: &str) -> Arc<ExecutionRecord> {
        let mut buffer = self.inner.write();

        if buffer.records.len() >= self.capacity {
            let evict = buffer.records.len() - self.capacity + 1;
            buffer.records.drain(..evict);
            buffer.offset += evict as u64;
            debug!(evicted = evict, offset = buffer.offset, "Evicted executions from history");
        }

        let exec_id = buffer.offset + buffer.records.len() as u64;
        let record = Arc::new(ExecutionRecord::new(exec_id, command_id.to_string()));
        buffer.records.push_back(record.clone());
        record
    }

    /// `None` for ids that never existed and for evicted ones alike.
    pub fn get(&self, exec_id: u64) -> Option<Arc<ExecutionRecord>> {
        let buffer = self.inner.read();
        let index = exec_id.checked_sub(buffer.offset)?;
        buffer.records.get(usize::try_from(index).ok()?).cloned()
    }

    /// All retained records in ascending id order.
    pub fn list(&self) -> Vec<Arc<ExecutionRecord>> {
        self.inner.read().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
