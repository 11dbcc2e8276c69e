//! Command execution engine.
//!
//! `execute` returns as soon as the execution is recorded. Output is streamed
//! by four tasks per execution:
//!
//! * two readers, one per pipe, sending lines into a shared channel and a
//!   closing marker when their stream ends,
//! * a merge task appending lines to the record in arrival order until both
//!   markers were seen,
//! * a wait task that waits for the process, then for the merge task, and only
//!   then writes the exit code.
//!
//! A reader that observes an exit code therefore always sees the complete log.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::access::{ensure_authorized, is_authorized, visible_commands};
use crate::catalog::Catalog;
use crate::error::{Result, WheelhouseError};
use crate::history::{ExecutionHistory, ExecutionRecord, LogAppend};
use crate::launcher::{OutputStream, ProcessHandle, ProcessLauncher};
use crate::storage::{
    Command, CommandExecution, ExecutionHistoryEntry, LogEntry, LogSlice, LogStream, User,
};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub history_capacity: usize,
    pub max_log_entries: usize, // Captured lines per execution before truncation
    pub max_line_bytes: usize,  // Longer lines are split into several entries
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

enum Captured {
    Line(LogEntry),
    Closed(LogStream),
}

#[derive(Debug)]
pub struct CommandEngine {
    catalog: Arc<dyn Catalog>,
    launcher: Arc<dyn ProcessLauncher>,
    history: ExecutionHistory,
    max_log_entries: usize,
    max_line_bytes: usize,
    outstanding: Arc<watch::Sender<usize>>,
}

impl CommandEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        launcher: Arc<dyn ProcessLauncher>,
        settings: EngineSettings,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            catalog,
            launcher,
            history: ExecutionHistory::new(settings.history_capacity),
            max_log_entries: settings.max_log_entries,
            max_line_bytes: settings.max_line_bytes.max(1),
            outstanding: Arc::new(outstanding),
        }
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Number of executions whose exit code has not been recorded yet.
    pub fn running(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn list_commands(&self, user: &User) -> Result<Vec<Command>> {
        let snapshot = self.catalog.snapshot()?;
        Ok(visible_commands(user, snapshot.commands()))
    }

    /// Start `command_id` for `user` and return the new execution id without
    /// waiting for the process.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn execute(&self, user: &User, command_id: &str) -> Result<u64> {
        let command = self
            .catalog
            .get_command_by_id(command_id)?
            .ok_or(WheelhouseError::CommandNotFound)?;
        ensure_authorized(user, &command)?;

        let process = self.launcher.spawn(&command.command).map_err(|err| {
            error!(command_id = %command.id, error = %err, "Failed to spawn command");
            WheelhouseError::Spawn(err)
        })?;

        let record = self.history.append(&command.id);
        let exec_id = record.exec_id();
        self.outstanding.send_modify(|n| *n += 1);
        info!(
            exec_id,
            command_id = %command.id,
            command_name = %command.name,
            user = %user.username,
            "Running command"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout = LineReader::new(exec_id, LogStream::Stdout, self.max_line_bytes, tx.clone());
        let stderr = LineReader::new(exec_id, LogStream::Stderr, self.max_line_bytes, tx);
        tokio::spawn(stdout.run(process.stdout));
        tokio::spawn(stderr.run(process.stderr));
        let merge = tokio::spawn(merge_log(rx, record.clone(), self.max_log_entries));
        tokio::spawn(await_exit(
            process.handle,
            merge,
            record,
            OutstandingGuard(self.outstanding.clone()),
        ));

        Ok(exec_id)
    }

    /// Role-filtered listing in ascending id order. Executions whose command
    /// is gone from the catalog are skipped.
    pub fn get_execution_history(&self, user: &User) -> Result<Vec<ExecutionHistoryEntry>> {
        let snapshot = self.catalog.snapshot()?;
        let mut entries = Vec::new();

        for record in self.history.list() {
            let Some(command) = snapshot.command(record.command_id()) else {
                warn!(
                    exec_id = record.exec_id(),
                    command_id = %record.command_id(),
                    "Command of execution no longer in catalog, skipping"
                );
                continue;
            };
            if !is_authorized(user, command) {
                continue;
            }
            entries.push(ExecutionHistoryEntry {
                exec_id: record.exec_id(),
                started_at: record.started_at(),
                command_name: command.name.clone(),
                exit_code: record.exit_code(),
            });
        }

        Ok(entries)
    }

    pub fn get_execution(&self, user: &User, exec_id: u64) -> Result<CommandExecution> {
        let (record, command) = self.authorized_record(user, exec_id)?;
        let (log, exit_code, truncated) = record.snapshot();
        Ok(CommandExecution {
            exec_id,
            command_id: command.id,
            command_name: command.name,
            started_at: record.started_at(),
            exit_code,
            truncated,
            log,
        })
    }

    /// Log entries from `start` on, for polling a running execution.
    pub fn get_execution_log(&self, user: &User, exec_id: u64, start: usize) -> Result<LogSlice> {
        let (record, _) = self.authorized_record(user, exec_id)?;
        Ok(record.log_since(start))
    }

    /// Wait until every started execution has recorded its exit code.
    ///
    /// Cancelling only stops the wait; running processes are left alone.
    pub async fn wait_executions(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail on a closed channel.
        tokio::select! {
            _ = rx.wait_for(|n| *n == 0) => Ok(()),
            _ = cancel.cancelled() => {
                warn!(running = self.running(), "Stopped waiting for executions");
                Err(WheelhouseError::Cancelled)
            }
        }
    }

    /// Role checks run against the current catalog, not the one at execution time.
    fn authorized_record(
        &self,
        user: &User,
        exec_id: u64,
    ) -> Result<(Arc<ExecutionRecord>, Command)> {
        let record = self
            .history
            .get(exec_id)
            .ok_or(WheelhouseError::CommandNotFound)?;
        let command = self
            .catalog
            .get_command_by_id(record.command_id())?
            .ok_or(WheelhouseError::CommandNotFound)?;
        ensure_authorized(user, &command)?;
        Ok((record, command))
    }
}

struct OutstandingGuard(Arc<watch::Sender<usize>>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Splits one pipe into log lines of at most `max_line_bytes` bytes.
struct LineReader {
    exec_id: u64,
    stream: LogStream,
    max_line_bytes: usize,
    tx: mpsc::UnboundedSender<Captured>,
}

impl LineReader {
    fn new(
        exec_id: u64,
        stream: LogStream,
        max_line_bytes: usize,
        tx: mpsc::UnboundedSender<Captured>,
    ) -> Self {
        Self {
            exec_id,
            stream,
            max_line_bytes,
            tx,
        }
    }

    async fn run(self, pipe: OutputStream) {
        let (exec_id, stream) = (self.exec_id, self.stream);
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        // Set after a line was cut at the byte limit, so its newline is not
        // taken for an empty line.
        let mut split = false;

        loop {
            let available = match reader.fill_buf().await {
                Ok(available) => available,
                Err(err) => {
                    if !line.is_empty() && !self.send_line(&mut line) {
                        return;
                    }
                    warn!(exec_id, %stream, error = %err, "Error reading command output");
                    let note = LogEntry::system(format!("error reading {stream}: {err}"));
                    let _ = self.tx.send(Captured::Line(note));
                    break;
                }
            };
            if available.is_empty() {
                if !line.is_empty() {
                    self.send_line(&mut line);
                }
                break;
            }

            let room = self.max_line_bytes - line.len();
            let window = &available[..available.len().min(room)];
            let (consumed, complete) = match window.iter().position(|b| *b == b'\n') {
                Some(pos) if split && (pos == 0 || (pos == 1 && window[0] == b'\r')) => {
                    (pos + 1, false)
                }
                Some(pos) => {
                    line.extend_from_slice(&window[..pos]);
                    (pos + 1, true)
                }
                None => {
                    line.extend_from_slice(window);
                    (window.len(), line.len() >= self.max_line_bytes)
                }
            };
            split = complete && consumed == window.len() && window.last() != Some(&b'\n');
            reader.consume(consumed);

            if complete && !self.send_line(&mut line) {
                return;
            }
        }
        let _ = self.tx.send(Captured::Closed(stream));
    }

    /// Returns false once the merge task is gone.
    fn send_line(&self, line: &mut Vec<u8>) -> bool {
        let mut bytes = std::mem::take(line);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let data = String::from_utf8_lossy(&bytes).into_owned();
        trace!(exec_id = self.exec_id, stream = %self.stream, output = %data, "Command output");
        self.tx
            .send(Captured::Line(LogEntry::new(self.stream, data)))
            .is_ok()
    }
}

async fn merge_log(
    mut rx: mpsc::UnboundedReceiver<Captured>,
    record: Arc<ExecutionRecord>,
    max_entries: usize,
) {
    let mut open = 2;
    while open > 0 {
        match rx.recv().await {
            Some(Captured::Line(entry)) => {
                if record.push_log(entry, max_entries) == LogAppend::Truncated {
                    warn!(exec_id = record.exec_id(), max_entries, "Log truncated");
                }
            }
            Some(Captured::Closed(stream)) => {
                debug!(exec_id = record.exec_id(), %stream, "Output stream closed");
                open -= 1;
            }
            // Both readers gone without a marker, e.g. after a panic.
            None => break,
        }
    }
}

async fn await_exit(
    mut handle: Box<dyn ProcessHandle>,
    merge: tokio::task::JoinHandle<()>,
    record: Arc<ExecutionRecord>,
    _guard: OutstandingGuard,
) {
    let exec_id = record.exec_id();
    let waited = handle.wait().await;

    if let Err(err) = merge.await {
        error!(exec_id, error = %err, "Log merge task failed");
    }

    let (exit_code, note) = match waited {
        Ok(code) => (code, None),
        Err(err) => {
            error!(exec_id, error = %err, "Waiting for command failed");
            (-1, Some(LogEntry::system(format!("error waiting for command: {err}"))))
        }
    };

    if exit_code != 0 {
        info!(exec_id, exit_code, "Command returned non-zero exit code");
    }
    record.finish(exit_code, note);
    info!(exec_id, exit_code, "Running command completed");
}
