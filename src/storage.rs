use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Command {
    #[serde(skip_deserializing, default)]
    pub id: String,           // SHA256 hash of the command text
    pub name: String,         // Display name
    pub command: String,      // Shell command text
    #[serde(default)]
    pub role: Option<String>, // Role required to see, run and review this command
}

impl Command {
    pub fn new(name: impl Into<String>, command: impl Into<String>, role: Option<&str>) -> Self {
        let command = command.into();
        Self {
            id: hash_command(&command),
            name: name.into(),
            command,
            role: role.map(str::to_string),
        }
    }
}

/// Stable command identifier: lowercase hex SHA-256 of the command text.
pub fn hash_command(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password_hash: String, // Argon2 PHC string
    #[serde(default)]
    pub roles: Vec<String>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System, // Entries produced by the engine itself
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub stream: LogStream,
    pub data: String, // One line, without the trailing newline
}

impl LogEntry {
    pub fn new(stream: LogStream, data: impl Into<String>) -> Self {
        Self {
            stream,
            data: data.into(),
        }
    }

    pub fn system(data: impl Into<String>) -> Self {
        Self::new(LogStream::System, data)
    }
}

/// Full view of one execution, taken atomically from its record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CommandExecution {
    pub exec_id: u64,
    pub command_id: String,
    pub command_name: String,      // Resolved from the catalog at read time
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,    // None while running
    pub truncated: bool,
    pub log: Vec<LogEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExecutionHistoryEntry {
    pub exec_id: u64,
    pub started_at: DateTime<Utc>,
    pub command_name: String,
    pub exit_code: Option<i32>,
}

/// Incremental log read used for polling a running execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSlice {
    pub start: usize,
    pub entries: Vec<LogEntry>,
    pub exit_code: Option<i32>, // Read under the same lock as `entries`
}
