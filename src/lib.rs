//! Run a fixed catalog of shell commands on behalf of authenticated operators.
//!
//! [`CommandEngine`] authorizes and launches commands, streams their output
//! into a bounded [`ExecutionHistory`], and records exit codes. [`AuthService`]
//! turns catalog credentials into session tokens. Both read users and commands
//! from a [`Catalog`].

pub mod access;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod launcher;
pub mod storage;

pub use auth::{AuthService, Clock, LoginGrant, ManualClock, SystemClock};
pub use catalog::{Catalog, CatalogSnapshot, JsonCatalog, MemoryCatalog};
pub use config::Config;
pub use error::{Result, WheelhouseError};
pub use executor::{CommandEngine, EngineSettings};
pub use history::ExecutionHistory;
pub use launcher::{ProcessLauncher, ShellLauncher};
pub use storage::{Command, CommandExecution, ExecutionHistoryEntry, LogEntry, LogStream, User};
