//! Error types for the execution and session engines.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, WheelhouseError>;

/// Errors surfaced by the catalog, the execution engine and the auth service.
///
/// Mapping these to transport responses is the caller's job.
#[derive(Debug, Error, Diagnostic)]
pub enum WheelhouseError {
    /// Unknown command id, or an execution that is unknown, evicted, or whose
    /// command no longer resolves.
    #[error("command not found")]
    #[diagnostic(code(wheelhouse::command_not_found))]
    CommandNotFound,

    #[error("user is not authorized for this command")]
    #[diagnostic(code(wheelhouse::unauthorized))]
    Unauthorized,

    /// Unknown user and wrong password are deliberately the same error.
    #[error("provided credentials are invalid")]
    #[diagnostic(code(wheelhouse::credential_invalid))]
    CredentialInvalid,

    #[error("error while generating session token: {0}")]
    #[diagnostic(code(wheelhouse::token_generation_failed))]
    TokenGenerationFailed(String),

    #[error("no valid session for the provided token")]
    #[diagnostic(code(wheelhouse::no_valid_session))]
    NoValidSession,

    #[error("catalog unavailable: {0}")]
    #[diagnostic(code(wheelhouse::config_unavailable))]
    ConfigUnavailable(String),

    #[error("failed to spawn command: {0}")]
    #[diagnostic(code(wheelhouse::spawn))]
    Spawn(#[source] std::io::Error),

    #[error("wait for executions was cancelled")]
    #[diagnostic(code(wheelhouse::cancelled))]
    Cancelled,

    #[error("failed to read catalog {}: {source}", .path.display())]
    #[diagnostic(code(wheelhouse::catalog_read))]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog {}: {source}", .path.display())]
    #[diagnostic(
        code(wheelhouse::catalog_parse),
        help("the catalog must be a JSON object with `commands` and `users` arrays")
    )]
    CatalogParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("password hashing failed: {0}")]
    #[diagnostic(code(wheelhouse::password_hash))]
    PasswordHash(String),
}
