//! Error types for taskboard
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, invalid config, invalid task fields)
//! - 4: Operation failed (fetch, mutation, feed, malformed input)
//!
//! Only fetch and mutation failures are meant to reach an end user; everything
//! else is recovered at the store/normalizer boundary.

use std::fmt;

use thiserror::Error;

use crate::task::TaskId;

/// Exit codes for the taskboard CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Which mutation RPC failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// Main error type for taskboard operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    // Operation failures (exit code 4)
    #[error("Failed to load tasks: {0}")]
    FetchFailed(String),

    #[error("Failed to {op} task: {message}")]
    MutationFailed { op: MutationKind, message: String },

    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    #[error("Change feed failed: {0}")]
    FeedFailed(String),

    #[error("View session is closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::InvalidTask(_)
            | Error::TaskNotFound(_) => exit_codes::USER_ERROR,

            // Operation failures
            Error::FetchFailed(_)
            | Error::MutationFailed { .. }
            | Error::MalformedEvent(_)
            | Error::FeedFailed(_)
            | Error::SessionClosed
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Whether a UI should surface this error to the user.
    ///
    /// A failed bulk load becomes a page-level error state and a failed
    /// mutation is shown next to the control that triggered it. Everything
    /// else is handled inside the engine.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Error::FetchFailed(_) | Error::MutationFailed { .. })
    }

    /// Structured details for JSON error output, when there are any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::TaskNotFound(id) => Some(serde_json::json!({ "task_id": id.as_str() })),
            Error::MutationFailed { op, .. } => Some(serde_json::json!({ "op": op.to_string() })),
            _ => None,
        }
    }
}

/// Result type alias for taskboard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
