//! Common error types for menusync
//!
//! Errors fall into five families (see [`ErrorKind`]). Only the final,
//! unrecoverable case of a session is ever surfaced to a caller; everything
//! else is logged and absorbed by the component that detected it.

use thiserror::Error;

/// Common result type for menusync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error families used to decide recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused or closed (retried, then fatal)
    Transport,
    /// Stage idle limit exceeded (soft-recovered when partial data exists)
    Timeout,
    /// Malformed channel message (always recovered by skipping the message)
    Parse,
    /// Server reported `status: error` (soft-recovered when partial data exists)
    Pipeline,
    /// Backend migration validation failed (recovered by staying put)
    Consistency,
    /// Caller cancelled the operation
    Cancelled,
    /// Configuration, input or internal failures
    Other,
}

/// Common error types across menusync crates
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-level failure talking to the pipeline service
    #[error("Transport error at stage {stage}: {message}")]
    Transport { stage: u8, message: String },

    /// No event arrived within the idle budget of the current stage
    #[error("Timeout at stage {stage}: no event for {idle_ms} ms")]
    Timeout { stage: u8, idle_ms: u64 },

    /// A single call overran its budget
    #[error("Deadline exceeded after {budget_ms} ms: {operation}")]
    Deadline { operation: String, budget_ms: u64 },

    /// Message could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Pipeline reported an error for a stage
    #[error("Pipeline error at stage {stage}: {message}")]
    Pipeline { stage: u8, message: String },

    /// Reconnection budget spent
    #[error("Connection lost at stage {stage} after {attempts} reconnect attempts: {last_error}")]
    ReconnectExhausted {
        stage: u8,
        attempts: u32,
        last_error: String,
    },

    /// Source and target backends disagree after a copy
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Operation cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify this error into its recovery family
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } | Error::ReconnectExhausted { .. } => ErrorKind::Transport,
            Error::Timeout { .. } | Error::Deadline { .. } => ErrorKind::Timeout,
            Error::Parse(_) | Error::Json(_) => ErrorKind::Parse,
            Error::Pipeline { .. } => ErrorKind::Pipeline,
            Error::Consistency(_) => ErrorKind::Consistency,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_)
            | Error::NotFound(_)
            | Error::InvalidInput(_)
            | Error::Internal(_)
            | Error::Io(_) => ErrorKind::Other,
        }
    }

    /// Whether the component that saw this error may absorb it without
    /// surfacing it to the caller.
    ///
    /// Timeout and pipeline errors are only *conditionally* recoverable (they
    /// need partial data), so they report `false` here; the aggregator makes
    /// that decision.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Parse | ErrorKind::Consistency | ErrorKind::Transport
        ) && !matches!(self, Error::ReconnectExhausted { .. })
    }

    /// Stage the error relates to, if any
    pub fn stage(&self) -> Option<u8> {
        match self {
            Error::Transport { stage, .. }
            | Error::Timeout { stage, .. }
            | Error::Pipeline { stage, .. }
            | Error::ReconnectExhausted { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
