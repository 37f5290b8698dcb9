//! Error types for Paperflow.
//!
//! Library crates use [`PaperflowError`] via `thiserror` for anything that can
//! abort a run. Per-record stage failures are reported as [`StageError`], whose
//! [`ErrorKind`] tells the orchestrator how to react without inspecting
//! message strings. App crates (cli) wrap both with `color-eyre`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for all Paperflow operations.
#[derive(Debug, thiserror::Error)]
pub enum PaperflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a stage invocation.
    #[error("network error: {0}")]
    Network(String),

    /// Record store (libsql) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The manifest could not be read, parsed or written.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (corpus format, schema mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A stage failure that escaped the per-record boundary.
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PaperflowError>;

impl PaperflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a manifest error from any displayable message.
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage error taxonomy
// ---------------------------------------------------------------------------

/// Broad handling class of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried with backoff; exhaustion becomes a failure record.
    Transient,
    /// Recorded once; the record continues without this stage's output.
    Permanent,
    /// Unreadable persisted artifact; treated as absent and discarded.
    Corruption,
    /// Aborts the run.
    Fatal,
}

/// Tagged discriminator carried by every [`StageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request timed out.
    Timeout,
    /// Connection could not be established or was reset.
    Connection,
    /// Source signalled throttling (HTTP 429 or equivalent).
    RateLimited,
    /// Source failed on its side (HTTP 5xx).
    Upstream,
    /// Source does not know the identifier.
    NotFound,
    /// Identifier or required input is missing or malformed.
    InvalidInput,
    /// Source refused the request permanently (other 4xx).
    Rejected,
    /// Response or persisted artifact could not be decoded.
    Corruption,
    /// Environment is broken (state dir unwritable, etc.).
    Fatal,
}

impl ErrorKind {
    /// Kinds retried by default when a stage declares nothing else.
    pub const DEFAULT_TRANSIENT: [ErrorKind; 3] =
        [ErrorKind::Timeout, ErrorKind::Connection, ErrorKind::RateLimited];

    /// Default class of this kind. Stages may widen the transient set
    /// (e.g. treat `Upstream` as retryable) via their descriptor.
    pub fn class(self) -> ErrorClass {
        match self {
            Self::Timeout | Self::Connection | Self::RateLimited | Self::Upstream => {
                ErrorClass::Transient
            }
            Self::NotFound | Self::InvalidInput | Self::Rejected => ErrorClass::Permanent,
            Self::Corruption => ErrorClass::Corruption,
            Self::Fatal => ErrorClass::Fatal,
        }
    }

    /// Stable snake_case name, used in logs and config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::RateLimited => "rate_limited",
            Self::Upstream => "upstream",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Rejected => "rejected",
            Self::Corruption => "corruption",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure produced by a stage or a source client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-provided hint for how long to wait before retrying.
    pub retry_after: Option<Duration>,
    /// Number of attempts made before giving up (1 when not retried).
    pub attempts: u32,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            attempts: 1,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn with_retry_after(mut self, after: Option<Duration>) -> Self {
        self.retry_after = after;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether `transient` (a stage's declared retry set) covers this error.
    pub fn is_retryable(&self, transient: &[ErrorKind]) -> bool {
        transient.contains(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PaperflowError::config("unknown stage 'foo'");
        assert_eq!(err.to_string(), "config error: unknown stage 'foo'");

        let err = PaperflowError::validation("line 3: missing record_id");
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn kinds_map_to_classes() {
        assert_eq!(ErrorKind::RateLimited.class(), ErrorClass::Transient);
        assert_eq!(ErrorKind::NotFound.class(), ErrorClass::Permanent);
        assert_eq!(ErrorKind::Corruption.class(), ErrorClass::Corruption);
        assert_eq!(ErrorKind::Fatal.class(), ErrorClass::Fatal);
    }

    #[test]
    fn stage_error_display_includes_kind() {
        let err = StageError::not_found("10.1000/xyz");
        assert_eq!(err.to_string(), "not_found: 10.1000/xyz");
    }

    #[test]
    fn retryable_respects_declared_set() {
        let err = StageError::new(ErrorKind::Upstream, "502");
        assert!(!err.is_retryable(&ErrorKind::DEFAULT_TRANSIENT));
        assert!(err.is_retryable(&[ErrorKind::Upstream, ErrorKind::Timeout]));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, r#""rate_limited""#);
        let parsed: ErrorKind = serde_json::from_str(r#""not_found""#).unwrap();
        assert_eq!(parsed, ErrorKind::NotFound);
    }
}
