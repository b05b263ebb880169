//! # Error Taxonomy
//!
//! One error type for the whole controller, split along the retry boundary:
//! validation and credential problems are permanent for the current spec,
//! I/O and subprocess failures are temporary and get requeued, and only
//! `Fatal` unwinds out of the control loop.

use std::time::Duration;

use thiserror::Error;

/// Controller-wide error type.
///
/// The reconcilers translate every variant except [`Error::Fatal`] into a
/// status condition plus a requeue decision; `Fatal` terminates the process.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed user input (hostname, URL, username, path). Never retried.
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// A referenced secret is missing or lacks the expected key.
    /// Skipped this tick and re-checked on the next one.
    #[error("credential error: {0}")]
    Credential(String),

    /// Kubernetes API, Git network, SSH connect, file transfer. Retried by
    /// the retry engine where idempotent, otherwise requeued.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] anyhow::Error),

    /// Non-zero exit from an external command. The captured stderr tail is
    /// carried for the condition message.
    #[error("command `{command}` failed with exit code {exit_code:?}")]
    ExternalCommand {
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// A command exceeded its wall-clock ceiling and was terminated.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// All retry attempts for an idempotent operation were exhausted.
    #[error("retries exhausted for {operation}")]
    RetryExhausted {
        operation: String,
        #[source]
        cause: anyhow::Error,
    },

    /// The Kubernetes client could not be initialized or another condition
    /// the controller cannot run without. Exits non-zero.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl Error {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable label used in condition reasons and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Credential(_) => "MissingCredentials",
            Self::TransientIo(_) => "TransientIOError",
            Self::ExternalCommand { .. } => "ExternalCommandFailure",
            Self::Timeout { .. } => "TimeoutError",
            Self::RetryExhausted { .. } => "RetryExhausted",
            Self::Fatal(_) => "FatalOperatorError",
        }
    }

    /// Whether a failed operation may legitimately be attempted again
    /// without a spec change.
    pub fn is_temporary(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::Fatal(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::TransientIo(err.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_permanent() {
        let err = Error::validation("hostname", "contains ;");
        assert_eq!(err.kind(), "ValidationError");
        assert!(!err.is_temporary());
    }

    #[test]
    fn io_errors_are_temporary() {
        let err = Error::TransientIo(anyhow::anyhow!("connection reset"));
        assert!(err.is_temporary());
        assert_eq!(err.kind(), "TransientIOError");
    }

    #[test]
    fn command_failure_carries_tail() {
        let err = Error::ExternalCommand {
            command: "nix run".into(),
            exit_code: Some(1),
            stderr_tail: "error: build failed".into(),
        };
        assert!(err.is_temporary());
        assert!(err.to_string().contains("nix run"));
    }
}
