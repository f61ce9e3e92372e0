//! # Error Handling Module
//!
//! Structured error handling for the agent: every fallible operation returns
//! `Result<T, AgentError>`, each variant carries enough context to decide a
//! retry/severity/category without re-parsing a string message.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the SIEM agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration validation or load failure.
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The durable queue could not be opened, read, or written.
    #[error("queue error: {message}")]
    Queue {
        message: String,
        operation: Option<String>,
        event_id: Option<Uuid>,
    },

    /// Durable queue storage is corrupt beyond recovery. Fatal at startup.
    #[error("queue storage corrupted: {message}")]
    QueueCorrupted { message: String },

    /// A source runner failed during initialization or while running.
    #[error("source error ({source_name}): {message}")]
    Source {
        source_name: String,
        message: String,
        retryable: bool,
    },

    /// Transient transport failure calling the remote collector (timeout,
    /// connection refused, 5xx). Always retryable by the queue/drainer.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        endpoint: Option<String>,
        status_code: Option<u16>,
        retry_after: Option<u64>,
    },

    /// Permanent transport failure (401/403, other 4xx except 408/429).
    /// Still funneled through the retry path; an operator must intervene.
    #[error("remote rejected request: {message}")]
    RemoteRejected {
        message: String,
        endpoint: Option<String>,
        status_code: u16,
    },

    /// Event serialization/deserialization failure.
    #[error("serialization error: {message}")]
    Serialization {
        message: String,
        event_id: Option<Uuid>,
    },

    /// The admin HTTP surface could not bind its listener. Fatal at startup.
    #[error("admin surface bind failure: {message}")]
    AdminBind { message: String },

    /// Generic I/O failure (file tailing, working-directory layout).
    #[error("io error: {message}")]
    Io {
        message: String,
        path: Option<String>,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Error severity for log-level selection and the health snapshot's
/// error/warning ring buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl AgentError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AgentError::Configuration { .. } => ErrorSeverity::High,
            AgentError::Queue { .. } => ErrorSeverity::Medium,
            AgentError::QueueCorrupted { .. } => ErrorSeverity::Critical,
            AgentError::Source { .. } => ErrorSeverity::Medium,
            AgentError::Transport { .. } => ErrorSeverity::Medium,
            AgentError::RemoteRejected { .. } => ErrorSeverity::High,
            AgentError::Serialization { .. } => ErrorSeverity::Low,
            AgentError::AdminBind { .. } => ErrorSeverity::Critical,
            AgentError::Io { .. } => ErrorSeverity::Medium,
            AgentError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// Whether the queue/drainer should keep retrying this failure rather
    /// than treating it as a hard drop. Per spec §7 even permanent
    /// transport errors are still retried — only validation/serialization
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Configuration { .. } => false,
            AgentError::Queue { .. } => true,
            AgentError::QueueCorrupted { .. } => false,
            AgentError::Source { retryable, .. } => *retryable,
            AgentError::Transport { .. } => true,
            AgentError::RemoteRejected { .. } => true,
            AgentError::Serialization { .. } => false,
            AgentError::AdminBind { .. } => false,
            AgentError::Io { .. } => true,
            AgentError::Internal { .. } => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Configuration { .. } => "configuration",
            AgentError::Queue { .. } => "queue",
            AgentError::QueueCorrupted { .. } => "queue_corrupted",
            AgentError::Source { .. } => "source",
            AgentError::Transport { .. } => "transport",
            AgentError::RemoteRejected { .. } => "remote_rejected",
            AgentError::Serialization { .. } => "serialization",
            AgentError::AdminBind { .. } => "admin_bind",
            AgentError::Io { .. } => "io",
            AgentError::Internal { .. } => "internal",
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>>(message: S, field: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
            operation: None,
            event_id: None,
        }
    }

    pub fn queue_op<S: Into<String>>(message: S, operation: S) -> Self {
        Self::Queue {
            message: message.into(),
            operation: Some(operation.into()),
            event_id: None,
        }
    }

    pub fn source<S: Into<String>>(source_name: S, message: S, retryable: bool) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization {
            message: err.to_string(),
            event_id: None,
        }
    }
}

impl From<sqlx::Error> for AgentError {
    fn from(err: sqlx::Error) -> Self {
        AgentError::Queue {
            message: err.to_string(),
            operation: None,
            event_id: None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        AgentError::Transport {
            message: err.to_string(),
            endpoint: err.url().map(|u| u.to_string()),
            status_code,
            retry_after: Some(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ranges_match_taxonomy() {
        assert_eq!(AgentError::configuration("x").severity(), ErrorSeverity::High);
        assert_eq!(
            AgentError::QueueCorrupted {
                message: "x".into()
            }
            .severity(),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn permanent_transport_errors_are_still_retryable() {
        let err = AgentError::RemoteRejected {
            message: "forbidden".into(),
            endpoint: None,
            status_code: 403,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!AgentError::configuration("bad batch size").is_retryable());
    }

    #[test]
    fn category_names_are_stable() {
        assert_eq!(AgentError::queue("x").category(), "queue");
        assert_eq!(
            AgentError::source("file_log", "boom", true).category(),
            "source"
        );
    }

    #[test]
    fn severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let agent_err: AgentError = io_err.into();
        assert!(matches!(agent_err, AgentError::Io { .. }));
    }
}
