//! Error taxonomy
//!
//! Provider failures are classified once, in the HTTP layer, into the closed
//! [`HydrateError`] set. Everything downstream matches on these kinds and never
//! looks at raw status codes or response bodies.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable, machine-readable error kind reported in diagnostics and statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthError,
    UnknownTable,
    UnknownColumn,
    PermissionDenied,
    Throttled,
    Transient,
    RateLimitTimeout,
    Fatal,
    Canceled,
    DeadlineExceeded,
    BadRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthError => "auth_error",
            Self::UnknownTable => "unknown_table",
            Self::UnknownColumn => "unknown_column",
            Self::PermissionDenied => "permission_denied",
            Self::Throttled => "throttled",
            Self::Transient => "transient",
            Self::RateLimitTimeout => "rate_limit_timeout",
            Self::Fatal => "fatal",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::BadRequest => "bad_request",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single provider call (list page or detail).
///
/// These are item- or scope-scoped: they degrade a row or a scope, they never
/// abort sibling work.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HydrateError {
    /// Caller lacks permission on the scope or item. Never retried.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// Provider asked us to slow down, optionally with a retry hint.
    #[error("throttled by provider: {message}")]
    Throttled {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Network or server-side failure worth retrying.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Malformed request or response. Never retried.
    #[error("fatal request error: {message}")]
    Fatal { message: String },

    /// No rate-limit token became available before the acquire deadline.
    #[error("no rate-limit token within {waited:?}")]
    RateLimitTimeout { waited: Duration },
}

impl HydrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
        }
    }

    /// Whether the retry policy may try this call again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient { .. })
    }

    /// Provider-suggested delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn throttled(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::Throttled {
            retry_after,
            message: message.into(),
        }
    }
}

/// A call that ultimately failed, tagged with how many attempts were made
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct CallFailure {
    #[source]
    pub error: HydrateError,
    pub attempts: u32,
}

impl CallFailure {
    pub fn new(error: HydrateError, attempts: u32) -> Self {
        Self { error, attempts }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Query-scoped failure: aborts the remaining work of one query
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("cannot enumerate scopes: {0}")]
    AuthError(String),

    #[error("query canceled")]
    Canceled,

    #[error("query deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTable(_) => ErrorKind::UnknownTable,
            Self::UnknownColumn { .. } => ErrorKind::UnknownColumn,
            Self::AuthError(_) => ErrorKind::AuthError,
            Self::Canceled => ErrorKind::Canceled,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
        }
    }
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}
