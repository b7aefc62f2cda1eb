//! Error types for the relay pipeline.
//!
//! Uses `thiserror` for ergonomic error definitions. Every failure raised by
//! the resolver, planner, upstream client or relay is one of the variants
//! below, and [`Error::classify`] turns it into the single outcome the caller
//! sees.

use serde::Serialize;
use thiserror::Error;

/// The fixed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamAuth,
    UpstreamRateLimit,
    UpstreamTransport,
    UpstreamProtocol,
    ContextFetchFailed,
    Internal,
}

impl ErrorKind {
    /// Stable machine-usable reason string.
    pub fn reason(self) -> &'static str {
        match self {
            ErrorKind::UpstreamAuth => "upstream_auth",
            ErrorKind::UpstreamRateLimit => "upstream_rate_limit",
            ErrorKind::UpstreamTransport => "upstream_transport",
            ErrorKind::UpstreamProtocol => "upstream_protocol",
            ErrorKind::ContextFetchFailed => "context_fetch_failed",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamAuth
                | ErrorKind::UpstreamRateLimit
                | ErrorKind::UpstreamTransport
                | ErrorKind::UpstreamProtocol
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// The top-level error type for all relay operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Upstream authentication failed (status: {status}): {message}")]
    UpstreamAuth { status: u16, message: String },

    #[error("Rate limited by upstream (status: {status}): {message}")]
    UpstreamRateLimit { status: u16, message: String },

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Upstream protocol error: {message}")]
    UpstreamProtocol {
        status: Option<u16>,
        message: String,
    },

    #[error("Context fetch failed: {0}")]
    ContextFetchFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// A user-visible outcome: HTTP-style status plus a short reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub status: u16,
    pub reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status used for every upstream-originated failure.
pub const UPSTREAM_FAILURE_STATUS: u16 = 502;
/// Status used for planning and configuration failures.
pub const INTERNAL_FAILURE_STATUS: u16 = 500;

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::UpstreamProtocol {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UpstreamAuth { .. } => ErrorKind::UpstreamAuth,
            Error::UpstreamRateLimit { .. } => ErrorKind::UpstreamRateLimit,
            Error::UpstreamTransport(_) => ErrorKind::UpstreamTransport,
            Error::UpstreamProtocol { .. } => ErrorKind::UpstreamProtocol,
            Error::ContextFetchFailed(_) => ErrorKind::ContextFetchFailed,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The upstream's own message, when the failure came from upstream.
    pub fn upstream_message(&self) -> Option<&str> {
        let message = match self {
            Error::UpstreamAuth { message, .. }
            | Error::UpstreamRateLimit { message, .. }
            | Error::UpstreamProtocol { message, .. } => message,
            Error::UpstreamTransport(message) => message,
            Error::ContextFetchFailed(_) | Error::Internal(_) => return None,
        };
        (!message.is_empty()).then_some(message.as_str())
    }

    /// Map this failure to the outcome the caller sees.
    ///
    /// Internal details never leave the process; `ContextFetchFailed` is
    /// recovered inside the resolver and only lands here through misuse, so it
    /// is reported as internal.
    pub fn classify(&self) -> Classification {
        let kind = self.kind();
        if kind.is_upstream() {
            Classification {
                status: UPSTREAM_FAILURE_STATUS,
                reason: kind.reason(),
                message: self.upstream_message().map(str::to_owned),
            }
        } else {
            Classification {
                status: INTERNAL_FAILURE_STATUS,
                reason: ErrorKind::Internal.reason(),
                message: None,
            }
        }
    }
}
