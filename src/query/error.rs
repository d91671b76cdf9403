use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::error::StoreError;

/// An error captured into query state.
///
/// These never surface as `Err` from a query or mutation call; they are
/// recorded in [`QueryState::error`](super::QueryState) so callers branch on
/// flags instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The transport reported a failure.
    #[error("Transport error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transport {
        /// HTTP-like status code, if the transport has one.
        status: Option<u16>,
        message: String,
        /// Error payload returned by the server, if any.
        data: Option<Value>,
    },

    /// A response could not be turned into the endpoint's data type.
    #[error("Transform failed: {0}")]
    Transform(String),

    /// The transport call did not finish in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller stopped waiting for the result.
    #[error("Request cancelled")]
    Cancelled,
}

impl QueryError {
    /// A transport error without status or payload.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
            data: None,
        }
    }

    /// A transport error carrying a status code.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: message.into(),
            data: None,
        }
    }

    /// The status code of a transport error, if it carries one.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether retrying the same request could succeed.
    ///
    /// Client errors (4xx) and transform errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status, .. } => !status.is_some_and(|s| (400..500).contains(&s)),
            Self::Timeout(_) => true,
            Self::Transform(_) | Self::Cancelled => false,
        }
    }
}

/// A fatal error of a query or mutation call.
///
/// Raised by middleware and plugins, or by misuse of the API. Unlike
/// [`QueryError`], these propagate to whoever invoked the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("endpoint `{0}` is already registered")]
    DuplicateEndpoint(String),

    #[error("endpoint `{name}` is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("cannot encode argument for `{endpoint}`: {message}")]
    KeyEncoding { endpoint: String, message: String },

    #[error("middleware failed: {0}")]
    Middleware(String),

    #[error("plugin `{plugin}` failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("state update failed: {0}")]
    Store(String),

    #[error("request task failed: {0}")]
    TaskFailed(String),
}

impl ApiError {
    /// Convenience constructor for plugin failures.
    pub fn plugin(plugin: impl Into<String>, message: impl ToString) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}
