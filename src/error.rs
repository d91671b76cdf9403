//! Errors raised by stores and their middleware.

use thiserror::Error;

/// Error type for store operations.
///
/// Validation rejections are not errors: a middleware that declines to call
/// `next` returns `Ok(())` and the store is left untouched.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store behind a [`StoreApi`](crate::store::StoreApi) has been
    /// dropped, or is still being initialized.
    #[error("store is not available")]
    Detached,

    /// A middleware failed while handling a change.
    #[error("middleware `{middleware}` failed: {message}")]
    Middleware { middleware: String, message: String },

    /// A store with this name is already registered.
    #[error("store `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl StoreError {
    /// Convenience constructor for middleware failures.
    pub fn middleware(middleware: impl Into<String>, message: impl ToString) -> Self {
        Self::Middleware {
            middleware: middleware.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::middleware("persist", "disk full");
        assert_eq!(err.to_string(), "middleware `persist` failed: disk full");

        let err = StoreError::AlreadyRegistered("session".to_string());
        assert_eq!(err.to_string(), "store `session` is already registered");

        assert_eq!(StoreError::Detached.to_string(), "store is not available");
    }
}
