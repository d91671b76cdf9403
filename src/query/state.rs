use std::sync::Arc;

use crate::store::State;

use super::error::QueryError;

/// Where a query or mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Nothing has been requested yet.
    #[default]
    Uninitialized,
    /// A request is in flight.
    Loading,
    /// The last request succeeded.
    Success,
    /// The last request failed.
    Error,
}

/// The state slice owned by one query or mutation handle.
///
/// `data` survives a later failure or reload, so callers can keep showing the
/// last good value while `status` says what is happening now.
#[derive(Debug)]
pub struct QueryState<D> {
    pub status: QueryStatus,
    pub data: Option<Arc<D>>,
    pub error: Option<QueryError>,
}

/// Mutations track the same fields as queries.
pub type MutationState<D> = QueryState<D>;

impl<D> Clone for QueryState<D> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<D> Default for QueryState<D> {
    fn default() -> Self {
        Self::uninitialized()
    }
}

impl<D> QueryState<D> {
    pub const fn uninitialized() -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
        }
    }

    /// Loading, keeping whatever data was there before.
    pub const fn loading(previous: Option<Arc<D>>) -> Self {
        Self {
            status: QueryStatus::Loading,
            data: previous,
            error: None,
        }
    }

    pub const fn success(data: Arc<D>) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    /// Failed, keeping whatever data was there before.
    pub const fn failed(error: QueryError, previous: Option<Arc<D>>) -> Self {
        Self {
            status: QueryStatus::Error,
            data: previous,
            error: Some(error),
        }
    }

    /// Returns the data, if any request has succeeded.
    pub fn data(&self) -> Option<&D> {
        self.data.as_deref()
    }

    /// Returns the error of the last request if it failed.
    pub const fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    /// Returns `true` if a request is currently in flight.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    /// Returns `true` if the last request succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the last request failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` if nothing has been requested yet.
    pub const fn is_uninitialized(&self) -> bool {
        matches!(self.status, QueryStatus::Uninitialized)
    }
}

impl<D: Send + Sync + 'static> State for QueryState<D> {
    type Patch = Self;

    /// Query slices are always replaced as a whole.
    fn merge(&self, patch: Self) -> Self {
        patch
    }
}
