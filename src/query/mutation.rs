//! Mutations: explicit calls that write through the transport.
//!
//! Mutations are never cached, never deduplicated and never run on their own.
//! They share the plugin and middleware pipeline with queries. A mutation
//! declared with [`EndpointDef::invalidates`](super::EndpointDef::invalidates)
//! drops the cache of those query endpoints when it succeeds, which makes
//! watching query handles refetch.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::store::Unsubscribe;

use super::endpoint::{EndpointInfo, QueryArg, QueryData};
use super::error::{ApiError, QueryError};
use super::executor::{EndpointCore, Settled, Slice};
use super::state::{MutationState, QueryState};

/// How a mutation call ended.
#[derive(Debug)]
pub enum MutationOutcome<D> {
    /// The mutation succeeded with a result.
    Data(Arc<D>),
    /// The mutation failed with an error.
    Error(QueryError),
    /// A middleware declined the call.
    Rejected,
}

impl<D> Clone for MutationOutcome<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Data(data) => Self::Data(Arc::clone(data)),
            Self::Error(err) => Self::Error(err.clone()),
            Self::Rejected => Self::Rejected,
        }
    }
}

impl<D> MutationOutcome<D> {
    pub(crate) fn from_settled(settled: Settled<D>) -> Self {
        match settled {
            Settled::Data(data) => Self::Data(data),
            Settled::Failed(err) => Self::Error(err),
            Settled::Rejected => Self::Rejected,
        }
    }
}

impl<D> MutationOutcome<D> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub fn data(&self) -> Option<&D> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub const fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns `true` if a middleware declined the call.
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// A registered mutation endpoint.
pub struct MutationEndpoint<A, D> {
    core: Arc<EndpointCore<A, D>>,
}

impl<A, D> Clone for MutationEndpoint<A, D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<A, D> fmt::Debug for MutationEndpoint<A, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEndpoint")
            .field("endpoint", &self.core.info)
            .finish_non_exhaustive()
    }
}

impl<A: QueryArg, D: QueryData> MutationEndpoint<A, D> {
    pub(crate) const fn new(core: Arc<EndpointCore<A, D>>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        self.core.info.name()
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.core.info
    }

    /// Creates a handle with its own state slice.
    pub fn handle(&self) -> MutationHandle<A, D> {
        MutationHandle {
            core: Arc::clone(&self.core),
            slice: Slice::new(),
        }
    }

    /// Executes the mutation once without keeping any state.
    pub async fn execute(&self, arg: A) -> Result<MutationOutcome<D>, ApiError> {
        self.handle().execute(arg).await
    }
}

/// A mutation trigger with reactive state.
pub struct MutationHandle<A, D: Send + Sync + 'static> {
    core: Arc<EndpointCore<A, D>>,
    slice: Slice<D>,
}

impl<A, D: Send + Sync + 'static> Clone for MutationHandle<A, D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            slice: self.slice.clone(),
        }
    }
}

impl<A: QueryArg, D: QueryData> MutationHandle<A, D> {
    /// Executes the mutation with `arg`.
    ///
    /// Transport and transform failures come back as
    /// [`MutationOutcome::Error`]; an `Err` means a middleware or plugin
    /// aborted the call.
    pub async fn execute(&self, arg: A) -> Result<MutationOutcome<D>, ApiError> {
        let settled = self.core.run_mutation(&self.slice, arg).await?;
        Ok(MutationOutcome::from_settled(settled))
    }

    pub fn state(&self) -> Arc<MutationState<D>> {
        self.slice.get()
    }

    /// Registers a listener called with `(next, previous)` on every state
    /// change of this handle.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe<QueryState<D>>
    where
        F: Fn(&QueryState<D>, &QueryState<D>) + Send + Sync + 'static,
    {
        self.slice.store().subscribe(listener)
    }

    /// Streams the current state followed by every change.
    pub fn watch(&self) -> BoxStream<'static, Arc<MutationState<D>>> {
        self.slice.store().watch()
    }

    /// Returns to the uninitialized state, discarding any call in flight.
    pub fn reset(&self) -> Result<(), ApiError> {
        self.slice.begin();
        self.slice.replace(QueryState::uninitialized())
    }
}
