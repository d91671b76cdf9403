//! Prelude module for convenient imports.
//!
//! ```
//! use quiver::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Store`], [`State`], [`Change`] - The reactive container
//! - [`Middleware`], [`Logger`], [`Validate`] - Store interceptors
//! - [`Api`], [`EndpointDef`] - Declaring endpoints
//! - [`QueryHandle`], [`MutationHandle`] - Using them
//! - [`Plugin`], [`RequestMiddleware`] - Hooking into requests

pub use crate::error::StoreError;
pub use crate::query::{
    Api, ApiError, BaseQuery, EndpointDef, HookContext, MutationEndpoint, MutationHandle,
    MutationOutcome, Outcome, Plugin, QueryConfig, QueryEndpoint, QueryError, QueryHandle,
    QueryOptions, QueryState, RequestDescriptor, RequestMiddleware, RetryPolicy, TracingPlugin,
};
pub use crate::store::middleware::{Logger, Validate};
pub use crate::store::{Change, Middleware, State, Store, StoreRegistry};
