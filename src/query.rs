//! Declarative queries and mutations with caching and deduplication.
//!
//! An [`Api`] owns a transport ([`BaseQuery`]), a cache, and global request
//! middleware and plugins. Endpoints are declared with [`EndpointDef`] and
//! registered once; registration returns a typed handle.
//!
//! # Features
//!
//! - **Queries**: cached per `(endpoint, argument)` for the configured cache
//!   timeout, deduplicated while in flight, refetchable on demand
//! - **Mutations**: explicit, never cached, may invalidate query endpoints
//! - **Middleware**: onion-style interceptors around the transport call
//! - **Plugins**: `before_query` / `after_query` / `on_error` lifecycle hooks
//!
//! # Example
//!
//! ```rust,ignore
//! use quiver::prelude::*;
//!
//! let api = Api::builder(transport)
//!     .config(QueryConfig::default().with_cache_timeout(Duration::from_secs(5)))
//!     .plugin(TracingPlugin)
//!     .build();
//!
//! let get_user = api.query(EndpointDef::<u32, User>::query("getUser", |id| {
//!     RequestDescriptor::get(format!("/users/{id}"))
//! }))?;
//!
//! let user = get_user.subscribe(1, QueryOptions::default()).await?;
//! if let Some(data) = user.state().data() {
//!     println!("{}", data.name);
//! }
//! ```

mod api;
mod cache;
mod config;
mod endpoint;
mod error;
mod executor;
mod handle;
#[cfg(feature = "http")]
pub mod http;
pub mod middleware;
pub mod mock;
mod mutation;
pub mod plugin;
mod request;
mod state;

pub use api::{Api, ApiBuilder, Invalidation};
pub use cache::{CacheEntry, CacheKey, CacheManager, SweeperHandle};
pub use config::{QueryConfig, RetryPolicy};
pub use endpoint::{EndpointDef, EndpointInfo, EndpointKind, QueryArg, QueryData};
pub use error::{ApiError, QueryError};
pub use handle::{QueryEndpoint, QueryHandle, QueryOptions};
pub use middleware::{Next, Outcome, RequestMiddleware};
pub use mutation::{MutationEndpoint, MutationHandle, MutationOutcome};
pub use plugin::{Context, HookContext, Plugin, TracingPlugin};
pub use request::{BaseQuery, BaseQueryResult, Method, RequestDescriptor};
pub use state::{MutationState, QueryState, QueryStatus};
