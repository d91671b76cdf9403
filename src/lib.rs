//! # Quiver - reactive stores and declarative queries
//!
//! Quiver provides two pieces that share one contract: every "produce new
//! state" or "produce new data" operation runs through a composable,
//! onion-style pipeline of interceptors with `get`/`set` capability.
//!
//! ## Core Components
//!
//! - [`Store`](store::Store): a reactive container whose value is replaced,
//!   never mutated, on every change
//! - [`Middleware`](store::Middleware): interceptors around every store change
//! - [`Api`](query::Api): declarative endpoints turned into cached,
//!   deduplicated, retryable asynchronous operations
//! - [`Plugin`](query::Plugin) and [`RequestMiddleware`](query::RequestMiddleware):
//!   lifecycle hooks and interceptors around every request
//!
//! ## Example
//!
//! ```
//! use quiver::prelude::*;
//! use serde_json::json;
//!
//! let store = Store::builder()
//!     .middleware(Logger::new("counter"))
//!     .build(json!({ "count": 0 }));
//!
//! store.set(json!({ "count": 1 })).unwrap();
//! store
//!     .update(|state| json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 }))
//!     .unwrap();
//!
//! assert_eq!(store.get()["count"], 2);
//! ```
//!
//! ## Logging
//!
//! Quiver emits [`tracing`] events at every state transition (cache hits,
//! deduplication, retries, rejections, invalidations) and never installs a
//! subscriber itself.

pub mod error;
pub mod prelude;
pub mod query;
pub mod store;

pub use error::StoreError;
