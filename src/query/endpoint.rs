use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::config::RetryPolicy;
use super::error::QueryError;
use super::middleware::RequestMiddleware;
use super::plugin::Plugin;
use super::request::RequestDescriptor;

/// Arguments accepted by an endpoint.
///
/// The argument is serialized to derive the cache key, so structurally equal
/// arguments share a cache slot.
pub trait QueryArg: Serialize + Clone + Send + Sync + 'static {}

impl<T> QueryArg for T where T: Serialize + Clone + Send + Sync + 'static {}

/// Data produced by an endpoint.
pub trait QueryData: DeserializeOwned + Send + Sync + 'static {}

impl<T> QueryData for T where T: DeserializeOwned + Send + Sync + 'static {}

/// Whether an endpoint reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Cached, deduplicated, refetchable.
    Query,
    /// Explicitly executed, never cached.
    Mutation,
}

impl EndpointKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The untyped description of a registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub name: Arc<str>,
    pub kind: EndpointKind,
}

impl EndpointInfo {
    pub fn name(&self) -> &str {
        &self.name
    }
}

type QueryFn<A> = Arc<dyn Fn(&A) -> RequestDescriptor + Send + Sync>;
type TransformResponse<D> = Arc<dyn Fn(Value) -> Result<D, QueryError> + Send + Sync>;
type TransformError = Arc<dyn Fn(QueryError) -> QueryError + Send + Sync>;
type OnSuccess<A, D> = Arc<dyn Fn(&A, &D) + Send + Sync>;
type OnError<A> = Arc<dyn Fn(&A, &QueryError) + Send + Sync>;

/// Declares one query or mutation.
///
/// Registered with [`Api::query`](super::Api::query) or
/// [`Api::mutation`](super::Api::mutation); the definition cannot change after
/// that.
///
/// ```
/// use std::time::Duration;
/// use quiver::query::{EndpointDef, RequestDescriptor};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u32,
///     name: String,
/// }
///
/// let get_user = EndpointDef::<u32, User>::query("getUser", |id| {
///     RequestDescriptor::get(format!("/users/{id}"))
/// })
/// .cache_timeout(Duration::from_secs(5));
///
/// assert_eq!(get_user.name(), "getUser");
/// ```
pub struct EndpointDef<A, D> {
    pub(crate) name: String,
    pub(crate) kind: EndpointKind,
    pub(crate) query_fn: QueryFn<A>,
    pub(crate) transform_response: Option<TransformResponse<D>>,
    pub(crate) transform_error: Option<TransformError>,
    pub(crate) on_success: Option<OnSuccess<A, D>>,
    pub(crate) on_error: Option<OnError<A>>,
    pub(crate) middlewares: Vec<Arc<dyn RequestMiddleware>>,
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
    pub(crate) cache_timeout: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) invalidates: Vec<String>,
}

impl<A: QueryArg, D: QueryData> EndpointDef<A, D> {
    fn new<F>(name: impl Into<String>, kind: EndpointKind, query_fn: F) -> Self
    where
        F: Fn(&A) -> RequestDescriptor + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            query_fn: Arc::new(query_fn),
            transform_response: None,
            transform_error: None,
            on_success: None,
            on_error: None,
            middlewares: Vec::new(),
            plugins: Vec::new(),
            cache_timeout: None,
            timeout: None,
            retry: None,
            invalidates: Vec::new(),
        }
    }

    /// Declares a cached query.
    pub fn query<F>(name: impl Into<String>, query_fn: F) -> Self
    where
        F: Fn(&A) -> RequestDescriptor + Send + Sync + 'static,
    {
        Self::new(name, EndpointKind::Query, query_fn)
    }

    /// Declares a mutation.
    pub fn mutation<F>(name: impl Into<String>, query_fn: F) -> Self
    where
        F: Fn(&A) -> RequestDescriptor + Send + Sync + 'static,
    {
        Self::new(name, EndpointKind::Mutation, query_fn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Replaces the default JSON decoding of responses.
    ///
    /// Returning `Err` records the error in state like a transport failure.
    #[must_use]
    pub fn transform_response<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Result<D, QueryError> + Send + Sync + 'static,
    {
        self.transform_response = Some(Arc::new(transform));
        self
    }

    /// Rewrites errors before they are recorded.
    #[must_use]
    pub fn transform_error<F>(mut self, transform: F) -> Self
    where
        F: Fn(QueryError) -> QueryError + Send + Sync + 'static,
    {
        self.transform_error = Some(Arc::new(transform));
        self
    }

    #[must_use]
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&A, &D) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&A, &QueryError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Adds a request middleware that only wraps this endpoint.
    #[must_use]
    pub fn middleware(mut self, middleware: impl RequestMiddleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Adds a plugin that only sees this endpoint.
    #[must_use]
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Overrides [`QueryConfig::cache_timeout`](super::QueryConfig::cache_timeout).
    #[must_use]
    pub const fn cache_timeout(mut self, cache_timeout: Duration) -> Self {
        self.cache_timeout = Some(cache_timeout);
        self
    }

    /// Overrides [`QueryConfig::timeout`](super::QueryConfig::timeout).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides [`QueryConfig::retry`](super::QueryConfig::retry).
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Query endpoints whose cache entries a successful mutation drops.
    #[must_use]
    pub fn invalidates<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Decodes a raw response into `D`.
    pub(crate) fn decode(&self, raw: Value) -> Result<D, QueryError> {
        match &self.transform_response {
            Some(transform) => transform(raw),
            None => serde_json::from_value(raw).map_err(|e| QueryError::Transform(e.to_string())),
        }
    }

    pub(crate) fn map_error(&self, error: QueryError) -> QueryError {
        match &self.transform_error {
            Some(transform) => transform(error),
            None => error,
        }
    }
}

impl<A, D> fmt::Debug for EndpointDef<A, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("middlewares", &self.middlewares.len())
            .field("plugins", &self.plugins.len())
            .field("cache_timeout", &self.cache_timeout)
            .field("invalidates", &self.invalidates)
            .finish_non_exhaustive()
    }
}
