use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use super::cache::{CacheKey, CacheManager, SweeperHandle};
use super::config::{QueryConfig, RetryPolicy};
use super::endpoint::{EndpointDef, EndpointInfo, EndpointKind, QueryArg, QueryData};
use super::error::ApiError;
use super::executor::EndpointCore;
use super::handle::QueryEndpoint;
use super::middleware::RequestMiddleware;
use super::mutation::MutationEndpoint;
use super::plugin::Plugin;
use super::request::BaseQuery;

/// A notification that cached data is no longer valid.
///
/// Query handles that [`watch`](super::QueryHandle::watch) refetch when they
/// see one matching their key or endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// One `(endpoint, argument)` pair.
    Key(CacheKey),
    /// Every argument of an endpoint.
    Endpoint(String),
}

impl Invalidation {
    /// Returns `true` if this invalidation covers `key`.
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Key(invalidated) => invalidated == key,
            Self::Endpoint(name) => name == key.endpoint(),
        }
    }
}

pub(crate) struct ApiInner {
    pub(crate) base_query: Arc<dyn BaseQuery>,
    pub(crate) config: QueryConfig,
    pub(crate) middlewares: Vec<Arc<dyn RequestMiddleware>>,
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
    pub(crate) cache: Arc<CacheManager>,
    endpoints: DashMap<String, EndpointInfo>,
    invalidation_tx: broadcast::Sender<Invalidation>,
}

impl ApiInner {
    pub(crate) fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.cache.invalidate(key);
        tracing::debug!(%key, removed, "invalidated cache key");
        let _ = self.invalidation_tx.send(Invalidation::Key(key.clone()));
        removed
    }

    pub(crate) fn invalidate_endpoint(&self, endpoint: &str) -> Vec<CacheKey> {
        let removed = self.cache.invalidate_endpoint(endpoint);
        tracing::debug!(endpoint, removed = removed.len(), "invalidated endpoint");
        let _ = self
            .invalidation_tx
            .send(Invalidation::Endpoint(endpoint.to_string()));
        removed
    }

    pub(crate) fn subscribe_invalidation(&self) -> broadcast::Receiver<Invalidation> {
        self.invalidation_tx.subscribe()
    }
}

/// The entry point: a transport, a cache and the registered endpoints.
///
/// Cloning an `Api` yields another handle to the same cache and registry.
///
/// # Example
///
/// ```
/// use quiver::query::{Api, EndpointDef, QueryConfig, RequestDescriptor, mock::MockBaseQuery};
/// use std::time::Duration;
///
/// let transport = MockBaseQuery::new();
/// let api = Api::builder(transport)
///     .config(QueryConfig::new(Duration::from_secs(5)))
///     .build();
///
/// let get_user = api
///     .query(EndpointDef::<u32, serde_json::Value>::query("getUser", |id| {
///         RequestDescriptor::get(format!("/users/{id}"))
///     }))
///     .unwrap();
///
/// assert_eq!(get_user.name(), "getUser");
/// assert!(api.endpoint("getUser").is_some());
/// ```
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("config", &self.inner.config)
            .field("endpoints", &self.inner.endpoints.len())
            .field("middlewares", &self.inner.middlewares.len())
            .field("plugins", &self.inner.plugins.len())
            .field("cached", &self.inner.cache.len())
            .finish()
    }
}

impl Api {
    /// Starts building an API around `base_query`.
    pub fn builder(base_query: impl BaseQuery + 'static) -> ApiBuilder {
        ApiBuilder {
            base_query: Arc::new(base_query),
            config: QueryConfig::default(),
            middlewares: Vec::new(),
            plugins: Vec::new(),
        }
    }

    /// Registers a query endpoint.
    pub fn query<A: QueryArg, D: QueryData>(
        &self,
        def: EndpointDef<A, D>,
    ) -> Result<QueryEndpoint<A, D>, ApiError> {
        self.register(&def, EndpointKind::Query)?;
        let core = EndpointCore::new(Arc::clone(&self.inner), def);
        Ok(QueryEndpoint::new(Arc::new(core)))
    }

    /// Registers a mutation endpoint.
    pub fn mutation<A: QueryArg, D: QueryData>(
        &self,
        def: EndpointDef<A, D>,
    ) -> Result<MutationEndpoint<A, D>, ApiError> {
        self.register(&def, EndpointKind::Mutation)?;
        let core = EndpointCore::new(Arc::clone(&self.inner), def);
        Ok(MutationEndpoint::new(Arc::new(core)))
    }

    fn register<A: QueryArg, D: QueryData>(
        &self,
        def: &EndpointDef<A, D>,
        expected: EndpointKind,
    ) -> Result<(), ApiError> {
        if def.kind() != expected {
            return Err(ApiError::KindMismatch {
                name: def.name().to_string(),
                expected: expected.as_str(),
                actual: def.kind().as_str(),
            });
        }

        match self.inner.endpoints.entry(def.name().to_string()) {
            Entry::Occupied(entry) => Err(ApiError::DuplicateEndpoint(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(endpoint = def.name(), kind = %expected, "registering endpoint");
                entry.insert(EndpointInfo {
                    name: Arc::from(def.name()),
                    kind: expected,
                });
                Ok(())
            }
        }
    }

    /// Every registered endpoint, sorted by name.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut endpoints: Vec<EndpointInfo> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<EndpointInfo> {
        self.inner
            .endpoints
            .get(name)
            .map(|entry| entry.value().clone())
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Drops the cache entry for `key` and notifies watching handles.
    ///
    /// Returns `true` if an entry was cached.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.invalidate(key)
    }

    /// Drops every cache entry of `endpoint` and notifies watching handles.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> Vec<CacheKey> {
        self.inner.invalidate_endpoint(endpoint)
    }

    /// Subscribes to invalidation notifications.
    pub fn subscribe_invalidation(&self) -> broadcast::Receiver<Invalidation> {
        self.inner.subscribe_invalidation()
    }

    /// Periodically drops expired cache entries. See
    /// [`CacheManager::spawn_sweeper`].
    pub fn spawn_cache_sweeper(&self, interval: Duration) -> SweeperHandle {
        self.inner.cache.spawn_sweeper(interval)
    }
}

/// Builder for an [`Api`].
pub struct ApiBuilder {
    base_query: Arc<dyn BaseQuery>,
    config: QueryConfig,
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ApiBuilder {
    #[must_use]
    pub const fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn cache_timeout(mut self, cache_timeout: Duration) -> Self {
        self.config.cache_timeout = cache_timeout;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Adds a middleware wrapping every endpoint. Middleware run in the order
    /// they are added.
    #[must_use]
    pub fn middleware(mut self, middleware: impl RequestMiddleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Adds a plugin attached to every endpoint.
    #[must_use]
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn build(self) -> Api {
        let (invalidation_tx, _) = broadcast::channel(100);
        Api {
            inner: Arc::new(ApiInner {
                base_query: self.base_query,
                config: self.config,
                middlewares: self.middlewares,
                plugins: self.plugins,
                cache: Arc::new(CacheManager::new()),
                endpoints: DashMap::new(),
                invalidation_tx,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::mock::MockBaseQuery;
    use crate::query::request::RequestDescriptor;
    use serde_json::{Value, json};

    fn api() -> Api {
        Api::builder(MockBaseQuery::new()).build()
    }

    fn get_user() -> EndpointDef<u32, Value> {
        EndpointDef::query("getUser", |id| RequestDescriptor::get(format!("/users/{id}")))
    }

    #[test]
    fn test_builder_config() {
        let api = Api::builder(MockBaseQuery::new())
            .cache_timeout(Duration::from_secs(5))
            .timeout(Duration::from_millis(200))
            .retry(RetryPolicy::new(2, Duration::from_millis(10)))
            .build();
        assert_eq!(api.config().cache_timeout, Duration::from_secs(5));
        assert_eq!(api.config().timeout, Some(Duration::from_millis(200)));
        assert_eq!(api.config().retry.max_retries, 2);
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_rejected() {
        let api = api();
        api.query(get_user()).unwrap();
        let err = api.query(get_user()).unwrap_err();
        assert_eq!(err, ApiError::DuplicateEndpoint("getUser".to_string()));
    }

    #[tokio::test]
    async fn test_kind_mismatch() {
        let api = api();
        let err = api.mutation(get_user()).unwrap_err();
        assert!(matches!(
            err,
            ApiError::KindMismatch {
                expected: "mutation",
                actual: "query",
                ..
            }
        ));
        assert!(api.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_registry() {
        let api = api();
        api.query(get_user()).unwrap();
        api.mutation(EndpointDef::<u32, Value>::mutation("deleteUser", |id| {
            RequestDescriptor::delete(format!("/users/{id}"))
        }))
        .unwrap();

        let names: Vec<String> = api
            .endpoints()
            .iter()
            .map(|info| info.name().to_string())
            .collect();
        assert_eq!(names, vec!["deleteUser", "getUser"]);
        assert_eq!(
            api.endpoint("deleteUser").map(|info| info.kind),
            Some(EndpointKind::Mutation)
        );
        assert!(api.endpoint("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_broadcasts() {
        let api = api();
        let mut rx = api.subscribe_invalidation();
        let key = CacheKey::from_value("getUser", &json!(1));
        api.cache()
            .store(key.clone(), Arc::new(1_u32), Duration::from_secs(5));

        assert!(api.invalidate(&key));
        assert!(api.cache().is_empty());
        assert_eq!(rx.recv().await.unwrap(), Invalidation::Key(key.clone()));

        api.invalidate_endpoint("getUser");
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification, Invalidation::Endpoint("getUser".to_string()));
        assert!(notification.matches(&key));
        assert!(!notification.matches(&CacheKey::from_value("getPost", &json!(1))));
    }
}
