//! Runs one query or mutation call.
//!
//! A query call walks this state machine:
//!
//! ```text
//! encode key -> cache hit?  -> success                          (no hooks)
//!                  | miss
//!                  v
//!            loading -> in flight? -> attach and wait
//!                          | no
//!                          v
//!            spawn: before_query -> middleware -> transport
//!                   -> success | failure | rejected
//! ```
//!
//! In-flight operations are spawned tasks shared through
//! [`Shared`], so one caller dropping its future never cancels the work for
//! the others, and the pending entry is removed however the task ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::store::Store;

use super::api::ApiInner;
use super::cache::CacheKey;
use super::config::RetryPolicy;
use super::endpoint::{EndpointDef, EndpointInfo, EndpointKind, QueryArg, QueryData};
use super::error::{ApiError, QueryError};
use super::middleware::{Next, Outcome, RequestMiddleware};
use super::plugin::{Context, HookContext, Plugin};
use super::state::QueryState;

/// The state store of one handle plus its generation counter.
///
/// Every call takes a ticket with [`begin`](Self::begin); a commit with an
/// outdated ticket is dropped so late results never overwrite newer state.
pub(crate) struct Slice<D: Send + Sync + 'static> {
    store: Store<QueryState<D>>,
    generation: Arc<AtomicU64>,
}

impl<D: Send + Sync + 'static> Clone for Slice<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<D: Send + Sync + 'static> Slice<D> {
    pub(crate) fn new() -> Self {
        Self {
            store: Store::new(QueryState::uninitialized()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) const fn store(&self) -> &Store<QueryState<D>> {
        &self.store
    }

    pub(crate) fn get(&self) -> Arc<QueryState<D>> {
        self.store.get()
    }

    /// Starts a new call, invalidating every earlier ticket.
    pub(crate) fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }

    /// Unconditional replace.
    pub(crate) fn replace(&self, state: QueryState<D>) -> Result<(), ApiError> {
        self.store.replace(state).map_err(ApiError::from)
    }

    /// Replaces the state if `ticket` is still the latest call.
    pub(crate) fn commit(&self, ticket: u64, state: QueryState<D>) -> Result<bool, ApiError> {
        if !self.is_current(ticket) {
            tracing::trace!(ticket, "dropping stale commit");
            return Ok(false);
        }
        self.replace(state)?;
        Ok(true)
    }
}

/// How an executed call ended.
pub(crate) enum Settled<D> {
    Data(Arc<D>),
    Failed(QueryError),
    Rejected,
}

impl<D> Clone for Settled<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Data(data) => Self::Data(Arc::clone(data)),
            Self::Failed(err) => Self::Failed(err.clone()),
            Self::Rejected => Self::Rejected,
        }
    }
}

impl<D> Settled<D> {
    /// The state a slice that started from `prior` ends up in.
    pub(crate) fn to_state(&self, prior: &QueryState<D>) -> QueryState<D> {
        match self {
            Self::Data(data) => QueryState::success(Arc::clone(data)),
            Self::Failed(err) => QueryState::failed(err.clone(), prior.data.clone()),
            Self::Rejected => prior.clone(),
        }
    }
}

type SharedOperation<D> = Shared<BoxFuture<'static, Result<Settled<D>, ApiError>>>;

/// A registered endpoint with its resolved plugins and middleware chain.
pub(crate) struct EndpointCore<A, D> {
    pub(crate) def: EndpointDef<A, D>,
    pub(crate) info: EndpointInfo,
    pub(crate) api: Arc<ApiInner>,
    plugins: Vec<Arc<dyn Plugin>>,
    chain: Vec<Arc<dyn RequestMiddleware>>,
    pending: DashMap<CacheKey, SharedOperation<D>>,
}

impl<A: QueryArg, D: QueryData> EndpointCore<A, D> {
    pub(crate) fn new(api: Arc<ApiInner>, def: EndpointDef<A, D>) -> Self {
        let info = EndpointInfo {
            name: Arc::from(def.name.as_str()),
            kind: def.kind,
        };

        let plugins: Vec<Arc<dyn Plugin>> =
            api.plugins.iter().chain(&def.plugins).cloned().collect();

        let chain: Vec<Arc<dyn RequestMiddleware>> = api
            .middlewares
            .iter()
            .cloned()
            .chain(api.plugins.iter().filter_map(|plugin| plugin.middleware()))
            .chain(def.middlewares.iter().cloned())
            .chain(def.plugins.iter().filter_map(|plugin| plugin.middleware()))
            .collect();

        for plugin in &plugins {
            plugin.on_init(&info);
        }

        Self {
            def,
            info,
            api,
            plugins,
            chain,
            pending: DashMap::new(),
        }
    }

    pub(crate) fn cache_timeout(&self) -> Duration {
        self.def
            .cache_timeout
            .unwrap_or(self.api.config.cache_timeout)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.def.timeout.or(self.api.config.timeout)
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.def.retry.unwrap_or(self.api.config.retry)
    }

    pub(crate) fn encode(&self, arg: &A) -> Result<(CacheKey, Value), ApiError> {
        let arg_json = serde_json::to_value(arg).map_err(|e| ApiError::KeyEncoding {
            endpoint: self.info.name.to_string(),
            message: e.to_string(),
        })?;
        Ok((CacheKey::from_value(&self.info.name, &arg_json), arg_json))
    }

    /// Number of distinct keys with an operation in flight.
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Runs a query call for `slice` and returns the state it ended in.
    ///
    /// `bypass` skips the cache lookup. Cancelling `cancel` stops waiting,
    /// records [`QueryError::Cancelled`] and drops any later commit for this
    /// call; the shared operation keeps running for other callers.
    pub(crate) async fn run_query(
        self: &Arc<Self>,
        slice: &Slice<D>,
        arg: A,
        bypass: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<QueryState<D>>, ApiError> {
        let (key, arg_json) = self.encode(&arg)?;

        if !bypass {
            if let Some(data) = self.api.cache.lookup_data::<D>(&key) {
                tracing::debug!(%key, "serving from cache");
                let ticket = slice.begin();
                slice.commit(ticket, QueryState::success(data))?;
                return Ok(slice.get());
            }
            tracing::trace!(%key, "cache miss");
        }

        let ticket = slice.begin();
        let prior = slice.get();

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            slice.commit(ticket, QueryState::failed(QueryError::Cancelled, prior.data.clone()))?;
            return Ok(slice.get());
        }

        slice.commit(ticket, QueryState::loading(prior.data.clone()))?;

        let (operation, leader) = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(%key, "joining in-flight request");
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                let ctx = Context::new(
                    self.info.clone(),
                    key.clone(),
                    arg,
                    arg_json,
                    slice.clone(),
                    ticket,
                );
                let operation = self.spawn(ctx, Arc::clone(&prior));
                entry.insert(operation.clone());
                (operation, true)
            }
        };

        let settled = match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => {
                    tracing::debug!(%key, "request cancelled");
                    slice.begin();
                    slice.replace(QueryState::failed(QueryError::Cancelled, prior.data.clone()))?;
                    return Ok(slice.get());
                }
                settled = operation => settled,
            },
            None => operation.await,
        };

        // The leader's task commits into its slice; followers commit here.
        if !leader {
            let next = match &settled {
                Ok(settled) => settled.to_state(&prior),
                Err(_) => (*prior).clone(),
            };
            slice.commit(ticket, next)?;
        }

        settled?;
        Ok(slice.get())
    }

    /// Runs a mutation call. Mutations bypass the cache and are never shared.
    pub(crate) async fn run_mutation(
        &self,
        slice: &Slice<D>,
        arg: A,
    ) -> Result<Settled<D>, ApiError> {
        let (key, arg_json) = self.encode(&arg)?;
        let ticket = slice.begin();
        let prior = slice.get();
        slice.commit(ticket, QueryState::loading(prior.data.clone()))?;

        let ctx = Context::new(self.info.clone(), key, arg, arg_json, slice.clone(), ticket);
        self.execute(&ctx, &prior).await
    }

    fn spawn(self: &Arc<Self>, ctx: Context<A, D>, prior: Arc<QueryState<D>>) -> SharedOperation<D> {
        let core = Arc::clone(self);
        let join = tokio::spawn(async move {
            let _pending = PendingGuard {
                core: Arc::clone(&core),
                key: ctx.key().clone(),
            };
            core.execute(&ctx, &prior).await
        });

        async move {
            join.await
                .unwrap_or_else(|err| Err(ApiError::TaskFailed(err.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn execute(
        &self,
        ctx: &Context<A, D>,
        prior: &QueryState<D>,
    ) -> Result<Settled<D>, ApiError> {
        let outcome = match self.pipeline(ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(endpoint = %self.info.name, error = %err, "request aborted");
                ctx.commit(prior.clone())?;
                return Err(err);
            }
        };

        let decoded = match outcome {
            Outcome::Rejected => {
                tracing::debug!(endpoint = %self.info.name, "request rejected by middleware");
                ctx.commit(prior.clone())?;
                return Ok(Settled::Rejected);
            }
            Outcome::Failed(err) => Err(err),
            Outcome::Data(raw) => self.def.decode(raw),
        };

        match decoded {
            Ok(data) => self.succeed(ctx, Arc::new(data)).await,
            Err(err) => self.fail(ctx, err, prior).await,
        }
    }

    async fn pipeline(&self, ctx: &Context<A, D>) -> Result<Outcome, ApiError> {
        for plugin in &self.plugins {
            plugin.before_query(ctx).await?;
        }

        let terminal = || self.transport(ctx.arg()).boxed();
        Next::new(&self.chain, ctx, &terminal).run().await
    }

    async fn succeed(&self, ctx: &Context<A, D>, data: Arc<D>) -> Result<Settled<D>, ApiError> {
        if self.info.kind == EndpointKind::Query {
            let key = ctx.key().clone();
            self.api
                .cache
                .store(key, Arc::clone(&data), self.cache_timeout());
        }
        ctx.commit(QueryState::success(Arc::clone(&data)))?;

        for endpoint in &self.def.invalidates {
            self.api.invalidate_endpoint(endpoint);
        }

        if let Some(on_success) = &self.def.on_success {
            on_success(ctx.arg(), &data);
        }
        for plugin in &self.plugins {
            plugin.after_query(ctx).await?;
        }
        Ok(Settled::Data(data))
    }

    async fn fail(
        &self,
        ctx: &Context<A, D>,
        err: QueryError,
        prior: &QueryState<D>,
    ) -> Result<Settled<D>, ApiError> {
        let err = self.def.map_error(err);
        tracing::debug!(endpoint = %self.info.name, error = %err, "request failed");
        ctx.commit(QueryState::failed(err.clone(), prior.data.clone()))?;

        if let Some(on_error) = &self.def.on_error {
            on_error(ctx.arg(), &err);
        }
        for plugin in &self.plugins {
            plugin.on_error(ctx, &err).await?;
        }
        Ok(Settled::Failed(err))
    }

    /// The innermost step of the chain: build the request and call the
    /// transport, applying the timeout and retry policy.
    async fn transport(&self, arg: &A) -> Result<Outcome, ApiError> {
        let request = (self.def.query_fn)(arg);
        let retry = self.retry();
        let timeout = self.timeout();
        let mut attempt = 0;

        loop {
            let call = self.api.base_query.fetch(request.clone());
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or_else(|_| Err(QueryError::Timeout(limit))),
                None => call.await,
            };

            match result {
                Ok(raw) => return Ok(Outcome::Data(raw)),
                Err(err) if attempt < retry.max_retries && err.is_retryable() => {
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    tracing::debug!(
                        endpoint = %self.info.name,
                        attempt,
                        ?delay,
                        error = %err,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Ok(Outcome::Failed(err)),
            }
        }
    }
}

/// Removes a key from the pending map when its operation ends.
struct PendingGuard<A: QueryArg, D: QueryData> {
    core: Arc<EndpointCore<A, D>>,
    key: CacheKey,
}

impl<A: QueryArg, D: QueryData> Drop for PendingGuard<A, D> {
    fn drop(&mut self) {
        self.core.pending.remove(&self.key);
        tracing::trace!(key = %self.key, "request settled");
    }
}
