use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::store::Unsubscribe;

use super::api::Invalidation;
use super::cache::CacheKey;
use super::endpoint::{EndpointInfo, QueryArg, QueryData};
use super::error::ApiError;
use super::executor::{EndpointCore, Slice};
use super::state::QueryState;

/// Options for a query handle.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Do nothing on [`QueryHandle::fetch`] while set.
    pub skip: bool,
    /// Stops waiting for in-flight requests when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    #[must_use]
    pub const fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A registered query endpoint.
///
/// Cheap to clone; every clone shares the same endpoint, cache and in-flight
/// requests.
pub struct QueryEndpoint<A, D> {
    core: Arc<EndpointCore<A, D>>,
}

impl<A, D> Clone for QueryEndpoint<A, D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<A, D> fmt::Debug for QueryEndpoint<A, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEndpoint")
            .field("endpoint", &self.core.info)
            .finish_non_exhaustive()
    }
}

impl<A: QueryArg, D: QueryData> QueryEndpoint<A, D> {
    pub(crate) const fn new(core: Arc<EndpointCore<A, D>>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        self.core.info.name()
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.core.info
    }

    /// Creates a handle without fetching anything.
    pub fn handle(&self, arg: A, options: QueryOptions) -> QueryHandle<A, D> {
        QueryHandle {
            core: Arc::clone(&self.core),
            slice: Slice::new(),
            arg: Arc::new(Mutex::new(arg)),
            skip: Arc::new(AtomicBool::new(options.skip)),
            cancel: Arc::new(Mutex::new(options.cancel)),
        }
    }

    /// Creates a handle and fetches `arg` unless `options.skip` is set.
    pub async fn subscribe(
        &self,
        arg: A,
        options: QueryOptions,
    ) -> Result<QueryHandle<A, D>, ApiError> {
        let handle = self.handle(arg, options);
        handle.fetch().await?;
        Ok(handle)
    }

    /// Fetches `arg` once and returns the resulting state.
    pub async fn fetch(&self, arg: A) -> Result<Arc<QueryState<D>>, ApiError> {
        self.core.run_query(&Slice::new(), arg, false, None).await
    }

    /// Returns the cached data for `arg`, if fresh.
    pub fn cached(&self, arg: &A) -> Option<Arc<D>> {
        let (key, _) = self.core.encode(arg).ok()?;
        self.core.api.cache.lookup_data::<D>(&key)
    }

    /// Drops the cache entry for `arg` and notifies watching handles.
    pub fn invalidate(&self, arg: &A) -> Result<bool, ApiError> {
        let (key, _) = self.core.encode(arg)?;
        Ok(self.core.api.invalidate(&key))
    }

    /// Drops every cache entry of this endpoint.
    pub fn invalidate_all(&self) -> Vec<CacheKey> {
        self.core.api.invalidate_endpoint(self.name())
    }

    /// Number of distinct arguments with a request in flight.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight()
    }
}

/// One consumer of a query endpoint.
///
/// A handle owns a state slice. `data` and the status flags of
/// [`state`](Self::state) reflect the latest call made through it.
pub struct QueryHandle<A, D: Send + Sync + 'static> {
    core: Arc<EndpointCore<A, D>>,
    slice: Slice<D>,
    arg: Arc<Mutex<A>>,
    skip: Arc<AtomicBool>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl<A, D: Send + Sync + 'static> Clone for QueryHandle<A, D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            slice: self.slice.clone(),
            arg: Arc::clone(&self.arg),
            skip: Arc::clone(&self.skip),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl<A: QueryArg, D: QueryData> QueryHandle<A, D> {
    /// Fetches the current argument, serving from the cache when fresh.
    ///
    /// Does nothing while the handle is skipped.
    pub async fn fetch(&self) -> Result<Arc<QueryState<D>>, ApiError> {
        if self.is_skipped() {
            tracing::trace!(endpoint = self.core.info.name(), "query skipped");
            return Ok(self.state());
        }
        self.run(false).await
    }

    /// Fetches the current argument again, bypassing the cache.
    ///
    /// Runs even while the handle is skipped.
    pub async fn refetch(&self) -> Result<Arc<QueryState<D>>, ApiError> {
        self.run(true).await
    }

    async fn run(&self, bypass: bool) -> Result<Arc<QueryState<D>>, ApiError> {
        let arg = self.arg();
        let cancel = self.cancel.lock().clone();
        self.core
            .run_query(&self.slice, arg, bypass, cancel.as_ref())
            .await
    }

    /// Switches to a new argument and fetches it.
    pub async fn set_arg(&self, arg: A) -> Result<Arc<QueryState<D>>, ApiError> {
        *self.arg.lock() = arg;
        self.fetch().await
    }

    pub fn set_skip(&self, skip: bool) {
        self.skip.store(skip, Ordering::SeqCst);
    }

    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    /// Replaces the cancellation token used by later fetches.
    ///
    /// Calls already waiting keep the token they started with. Shared with
    /// every clone of this handle.
    pub fn set_cancel(&self, token: Option<CancellationToken>) {
        *self.cancel.lock() = token;
    }

    pub fn arg(&self) -> A {
        self.arg.lock().clone()
    }

    /// The cache key of the current argument.
    pub fn key(&self) -> Result<CacheKey, ApiError> {
        self.core.encode(&self.arg()).map(|(key, _)| key)
    }

    pub fn state(&self) -> Arc<QueryState<D>> {
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

    /// Streams state changes and refetches whenever the current key or its
    /// endpoint is invalidated.
    ///
    /// The stream starts with the current state. Refetches run while the
    /// stream is polled and are skipped while the handle is skipped.
    pub fn watch(&self) -> BoxStream<'static, Arc<QueryState<D>>> {
        let watcher = Watcher {
            handle: self.clone(),
            states: self.slice.store().watch(),
            invalidations: Some(self.core.api.subscribe_invalidation()),
        };

        stream::unfold(watcher, |mut watcher| async move {
            let state = watcher.next_state().await?;
            Some((state, watcher))
        })
        .boxed()
    }
}

struct Watcher<A, D: Send + Sync + 'static> {
    handle: QueryHandle<A, D>,
    states: BoxStream<'static, Arc<QueryState<D>>>,
    invalidations: Option<broadcast::Receiver<Invalidation>>,
}

impl<A: QueryArg, D: QueryData> Watcher<A, D> {
    async fn next_state(&mut self) -> Option<Arc<QueryState<D>>> {
        loop {
            let Some(rx) = self.invalidations.as_mut() else {
                return self.states.next().await;
            };

            tokio::select! {
                state = self.states.next() => return state,
                received = rx.recv() => match received {
                    Ok(invalidation) => {
                        if self.handle.is_affected_by(&invalidation) {
                            self.handle.refetch_after_invalidation().await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "invalidations lagged, refetching");
                        self.handle.refetch_after_invalidation().await;
                    }
                    Err(RecvError::Closed) => self.invalidations = None,
                },
            }
        }
    }
}

impl<A: QueryArg, D: QueryData> QueryHandle<A, D> {
    fn is_affected_by(&self, invalidation: &Invalidation) -> bool {
        self.key().is_ok_and(|key| invalidation.matches(&key))
    }

    async fn refetch_after_invalidation(&self) {
        if self.is_skipped() {
            return;
        }
        if let Err(err) = self.refetch().await {
            tracing::warn!(
                endpoint = self.core.info.name(),
                error = %err,
                "refetch after invalidation failed"
            );
        }
    }
}
