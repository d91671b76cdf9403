//! Reactive state container.
//!
//! A [`Store`] holds an immutable-by-replacement value. Every change produces a
//! structurally new `Arc<S>`, so subscribers can detect change by identity
//! with [`Arc::ptr_eq`].
//!
//! Changes flow through an ordered list of [`Middleware`] before reaching the
//! raw replace:
//!
//! ```text
//! set(patch) -> m1 -> m2 -> ... -> mn -> replace + notify
//!               m1 <- m2 <- ... <- mn
//! ```
//!
//! # Example
//!
//! ```
//! use quiver::store::Store;
//! use serde_json::json;
//!
//! let store = Store::new(json!({ "count": 0 }));
//! store
//!     .update(|state| json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 }))
//!     .unwrap();
//!
//! assert_eq!(store.get()["count"], 1);
//! ```

pub mod middleware;
pub mod persist;
pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::error::StoreError;

pub use middleware::{Middleware, Next};
pub use persist::{FileStorage, MemoryStorage, Persist, Storage};
pub use registry::StoreRegistry;

/// A value that can live in a [`Store`].
///
/// `merge` computes the shallow merge `{ ...self, ...patch }` and must return a
/// new value rather than mutating `self`.
pub trait State: Send + Sync + 'static {
    /// The partial update accepted by [`Store::set`].
    type Patch: Send + 'static;

    /// Shallow-merges `patch` over `self`.
    fn merge(&self, patch: Self::Patch) -> Self;
}

impl State for Value {
    type Patch = Value;

    /// Objects merge key by key; any other patch replaces the value.
    fn merge(&self, patch: Value) -> Self {
        match (self, patch) {
            (Value::Object(current), Value::Object(patch)) => {
                let mut next = current.clone();
                next.extend(patch);
                Value::Object(next)
            }
            (_, patch) => patch,
        }
    }
}

impl<K, V> State for BTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Patch = BTreeMap<K, V>;

    fn merge(&self, patch: Self::Patch) -> Self {
        let mut next = self.clone();
        next.extend(patch);
        next
    }
}

impl<K, V> State for HashMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Patch = HashMap<K, V>;

    fn merge(&self, patch: Self::Patch) -> Self {
        let mut next = self.clone();
        next.extend(patch);
        next
    }
}

/// Computes the next value from the current one. `None` drops the change.
pub type Transition<S> = Box<dyn FnOnce(&S) -> Option<S> + Send>;

/// A change travelling through the middleware chain.
pub enum Change<S: State> {
    /// Shallow-merge a partial update over the current value.
    Merge(S::Patch),
    /// Replace the whole value.
    Replace(S),
    /// Derive the next value from the current one.
    ///
    /// Runs while the store's write lock is held, so it always sees the
    /// latest value. It must not call back into the same store.
    Update(Transition<S>),
}

impl<S: State> Change<S> {
    /// A change merging the patch `f` computes from the current value.
    pub fn update<F>(f: F) -> Self
    where
        F: FnOnce(&S) -> S::Patch + Send + 'static,
    {
        Self::Update(Box::new(move |current: &S| Some(current.merge(f(current)))))
    }

    /// Computes the value this change would install on top of `current`.
    ///
    /// Returns `None` if the change declines to apply.
    pub fn apply(self, current: &S) -> Option<S> {
        match self {
            Self::Merge(patch) => Some(current.merge(patch)),
            Self::Replace(state) => Some(state),
            Self::Update(transition) => transition(current),
        }
    }

    /// Returns `true` if this change replaces the whole value.
    pub const fn is_replace(&self) -> bool {
        matches!(self, Self::Replace(_))
    }
}

impl<S> fmt::Debug for Change<S>
where
    S: State + fmt::Debug,
    S::Patch: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(patch) => f.debug_tuple("Merge").field(patch).finish(),
            Self::Replace(state) => f.debug_tuple("Replace").field(state).finish(),
            Self::Update(_) => f.write_str("Update(..)"),
        }
    }
}

type Listener<S> = Arc<dyn Fn(&S, &S) + Send + Sync>;

struct Inner<S: State> {
    state: ArcSwap<S>,
    write: Mutex<()>,
    listeners: Mutex<Vec<(u64, Listener<S>)>>,
    next_listener: AtomicU64,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
    changes: watch::Sender<Arc<S>>,
}

/// A reactive state container.
///
/// Cloning a `Store` yields another handle to the same state.
pub struct Store<S: State> {
    inner: Arc<Inner<S>>,
}

impl<S: State> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: State + fmt::Debug> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.get())
            .field("middlewares", &self.inner.middlewares.len())
            .finish()
    }
}

impl<S: State> Store<S> {
    /// Creates a store without middleware.
    pub fn new(initial: S) -> Self {
        Self::builder().build(initial)
    }

    /// Starts building a store with middleware.
    pub fn builder() -> StoreBuilder<S> {
        StoreBuilder {
            middlewares: Vec::new(),
        }
    }

    /// Creates a store whose initial value is produced by `init`.
    ///
    /// `init` receives a [`StoreApi`] that actions captured in the state can
    /// use later on. Calling it during `init` fails with
    /// [`StoreError::Detached`].
    pub fn create(init: impl FnOnce(&StoreApi<S>) -> S) -> Self {
        Self::builder().create(init)
    }

    /// Returns the current value.
    pub fn get(&self) -> Arc<S> {
        self.inner.state.load_full()
    }

    /// Shallow-merges `patch` into the state through the middleware chain.
    pub fn set(&self, patch: S::Patch) -> Result<(), StoreError> {
        self.dispatch(Change::Merge(patch))
    }

    /// Computes a patch from the current value and merges it.
    ///
    /// `f` runs when the change reaches the raw replace, under the write
    /// lock, so concurrent updates never overwrite each other. It must not
    /// call back into this store.
    pub fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&S) -> S::Patch + Send + 'static,
    {
        self.dispatch(Change::update(f))
    }

    /// Replaces the whole value through the middleware chain.
    pub fn replace(&self, state: S) -> Result<(), StoreError> {
        self.dispatch(Change::Replace(state))
    }

    /// Runs `change` through every middleware, outermost first.
    pub fn dispatch(&self, change: Change<S>) -> Result<(), StoreError> {
        Next::new(self, &self.inner.middlewares).run(change)
    }

    /// Registers a listener called with `(next, previous)` after every change.
    ///
    /// Listeners run synchronously in registration order, right after the new
    /// value is installed. Dropping the returned handle keeps the listener;
    /// call [`Unsubscribe::unsubscribe`] to remove it.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe<S>
    where
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Unsubscribe {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Streams the current value followed by every later value.
    ///
    /// Intermediate values may be skipped when the consumer is slower than
    /// the producer; the latest value is always delivered.
    pub fn watch(&self) -> BoxStream<'static, Arc<S>> {
        WatchStream::new(self.inner.changes.subscribe()).boxed()
    }

    /// Returns a weak handle suitable for capturing inside state or middleware.
    pub fn api(&self) -> StoreApi<S> {
        StoreApi {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The raw replace at the bottom of every middleware chain.
    fn commit(&self, change: Change<S>) {
        let (next, previous) = {
            let _guard = self.inner.write.lock();
            let previous = self.inner.state.load_full();
            let Some(next) = change.apply(&previous) else {
                tracing::trace!("change declined at commit");
                return;
            };
            let next = Arc::new(next);
            self.inner.state.store(Arc::clone(&next));
            self.inner.changes.send_replace(Arc::clone(&next));
            (next, previous)
        };
        tracing::trace!("store value replaced");

        // Clone the list so listeners may subscribe or set re-entrantly.
        let listeners: Vec<Listener<S>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&next, &previous);
        }
    }
}

/// Builder for a [`Store`] with middleware.
pub struct StoreBuilder<S: State> {
    middlewares: Vec<Arc<dyn Middleware<S>>>,
}

impl<S: State> StoreBuilder<S> {
    /// Appends a middleware. Middleware run in the order they are added.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware<S> + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Appends an already shared middleware.
    #[must_use]
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware<S>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Builds the store with the given initial value.
    pub fn build(self, initial: S) -> Store<S> {
        self.create(move |_| initial)
    }

    /// Builds the store with an initial value produced by `init`.
    pub fn create(self, init: impl FnOnce(&StoreApi<S>) -> S) -> Store<S> {
        let middlewares = self.middlewares;
        let inner = Arc::new_cyclic(|weak| {
            let api = StoreApi {
                inner: weak.clone(),
            };
            let initial = Arc::new(init(&api));
            let (changes, _) = watch::channel(Arc::clone(&initial));
            Inner {
                state: ArcSwap::new(initial),
                write: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                middlewares,
                changes,
            }
        });
        Store { inner }
    }
}

/// A weak `get`/`set` handle to a store.
pub struct StoreApi<S: State> {
    inner: Weak<Inner<S>>,
}

impl<S: State> Clone for StoreApi<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: State> StoreApi<S> {
    /// Upgrades to a full store handle.
    pub fn store(&self) -> Result<Store<S>, StoreError> {
        self.inner
            .upgrade()
            .map(|inner| Store { inner })
            .ok_or(StoreError::Detached)
    }

    pub fn get(&self) -> Result<Arc<S>, StoreError> {
        Ok(self.store()?.get())
    }

    pub fn set(&self, patch: S::Patch) -> Result<(), StoreError> {
        self.store()?.set(patch)
    }

    pub fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&S) -> S::Patch + Send + 'static,
    {
        self.store()?.update(f)
    }

    pub fn replace(&self, state: S) -> Result<(), StoreError> {
        self.store()?.replace(state)
    }
}

/// Handle returned by [`Store::subscribe`].
pub struct Unsubscribe<S: State> {
    inner: Weak<Inner<S>>,
    id: u64,
}

impl<S: State> Unsubscribe<S> {
    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut listeners = inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}
