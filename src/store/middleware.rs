//! Store middleware composed onion-style around the raw replace.
//!
//! Given middleware `[a, b]`, a change runs `a` until it calls `next`, then `b`
//! until it calls `next`, then the raw replace, then the rest of `b`, then the
//! rest of `a`.
//!
//! # Re-entrancy
//!
//! Every middleware receives the outermost [`Store`]. Calling `store.set(..)`
//! from inside a middleware, instead of `next.run(..)`, starts a new change at
//! the top of the chain, running every middleware again. This is sometimes
//! used for re-validation, but it recurses without bound if the middleware
//! keeps calling `set` for the changes it produces.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::StoreError;

use super::{Change, State, Store};

/// An interceptor around store changes.
pub trait Middleware<S: State>: Send + Sync {
    /// Handles `change`.
    ///
    /// Call `next.run(change)` to pass the change inward. Returning without
    /// calling `next` silently drops the change.
    fn apply(&self, store: &Store<S>, change: Change<S>, next: Next<'_, S>)
    -> Result<(), StoreError>;
}

/// The remainder of a middleware chain.
pub struct Next<'a, S: State> {
    store: &'a Store<S>,
    chain: &'a [Arc<dyn Middleware<S>>],
}

impl<'a, S: State> Next<'a, S> {
    pub(crate) const fn new(store: &'a Store<S>, chain: &'a [Arc<dyn Middleware<S>>]) -> Self {
        Self { store, chain }
    }

    /// Passes `change` to the next middleware, or installs it when the chain
    /// is exhausted.
    pub fn run(self, change: Change<S>) -> Result<(), StoreError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.apply(self.store, change, Next::new(self.store, rest)),
            None => {
                self.store.commit(change);
                Ok(())
            }
        }
    }

    /// Number of middleware still ahead of the raw replace.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}

/// Middleware built from a closure. See [`from_fn`].
pub struct FromFn<S, F> {
    f: F,
    _state: PhantomData<fn() -> S>,
}

/// Wraps a closure as a middleware.
///
/// ```
/// use quiver::store::{Store, middleware::from_fn};
/// use serde_json::{Value, json};
///
/// let store = Store::builder()
///     .middleware(from_fn::<Value, _>(|_store, change, next| next.run(change)))
///     .build(json!({ "count": 0 }));
///
/// store.set(json!({ "count": 1 })).unwrap();
/// assert_eq!(store.get()["count"], 1);
/// ```
pub fn from_fn<S, F>(f: F) -> FromFn<S, F>
where
    S: State,
    F: Fn(&Store<S>, Change<S>, Next<'_, S>) -> Result<(), StoreError> + Send + Sync,
{
    FromFn {
        f,
        _state: PhantomData,
    }
}

impl<S, F> Middleware<S> for FromFn<S, F>
where
    S: State,
    F: Fn(&Store<S>, Change<S>, Next<'_, S>) -> Result<(), StoreError> + Send + Sync,
{
    fn apply(
        &self,
        store: &Store<S>,
        change: Change<S>,
        next: Next<'_, S>,
    ) -> Result<(), StoreError> {
        (self.f)(store, change, next)
    }
}

/// Logs every change and the resulting value with `tracing`.
#[derive(Debug, Clone)]
pub struct Logger {
    name: String,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl<S> Middleware<S> for Logger
where
    S: State + Debug,
    S::Patch: Debug,
{
    fn apply(
        &self,
        store: &Store<S>,
        change: Change<S>,
        next: Next<'_, S>,
    ) -> Result<(), StoreError> {
        tracing::debug!(store = %self.name, ?change, "applying change");
        next.run(change)?;
        tracing::debug!(store = %self.name, state = ?store.get(), "change applied");
        Ok(())
    }
}

/// Drops changes whose resulting value fails a predicate.
///
/// The predicate sees the value the change would install, checked at commit
/// time against the latest value. A rejected change is silent: the store is
/// untouched and `set` returns `Ok(())`.
///
/// Middleware placed after `Validate` receive the change as
/// [`Change::Update`].
pub struct Validate<F> {
    predicate: Arc<F>,
}

impl<F> Validate<F> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl<S, F> Middleware<S> for Validate<F>
where
    S: State,
    F: Fn(&S) -> bool + Send + Sync + 'static,
{
    fn apply(
        &self,
        _store: &Store<S>,
        change: Change<S>,
        next: Next<'_, S>,
    ) -> Result<(), StoreError> {
        let predicate = Arc::clone(&self.predicate);
        next.run(Change::Update(Box::new(move |current: &S| -> Option<S> {
            let candidate = change.apply(current)?;
            if predicate(&candidate) {
                Some(candidate)
            } else {
                tracing::debug!("change rejected by validator");
                None
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware<Value> for Tag {
        fn apply(
            &self,
            _store: &Store<Value>,
            change: Change<Value>,
            next: Next<'_, Value>,
        ) -> Result<(), StoreError> {
            self.log.lock().push(format!("{}-enter", self.name));
            next.run(change)?;
            self.log.lock().push(format!("{}-exit", self.name));
            Ok(())
        }
    }

    #[test]
    fn test_next_remaining() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware<Value>>> = vec![
            Arc::new(Tag {
                name: "a",
                log: Arc::clone(&log),
            }),
            Arc::new(Tag {
                name: "b",
                log: Arc::clone(&log),
            }),
        ];
        let store = Store::new(json!({}));
        let next = Next::new(&store, &chain);
        assert_eq!(next.remaining(), 2);

        next.run(Change::Merge(json!({ "x": 1 }))).unwrap();
        assert_eq!(*log.lock(), vec!["a-enter", "b-enter", "b-exit", "a-exit"]);
        assert_eq!(store.get()["x"], 1);
    }

    #[test]
    fn test_from_fn_can_rewrite_change() {
        let store = Store::builder()
            .middleware(from_fn::<Value, _>(|_store, change, next| match change {
                Change::Merge(mut patch) => {
                    patch["touched"] = json!(true);
                    next.run(Change::Merge(patch))
                }
                replace => next.run(replace),
            }))
            .build(json!({}));

        store.set(json!({ "a": 1 })).unwrap();
        assert_eq!(*store.get(), json!({ "a": 1, "touched": true }));
    }

    #[test]
    fn test_validate_rejects_silently() {
        let store = Store::builder()
            .middleware(Validate::new(|state: &Value| {
                state["count"].as_i64().is_some_and(|count| count >= 0)
            }))
            .build(json!({ "count": 1 }));
        let before = store.get();

        assert!(store.set(json!({ "count": -5 })).is_ok());
        assert!(Arc::ptr_eq(&before, &store.get()));

        store.set(json!({ "count": 2 })).unwrap();
        assert_eq!(store.get()["count"], 2);
    }

    #[test]
    fn test_validate_checks_update_against_latest_value() {
        let store = Store::builder()
            .middleware(Validate::new(|state: &Value| {
                state["count"].as_i64().is_some_and(|count| count <= 2)
            }))
            .build(json!({ "count": 0 }));
        let increment = |state: &Value| json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 });

        for _ in 0..5 {
            store.update(increment).unwrap();
        }

        assert_eq!(store.get()["count"], 2);
    }

    #[test]
    fn test_logger_passes_change_through() {
        let store = Store::builder()
            .middleware(Logger::new("test"))
            .build(json!({ "count": 0 }));
        store.set(json!({ "count": 7 })).unwrap();
        assert_eq!(store.get()["count"], 7);
    }

    #[test]
    fn test_middleware_error_propagates() {
        let store = Store::builder()
            .middleware(from_fn::<Value, _>(|_store, _change, _next| {
                Err(StoreError::middleware("guard", "read-only"))
            }))
            .build(json!({ "count": 0 }));

        let err = store.set(json!({ "count": 1 })).unwrap_err();
        assert!(matches!(err, StoreError::Middleware { .. }));
        assert_eq!(store.get()["count"], 0);
    }
}
