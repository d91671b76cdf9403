//! An explicit registry of named stores.
//!
//! Applications that would otherwise reach for a module-level singleton build
//! one `StoreRegistry` at their composition root and pass it (or the stores it
//! hands out) to whatever needs them. Stores registered here live as long as
//! the registry does.

use std::any::Any;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::StoreError;

use super::{State, Store};

/// Named stores of arbitrary state types.
#[derive(Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Box<dyn Any + Send + Sync>>,
}

impl StoreRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` under `name`.
    pub fn register<S: State>(
        &self,
        name: impl Into<String>,
        store: Store<S>,
    ) -> Result<(), StoreError> {
        match self.stores.entry(name.into()) {
            Entry::Occupied(entry) => Err(StoreError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(store = %entry.key(), "store registered");
                entry.insert(Box::new(store));
                Ok(())
            }
        }
    }

    /// Returns the store registered under `name` if its state type is `S`.
    pub fn get<S: State>(&self, name: &str) -> Option<Store<S>> {
        self.stores
            .get(name)
            .and_then(|entry| entry.downcast_ref::<Store<S>>().cloned())
    }

    /// Returns the store under `name`, creating it with `init` if missing.
    ///
    /// Returns `None` if a store of another state type owns the name.
    pub fn get_or_insert_with<S: State>(
        &self,
        name: &str,
        init: impl FnOnce() -> Store<S>,
    ) -> Option<Store<S>> {
        self.stores
            .entry(name.to_string())
            .or_insert_with(|| Box::new(init()))
            .downcast_ref::<Store<S>>()
            .cloned()
    }

    /// Removes the store under `name`. Returns `true` if one was registered.
    pub fn remove(&self, name: &str) -> bool {
        self.stores.remove(name).is_some()
    }

    /// Names of every registered store, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
