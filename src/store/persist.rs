//! Persistence as a middleware.
//!
//! The core store never persists anything. [`Persist`] writes a JSON snapshot
//! of the state to a [`Storage`] after every change that reaches the raw
//! replace, and [`Persist::rehydrate`] loads it back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

use super::{Change, Middleware, Next, State, Store};

/// A string key/value backend for persisted snapshots.
pub trait Storage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_item(&self, key: &str, value: String) -> Result<(), StoreError>;
    fn remove_item(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory storage, mostly useful for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Arc<DashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.items.get(key).map(|item| item.value().clone()))
    }

    fn set_item(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.items.remove(key);
        Ok(())
    }
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: String) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(key), value)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Snapshots the state to a [`Storage`] after every applied change.
pub struct Persist<St> {
    key: String,
    storage: St,
}

impl<St: Storage> Persist<St> {
    pub fn new(key: impl Into<String>, storage: St) -> Self {
        Self {
            key: key.into(),
            storage,
        }
    }

    /// Loads the persisted snapshot into `store`, replacing its value.
    ///
    /// Returns `false` if nothing was persisted under this key.
    pub fn rehydrate<S>(&self, store: &Store<S>) -> Result<bool, StoreError>
    where
        S: State + DeserializeOwned,
    {
        let Some(snapshot) = self.storage.get_item(&self.key)? else {
            return Ok(false);
        };
        let state: S = serde_json::from_str(&snapshot)?;
        store.replace(state)?;
        tracing::debug!(key = %self.key, "store rehydrated");
        Ok(true)
    }

    /// Removes the persisted snapshot.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.storage.remove_item(&self.key)
    }
}

impl<S, St> Middleware<S> for Persist<St>
where
    S: State + Serialize,
    St: Storage,
{
    fn apply(
        &self,
        store: &Store<S>,
        change: Change<S>,
        next: Next<'_, S>,
    ) -> Result<(), StoreError> {
        next.run(change)?;
        let snapshot = serde_json::to_string(&*store.get())?;
        self.storage.set_item(&self.key, snapshot)
    }
}
