// Integration tests for the reactive store and its middleware chain

use std::sync::Arc;

use parking_lot::Mutex;
use quiver::prelude::*;
use quiver::store::middleware::from_fn;
use quiver::store::{FileStorage, MemoryStorage, Persist};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

fn tag(
    name: &'static str,
    log: &Arc<Mutex<Vec<String>>>,
) -> impl Middleware<Value> + 'static {
    let log = Arc::clone(log);
    from_fn::<Value, _>(move |_store, change, next| {
        log.lock().push(format!("{name}-enter"));
        next.run(change)?;
        log.lock().push(format!("{name}-exit"));
        Ok(())
    })
}

#[test]
fn test_counter_increments() {
    let store = Store::new(json!({ "count": 0 }));
    let increment = |state: &Value| json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 });

    store.update(increment).unwrap();
    store.update(increment).unwrap();

    assert_eq!(*store.get(), json!({ "count": 2 }));
}

#[test]
fn test_middleware_wraps_raw_replace() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Store::builder()
        .middleware(tag("A", &log))
        .middleware(tag("B", &log))
        .build(json!({ "count": 0 }));

    let listener_log = Arc::clone(&log);
    let _subscription = store.subscribe(move |_next, _previous| {
        listener_log.lock().push("raw-op".to_string());
    });

    store.set(json!({ "count": 1 })).unwrap();

    assert_eq!(
        *log.lock(),
        vec!["A-enter", "B-enter", "raw-op", "B-exit", "A-exit"]
    );
}

#[test]
fn test_validate_drops_invalid_changes() {
    let store = Store::builder()
        .middleware(Validate::new(|state: &Value| {
            state["count"].as_i64().is_some_and(|count| count >= 0)
        }))
        .build(json!({ "count": 1 }));

    let before = store.get();
    store.set(json!({ "count": -5 })).unwrap();
    assert!(Arc::ptr_eq(&before, &store.get()));

    store.set(json!({ "count": 3 })).unwrap();
    assert_eq!(store.get()["count"], 3);
}

fn increment(state: &Value) -> Value {
    json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 })
}

#[test]
fn test_updates_from_many_threads_all_land() {
    let store = Store::builder()
        .middleware(Logger::new("counter"))
        .build(json!({ "count": 0 }));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let store = store.clone();
            scope.spawn(move || {
                for _ in 0..5000 {
                    store.update(increment).unwrap();
                }
            });
        }
    });

    assert_eq!(store.get()["count"], 20000);
}

#[test]
fn test_validate_holds_under_contention() {
    let store = Store::builder()
        .middleware(Validate::new(|state: &Value| {
            state["count"].as_i64().is_some_and(|count| count <= 100)
        }))
        .build(json!({ "count": 0 }));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let store = store.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    store.update(increment).unwrap();
                }
            });
        }
    });

    assert_eq!(store.get()["count"], 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_from_many_tasks_all_land() {
    let store = Store::new(json!({ "count": 0 }));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    store.update(increment).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(store.get()["count"], 4000);
}

#[test]
fn test_set_from_middleware_restarts_chain() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let store = Store::builder()
        .middleware(from_fn::<Value, _>(move |store, change, next| {
            if let Change::Merge(patch) = &change {
                recorder.lock().push(patch.clone());
                // Clamp values above ten by issuing a fresh change.
                if patch["count"].as_i64().is_some_and(|count| count > 10) {
                    return store.set(json!({ "count": 10 }));
                }
            }
            next.run(change)
        }))
        .build(json!({ "count": 0 }));

    store.set(json!({ "count": 42 })).unwrap();

    assert_eq!(store.get()["count"], 10);
    assert_eq!(*seen.lock(), vec![json!({ "count": 42 }), json!({ "count": 10 })]);
}

#[test]
fn test_replace_discards_unlisted_keys() {
    let store = Store::new(json!({ "a": 1, "b": 2 }));

    store.set(json!({ "b": 3 })).unwrap();
    assert_eq!(*store.get(), json!({ "a": 1, "b": 3 }));

    store.replace(json!({ "c": 4 })).unwrap();
    assert_eq!(*store.get(), json!({ "c": 4 }));
}

#[test]
fn test_listener_sees_previous_value() {
    let store = Store::new(json!({ "count": 0 }));
    let pairs = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&pairs);

    let subscription = store.subscribe(move |next: &Value, previous: &Value| {
        recorder
            .lock()
            .push((previous["count"].clone(), next["count"].clone()));
    });

    store.set(json!({ "count": 1 })).unwrap();
    assert!(subscription.unsubscribe());
    store.set(json!({ "count": 2 })).unwrap();

    assert_eq!(*pairs.lock(), vec![(json!(0), json!(1))]);
    assert_eq!(store.listener_count(), 0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Settings {
    theme: String,
    volume: u8,
}

impl State for Settings {
    type Patch = Settings;

    fn merge(&self, patch: Settings) -> Self {
        patch
    }
}

#[test]
fn test_persist_rehydrates_into_new_store() {
    let storage = MemoryStorage::new();
    let store = Store::builder()
        .middleware(Persist::new("settings", storage.clone()))
        .build(Settings {
            theme: "light".to_string(),
            volume: 3,
        });

    store
        .set(Settings {
            theme: "dark".to_string(),
            volume: 7,
        })
        .unwrap();

    let persist = Persist::new("settings", storage);
    let restored = Store::new(Settings {
        theme: "light".to_string(),
        volume: 0,
    });
    assert!(persist.rehydrate(&restored).unwrap());
    assert_eq!(restored.get().theme, "dark");
    assert_eq!(restored.get().volume, 7);

    persist.clear().unwrap();
    assert!(!persist.rehydrate(&restored).unwrap());
}

#[test]
fn test_file_storage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Store::builder()
            .middleware(Persist::new("prefs", FileStorage::new(dir.path())))
            .build(json!({ "lang": "en" }));
        store.set(json!({ "lang": "fr" })).unwrap();
    }

    let store = Store::new(json!({}));
    let persist = Persist::new("prefs", FileStorage::new(dir.path()));
    assert!(persist.rehydrate(&store).unwrap());
    assert_eq!(store.get()["lang"], "fr");
}

#[test]
fn test_registry_shares_stores_by_name() {
    let registry = StoreRegistry::new();
    let store = Store::new(json!({ "count": 0 }));
    registry.register("counter", store.clone()).unwrap();

    let same: Store<Value> = registry.get("counter").unwrap();
    same.set(json!({ "count": 5 })).unwrap();

    assert_eq!(store.get()["count"], 5);
    assert!(registry.register("counter", Store::new(json!({}))).is_err());
}
