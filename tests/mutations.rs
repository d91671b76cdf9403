// Integration tests for mutations and cache invalidation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use quiver::prelude::*;
use quiver::query::mock::MockBaseQuery;
use quiver::query::{Next, QueryStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct User {
    id: u32,
    name: String,
}

#[derive(Debug, Clone, Serialize)]
struct Rename {
    id: u32,
    name: String,
}

fn rename(id: u32, name: &str) -> Rename {
    Rename {
        id,
        name: name.to_string(),
    }
}

fn get_user() -> EndpointDef<u32, User> {
    EndpointDef::query("getUser", |id: &u32| {
        RequestDescriptor::get(format!("/users/{id}"))
    })
}

fn update_user() -> EndpointDef<Rename, User> {
    EndpointDef::mutation("updateUser", |patch: &Rename| {
        RequestDescriptor::put(format!("/users/{}", patch.id)).body(json!({ "name": patch.name }))
    })
}

#[tokio::test]
async fn test_execute_sends_request_and_records_result() {
    let mock = MockBaseQuery::new();
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada Lovelace" }));
    let api = Api::builder(mock.clone()).build();
    let update = api.mutation(update_user()).unwrap();

    let handle = update.handle();
    assert!(handle.state().is_uninitialized());

    let outcome = handle.execute(rename(1, "Ada Lovelace")).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.data().unwrap().name, "Ada Lovelace");
    assert_eq!(handle.state().data().unwrap().id, 1);

    let request = &mock.requests()[0];
    assert_eq!(request.method, quiver::query::Method::Put);
    assert_eq!(request.body, Some(json!({ "name": "Ada Lovelace" })));
}

#[tokio::test]
async fn test_mutations_are_never_cached() {
    let mock = MockBaseQuery::new();
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada" }));
    let api = Api::builder(mock.clone()).build();
    let update = api.mutation(update_user()).unwrap();

    update.execute(rename(1, "Ada")).await.unwrap();
    update.execute(rename(1, "Ada")).await.unwrap();

    assert_eq!(mock.calls(), 2);
    assert!(api.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_mutations_are_not_shared() {
    let mock = MockBaseQuery::new().with_delay(Duration::from_millis(50));
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada" }));
    let api = Api::builder(mock.clone()).build();
    let update = api.mutation(update_user()).unwrap();

    let (a, b) = tokio::join!(
        update.execute(rename(1, "Ada")),
        update.execute(rename(1, "Ada"))
    );

    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn test_failure_is_an_outcome_not_an_error() {
    let mock = MockBaseQuery::new();
    mock.fail("/users/1", QueryError::status(409, "Conflict"));
    let api = Api::builder(mock).build();
    let update = api.mutation(update_user()).unwrap();

    let handle = update.handle();
    let outcome = handle.execute(rename(1, "Ada")).await.unwrap();

    assert!(outcome.is_error());
    assert_eq!(outcome.error().and_then(QueryError::status_code), Some(409));
    assert_eq!(handle.state().status, QueryStatus::Error);
}

#[tokio::test]
async fn test_state_transitions_and_reset() {
    let mock = MockBaseQuery::new();
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada" }));
    let api = Api::builder(mock).build();
    let update = api.mutation(update_user()).unwrap();
    let handle = update.handle();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&statuses);
    let _subscription = handle.subscribe(move |next, _previous| {
        recorder.lock().push(next.status);
    });

    handle.execute(rename(1, "Ada")).await.unwrap();
    handle.reset().unwrap();

    assert!(handle.state().is_uninitialized());
    assert_eq!(
        *statuses.lock(),
        vec![
            QueryStatus::Loading,
            QueryStatus::Success,
            QueryStatus::Uninitialized
        ]
    );
}

#[tokio::test]
async fn test_success_invalidates_query_endpoints() {
    let mock = MockBaseQuery::new();
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada" }));
    let api = Api::builder(mock.clone()).build();
    let users = api.query(get_user()).unwrap();
    let update = api
        .mutation(update_user().invalidates(["getUser"]))
        .unwrap();

    users.fetch(1).await.unwrap();
    assert!(users.cached(&1).is_some());

    let mut invalidations = api.subscribe_invalidation();
    update.execute(rename(1, "Ada Lovelace")).await.unwrap();

    assert!(users.cached(&1).is_none());
    assert_eq!(
        invalidations.recv().await.unwrap(),
        quiver::query::Invalidation::Endpoint("getUser".to_string())
    );
}

#[tokio::test]
async fn test_watching_query_refetches_after_mutation() {
    let mock = MockBaseQuery::new();
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada" }));
    let api = Api::builder(mock.clone()).build();
    let users = api.query(get_user()).unwrap();
    let update = api
        .mutation(update_user().invalidates(["getUser"]))
        .unwrap();

    let handle = users.subscribe(1, QueryOptions::default()).await.unwrap();
    let mut states = handle.watch();
    let current = states.next().await.unwrap();
    assert_eq!(current.data().unwrap().name, "Ada");

    // The same URL now answers with the renamed user.
    mock.clear("/users/1");
    mock.respond("/users/1", json!({ "id": 1, "name": "Ada Lovelace" }));
    update.execute(rename(1, "Ada Lovelace")).await.unwrap();

    let refreshed = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(state) = states.next().await {
            if state.is_success() {
                return Some(state);
            }
        }
        None
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(refreshed.data().unwrap().name, "Ada Lovelace");
    assert_eq!(mock.calls(), 3);
}

struct Readonly;

#[async_trait]
impl RequestMiddleware for Readonly {
    async fn handle(&self, _ctx: &dyn HookContext, _next: Next<'_>) -> Result<Outcome, ApiError> {
        Ok(Outcome::Rejected)
    }
}

#[tokio::test]
async fn test_rejected_mutation_leaves_state_untouched() {
    let mock = MockBaseQuery::new();
    let api = Api::builder(mock.clone()).build();
    let update = api.mutation(update_user().middleware(Readonly)).unwrap();

    let handle = update.handle();
    let outcome = handle.execute(rename(1, "Ada")).await.unwrap();

    assert!(outcome.is_rejected());
    assert!(handle.state().is_uninitialized());
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn test_registering_a_mutation_as_query_fails() {
    let api = Api::builder(MockBaseQuery::new()).build();

    let err = api.query(update_user()).unwrap_err();
    assert_eq!(
        err,
        ApiError::KindMismatch {
            name: "updateUser".to_string(),
            expected: "query",
            actual: "mutation",
        }
    );
}
