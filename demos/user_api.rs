//! User API example demonstrating queries, mutations and invalidation.
//!
//! This example shows:
//! - A store with logging and validation middleware
//! - A cached, deduplicated `getUser` query
//! - An `updateUser` mutation that invalidates `getUser`
//! - A watching handle refetching after the mutation
//!
//! The transport is an in-memory mock, so no network is needed.
//!
//! Run with: `RUST_LOG=quiver=debug cargo run --example user_api`

use std::time::Duration;

use futures::StreamExt;
use quiver::prelude::*;
use quiver::query::mock::MockBaseQuery;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

/// A user from the API
#[derive(Debug, Clone, Deserialize)]
struct User {
    id: u32,
    name: String,
}

/// Arguments of the rename mutation
#[derive(Debug, Clone, Serialize)]
struct Rename {
    id: u32,
    name: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // A plain reactive store first.
    let counter = Store::builder()
        .middleware(Logger::new("counter"))
        .middleware(Validate::new(|state: &Value| {
            state["count"].as_i64().is_some_and(|count| count <= 3)
        }))
        .build(json!({ "count": 0 }));

    let _printer = counter.subscribe(|next, previous| {
        println!("counter: {} -> {}", previous["count"], next["count"]);
    });
    for _ in 0..5 {
        counter.update(|state| json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 }))?;
    }

    // Now the query layer over a slow mock backend.
    let transport = MockBaseQuery::new().with_delay(Duration::from_millis(200));
    transport.respond("/users/1", json!({ "id": 1, "name": "Ada" }));

    let api = Api::builder(transport.clone())
        .config(QueryConfig::default().with_cache_timeout(Duration::from_secs(5)))
        .plugin(TracingPlugin)
        .build();

    let get_user = api.query(EndpointDef::<u32, User>::query("getUser", |id| {
        RequestDescriptor::get(format!("/users/{id}"))
    }))?;
    let update_user = api.mutation(
        EndpointDef::<Rename, User>::mutation("updateUser", |rename| {
            RequestDescriptor::put(format!("/users/{}", rename.id))
                .body(json!({ "name": rename.name }))
        })
        .invalidates(["getUser"]),
    )?;

    // Two handles asking at once share a single request.
    let first = get_user.handle(1, QueryOptions::default());
    let second = get_user.handle(1, QueryOptions::default());
    let (a, b) = tokio::join!(first.fetch(), second.fetch());
    println!(
        "fetched {:?} and {:?} with {} request(s)",
        a?.data().map(|user| &user.name),
        b?.data().map(|user| &user.name),
        transport.calls()
    );

    let mut states = first.watch();
    states.next().await;

    transport.clear("/users/1");
    transport.respond("/users/1", json!({ "id": 1, "name": "Ada Lovelace" }));
    let outcome = update_user
        .execute(Rename {
            id: 1,
            name: "Ada Lovelace".to_string(),
        })
        .await?;
    if let Some(user) = outcome.data() {
        println!("renamed user {} to {}", user.id, user.name);
    }

    while let Some(state) = states.next().await {
        if state.is_success() {
            println!("after invalidation: {:?}", state.data().map(|user| &user.name));
            break;
        }
    }

    Ok(())
}
