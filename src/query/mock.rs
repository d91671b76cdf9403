//! Mock transport for testing.
//!
//! [`MockBaseQuery`] answers requests from canned responses keyed by URL and
//! records every request it sees, enabling deterministic tests without real
//! I/O.
//!
//! # Basic Usage
//!
//! ```
//! use quiver::query::mock::MockBaseQuery;
//! use quiver::query::{Api, EndpointDef, QueryError, RequestDescriptor};
//! use serde_json::json;
//!
//! let mock = MockBaseQuery::new();
//! mock.respond("/users/1", json!({ "id": 1, "name": "Ada" }));
//! mock.fail("/users/2", QueryError::status(404, "Not Found"));
//!
//! // The API takes a clone; the test keeps the other one to inspect calls.
//! let api = Api::builder(mock.clone()).build();
//! assert_eq!(mock.calls(), 0);
//! ```
//!
//! # Response Sequences
//!
//! Responses queued for one URL are served in order. The last one repeats, so
//! a single `respond` answers every later request:
//!
//! ```
//! # use quiver::query::mock::MockBaseQuery;
//! # use quiver::query::QueryError;
//! # use serde_json::json;
//! let mock = MockBaseQuery::new();
//! mock.fail("/flaky", QueryError::status(503, "unavailable"));
//! mock.respond("/flaky", json!("ok"));
//! // First request fails, every later one succeeds.
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use super::error::QueryError;
use super::request::{BaseQuery, BaseQueryResult, RequestDescriptor};

#[derive(Debug, Default)]
struct Inner {
    routes: Mutex<HashMap<String, VecDeque<BaseQueryResult>>>,
    requests: Mutex<Vec<RequestDescriptor>>,
    delay: Mutex<Option<Duration>>,
}

/// A [`BaseQuery`] serving canned responses.
///
/// Clones share routes and the request log. Requests to a URL without
/// responses fail with a 404 transport error.
#[derive(Debug, Clone, Default)]
pub struct MockBaseQuery {
    inner: Arc<Inner>,
}

impl MockBaseQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(Some(delay));
        self
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.inner.delay.lock() = delay;
    }

    /// Queues a successful response for `url`.
    pub fn respond(&self, url: impl Into<String>, data: Value) {
        self.push(url.into(), Ok(data));
    }

    /// Queues a failure for `url`.
    pub fn fail(&self, url: impl Into<String>, error: QueryError) {
        self.push(url.into(), Err(error));
    }

    fn push(&self, url: String, response: BaseQueryResult) {
        self.inner
            .routes
            .lock()
            .entry(url)
            .or_default()
            .push_back(response);
    }

    /// Drops every queued response for `url`.
    pub fn clear(&self, url: &str) {
        self.inner.routes.lock().remove(url);
    }

    /// Total number of requests received.
    pub fn calls(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Number of requests received for `url`.
    pub fn calls_to(&self, url: &str) -> usize {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|request| request.url == url)
            .count()
    }

    /// Every request received, oldest first.
    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.inner.requests.lock().clone()
    }

    fn next_response(&self, url: &str) -> BaseQueryResult {
        let mut routes = self.inner.routes.lock();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(QueryError::status(404, "Not Found"))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(QueryError::status(404, "Not Found"))),
            None => Err(QueryError::status(404, "Not Found")),
        }
    }
}

impl BaseQuery for MockBaseQuery {
    fn fetch(&self, request: RequestDescriptor) -> BoxFuture<'static, BaseQueryResult> {
        // Record and resolve synchronously so the call order is deterministic.
        let response = self.next_response(&request.url);
        self.inner.requests.lock().push(request);
        let delay = *self.inner.delay.lock();

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        }
        .boxed()
    }
}
