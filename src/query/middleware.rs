//! Request middleware composed onion-style around the transport call.
//!
//! For an endpoint the chain is, outermost first: the global middleware, the
//! middleware of global plugins, the endpoint's own middleware, then the
//! middleware of endpoint plugins. The innermost step builds the request with
//! the endpoint's query function and hands it to the [`BaseQuery`].
//!
//! A middleware may return without calling [`Next::run`]. Returning
//! [`Outcome::Rejected`] leaves the caller's state as it was before the call;
//! returning [`Outcome::Data`] or [`Outcome::Failed`] answers the request
//! without touching the transport.
//!
//! [`BaseQuery`]: super::BaseQuery

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::error::{ApiError, QueryError};
use super::plugin::HookContext;

/// What a request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Raw response data, not yet decoded.
    Data(Value),
    /// A failure to record in state.
    Failed(QueryError),
    /// A middleware declined the request.
    Rejected,
}

impl Outcome {
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// An interceptor around the transport call of an endpoint.
///
/// ```
/// use async_trait::async_trait;
/// use quiver::query::{ApiError, HookContext, Next, Outcome, RequestMiddleware};
///
/// struct DenyAll;
///
/// #[async_trait]
/// impl RequestMiddleware for DenyAll {
///     async fn handle(&self, _ctx: &dyn HookContext, _next: Next<'_>) -> Result<Outcome, ApiError> {
///         Ok(Outcome::Rejected)
///     }
/// }
/// ```
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    /// Handles one request. Call `next.run()` to continue inward.
    ///
    /// An `Err` is fatal to the current call and surfaces to its caller.
    async fn handle(&self, ctx: &dyn HookContext, next: Next<'_>) -> Result<Outcome, ApiError>;
}

type Terminal<'a> = dyn Fn() -> BoxFuture<'a, Result<Outcome, ApiError>> + Send + Sync + 'a;

/// The remainder of a request middleware chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn RequestMiddleware>],
    ctx: &'a dyn HookContext,
    terminal: &'a Terminal<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn RequestMiddleware>],
        ctx: &'a dyn HookContext,
        terminal: &'a Terminal<'a>,
    ) -> Self {
        Self {
            chain,
            ctx,
            terminal,
        }
    }

    /// Runs the rest of the chain and the transport call.
    pub async fn run(self) -> Result<Outcome, ApiError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next::new(rest, self.ctx, self.terminal);
                head.handle(self.ctx, next).await
            }
            None => (self.terminal)().await,
        }
    }

    /// Number of middleware still ahead of the transport call.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cache::CacheKey;
    use crate::query::endpoint::{EndpointInfo, EndpointKind};
    use futures::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::any::Any;

    struct TestContext {
        info: EndpointInfo,
        key: CacheKey,
        arg: Value,
    }

    impl TestContext {
        fn new() -> Self {
            Self {
                info: EndpointInfo {
                    name: Arc::from("getUser"),
                    kind: EndpointKind::Query,
                },
                key: CacheKey::from_value("getUser", &json!(1)),
                arg: json!(1),
            }
        }
    }

    impl HookContext for TestContext {
        fn endpoint(&self) -> &EndpointInfo {
            &self.info
        }

        fn key(&self) -> &CacheKey {
            &self.key
        }

        fn arg_json(&self) -> &Value {
            &self.arg
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RequestMiddleware for Record {
        async fn handle(&self, _ctx: &dyn HookContext, next: Next<'_>) -> Result<Outcome, ApiError> {
            self.log.lock().push(format!("{}-enter", self.name));
            let outcome = next.run().await;
            self.log.lock().push(format!("{}-exit", self.name));
            outcome
        }
    }

    struct Reject;

    #[async_trait]
    impl RequestMiddleware for Reject {
        async fn handle(&self, _ctx: &dyn HookContext, _next: Next<'_>) -> Result<Outcome, ApiError> {
            Ok(Outcome::Rejected)
        }
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn RequestMiddleware>> = vec![
            Arc::new(Record {
                name: "a",
                log: Arc::clone(&log),
            }),
            Arc::new(Record {
                name: "b",
                log: Arc::clone(&log),
            }),
        ];
        let ctx = TestContext::new();
        let terminal_log = Arc::clone(&log);
        let terminal = move || {
            terminal_log.lock().push("transport".to_string());
            async { Ok(Outcome::Data(json!({ "id": 1 }))) }.boxed()
        };

        let outcome = Next::new(&chain, &ctx, &terminal).run().await.unwrap();

        assert_eq!(outcome, Outcome::Data(json!({ "id": 1 })));
        assert_eq!(
            *log.lock(),
            vec!["a-enter", "b-enter", "transport", "b-exit", "a-exit"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn RequestMiddleware>> = vec![
            Arc::new(Record {
                name: "outer",
                log: Arc::clone(&log),
            }),
            Arc::new(Reject),
            Arc::new(Record {
                name: "inner",
                log: Arc::clone(&log),
            }),
        ];
        let ctx = TestContext::new();
        let terminal_log = Arc::clone(&log);
        let terminal = move || {
            terminal_log.lock().push("transport".to_string());
            async { Ok(Outcome::Data(Value::Null)) }.boxed()
        };

        let outcome = Next::new(&chain, &ctx, &terminal).run().await.unwrap();

        assert!(outcome.is_rejected());
        assert_eq!(*log.lock(), vec!["outer-enter", "outer-exit"]);
    }

    #[tokio::test]
    async fn test_empty_chain_calls_transport() {
        let ctx = TestContext::new();
        let terminal = || async { Ok(Outcome::Failed(QueryError::status(500, "boom"))) }.boxed();
        let next = Next::new(&[], &ctx, &terminal);
        assert_eq!(next.remaining(), 0);
        assert_eq!(
            next.run().await.unwrap(),
            Outcome::Failed(QueryError::status(500, "boom"))
        );
    }
}
