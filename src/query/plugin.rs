//! Lifecycle hooks around query and mutation execution.
//!
//! A [`Plugin`] is registered globally on the [`Api`](super::Api) or on a
//! single endpoint. Global plugins run before endpoint plugins, each group in
//! registration order. Hooks observe; they change the outcome only through the
//! middleware a plugin may embed, or by failing the call with an `Err`.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::cache::CacheKey;
use super::endpoint::{EndpointInfo, QueryArg, QueryData};
use super::error::{ApiError, QueryError};
use super::executor::Slice;
use super::middleware::RequestMiddleware;
use super::state::QueryState;

/// The untyped view of a call handed to plugins and middleware.
///
/// Global hooks serve endpoints of every argument and data type. Those that
/// need the typed view recover it with [`downcast_ref`](Self::downcast_ref):
///
/// ```
/// use quiver::query::HookContext;
///
/// fn user_id(ctx: &dyn HookContext) -> Option<u32> {
///     ctx.downcast_ref::<u32, serde_json::Value>().map(|ctx| *ctx.arg())
/// }
/// ```
pub trait HookContext: Send + Sync {
    fn endpoint(&self) -> &EndpointInfo;

    fn key(&self) -> &CacheKey;

    /// The argument as serialized for the cache key.
    fn arg_json(&self) -> &Value;

    fn as_any(&self) -> &dyn Any;
}

impl dyn HookContext + '_ {
    /// Returns the typed context if the endpoint takes `A` and produces `D`.
    pub fn downcast_ref<A: QueryArg, D: QueryData>(&self) -> Option<&Context<A, D>> {
        self.as_any().downcast_ref::<Context<A, D>>()
    }
}

/// The typed context of one call.
///
/// `get` and `set` act on the state slice of the handle that started the call,
/// not on any wider application state.
pub struct Context<A, D: Send + Sync + 'static> {
    info: EndpointInfo,
    key: CacheKey,
    arg: A,
    arg_json: Value,
    slice: Slice<D>,
    ticket: u64,
}

impl<A: QueryArg, D: QueryData> Context<A, D> {
    pub(crate) const fn new(
        info: EndpointInfo,
        key: CacheKey,
        arg: A,
        arg_json: Value,
        slice: Slice<D>,
        ticket: u64,
    ) -> Self {
        Self {
            info,
            key,
            arg,
            arg_json,
            slice,
            ticket,
        }
    }

    pub fn arg(&self) -> &A {
        &self.arg
    }

    /// The current state of the owning slice.
    pub fn get(&self) -> Arc<QueryState<D>> {
        self.slice.get()
    }

    /// Replaces the state of the owning slice.
    pub fn set(&self, state: QueryState<D>) -> Result<(), ApiError> {
        self.slice.replace(state)
    }

    /// Replaces the slice state unless a newer call has taken it over.
    pub(crate) fn commit(&self, state: QueryState<D>) -> Result<bool, ApiError> {
        self.slice.commit(self.ticket, state)
    }
}

impl<A: QueryArg, D: QueryData> HookContext for Context<A, D> {
    fn endpoint(&self) -> &EndpointInfo {
        &self.info
    }

    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn arg_json(&self) -> &Value {
        &self.arg_json
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Lifecycle hooks invoked around every executed call.
///
/// Cache hits run no hooks. Every hook has a no-op default.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once for every endpoint the plugin is attached to, at
    /// registration.
    fn on_init(&self, _endpoint: &EndpointInfo) {}

    /// Called before the middleware chain runs.
    async fn before_query(&self, _ctx: &dyn HookContext) -> Result<(), ApiError> {
        Ok(())
    }

    /// Called after a successful result was committed.
    async fn after_query(&self, _ctx: &dyn HookContext) -> Result<(), ApiError> {
        Ok(())
    }

    /// Called after a failure was committed.
    async fn on_error(&self, _ctx: &dyn HookContext, _error: &QueryError) -> Result<(), ApiError> {
        Ok(())
    }

    /// Middleware spliced into the request chain of every endpoint the plugin
    /// is attached to.
    fn middleware(&self) -> Option<Arc<dyn RequestMiddleware>> {
        None
    }
}

/// Logs every lifecycle event with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPlugin;

#[async_trait]
impl Plugin for TracingPlugin {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_init(&self, endpoint: &EndpointInfo) {
        tracing::debug!(endpoint = %endpoint.name, kind = %endpoint.kind, "endpoint registered");
    }

    async fn before_query(&self, ctx: &dyn HookContext) -> Result<(), ApiError> {
        tracing::debug!(endpoint = %ctx.endpoint().name, key = %ctx.key(), "request started");
        Ok(())
    }

    async fn after_query(&self, ctx: &dyn HookContext) -> Result<(), ApiError> {
        tracing::debug!(endpoint = %ctx.endpoint().name, key = %ctx.key(), "request succeeded");
        Ok(())
    }

    async fn on_error(&self, ctx: &dyn HookContext, error: &QueryError) -> Result<(), ApiError> {
        tracing::warn!(endpoint = %ctx.endpoint().name, key = %ctx.key(), %error, "request failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::endpoint::EndpointKind;
    use serde_json::json;

    fn context(slice: Slice<String>) -> Context<u32, String> {
        let ticket = slice.begin();
        Context::new(
            EndpointInfo {
                name: Arc::from("getName"),
                kind: EndpointKind::Query,
            },
            CacheKey::from_value("getName", &json!(7)),
            7,
            json!(7),
            slice,
            ticket,
        )
    }

    #[test]
    fn test_downcast_to_typed_context() {
        let ctx = context(Slice::new());
        let erased: &dyn HookContext = &ctx;

        let typed = erased
            .downcast_ref::<u32, String>()
            .expect("matching types");
        assert_eq!(*typed.arg(), 7);
        assert_eq!(erased.arg_json(), &json!(7));
        assert_eq!(erased.endpoint().name(), "getName");

        assert!(erased.downcast_ref::<String, String>().is_none());
        assert!(erased.downcast_ref::<u32, u32>().is_none());
    }

    #[test]
    fn test_context_get_set_scoped_to_slice() {
        let slice = Slice::new();
        let ctx = context(slice.clone());

        ctx.set(QueryState::success(Arc::new("Ada".to_string())))
            .unwrap();
        assert_eq!(slice.get().data().map(String::as_str), Some("Ada"));
        assert!(ctx.get().is_success());
    }

    #[test]
    fn test_commit_is_skipped_once_superseded() {
        let slice = Slice::new();
        let ctx = context(slice.clone());

        assert!(ctx.commit(QueryState::loading(None)).unwrap());
        slice.begin();
        assert!(!ctx.commit(QueryState::success(Arc::new("late".to_string()))).unwrap());
        assert!(slice.get().is_loading());
    }

    #[tokio::test]
    async fn test_tracing_plugin_hooks_succeed() {
        let ctx = context(Slice::new());
        let plugin = TracingPlugin;
        plugin.on_init(ctx.endpoint());
        plugin.before_query(&ctx).await.unwrap();
        plugin.after_query(&ctx).await.unwrap();
        plugin
            .on_error(&ctx, &QueryError::status(500, "boom"))
            .await
            .unwrap();
        assert_eq!(plugin.name(), "tracing");
        assert!(plugin.middleware().is_none());
    }
}
