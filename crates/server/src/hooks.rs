//! Lifecycle hooks around the tool listing and execution pipelines.
//!
//! Hooks enable middleware-style interception without new dependencies:
//! implement any subset of [`GatewayHook`]'s methods (the rest default to
//! no-ops) and register the hook set under a factory name with
//! [`register_hook_factory`]. The `GATEWAY_HOOK_MODULE` environment variable
//! selects a registered factory at startup.
//!
//! Lifecycle order for `execute_tool`:
//!
//! ```text
//! on_authenticate(headers)      -> ctx.user
//! before_execute(ctx)           -> may return Deny
//! upstream call
//! after_execute(ctx, result)    -> transformed result
//! on_error(ctx, error)          -> observability only (on failure)
//! ```
//!
//! For `discover_tools` / `get_tool_schema` the pipeline is
//! `on_authenticate` -> registry lookup -> `after_list_tools`.

use crate::registry::ToolEntry;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map as JsonMap, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

/// Incoming request headers, lowercase keys.
pub type Headers = BTreeMap<String, String>;

/// Mutable carrier that flows through the hook pipeline for one execution.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Resolved tool entry from the registry.
    pub tool: Arc<ToolEntry>,
    /// Tool arguments; hooks may modify in place.
    pub arguments: JsonMap<String, Value>,
    /// Incoming HTTP request headers (read-only).
    pub headers: Headers,
    /// User identity set by `on_authenticate`; shape is hook-defined.
    pub user: Option<Value>,
    /// Additional headers forwarded to the upstream server.
    pub extra_headers: BTreeMap<String, String>,
    /// Hook-to-hook communication channel.
    pub metadata: JsonMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(tool: Arc<ToolEntry>, arguments: JsonMap<String, Value>, headers: Headers) -> Self {
        Self {
            tool,
            arguments,
            headers,
            user: None,
            extra_headers: BTreeMap::new(),
            metadata: JsonMap::new(),
        }
    }
}

/// Context for tool-list filtering in `after_list_tools`.
#[derive(Debug)]
pub struct ListToolsContext {
    /// Domain being listed; `None` for cross-domain listings and search.
    pub domain: Option<String>,
    /// Incoming HTTP request headers.
    pub headers: Headers,
    /// User identity set by `on_authenticate`.
    pub user: Option<Value>,
}

/// Verdict of a `before_execute` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionDecision {
    /// Proceed to the next hook (and eventually the upstream call).
    Continue,
    /// Refuse the execution; the gateway returns `{error, code}` and skips
    /// the remaining hooks and the upstream call.
    Deny { code: String, message: String },
}

impl ExecutionDecision {
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            code: "forbidden".into(),
            message: message.into(),
        }
    }

    pub fn deny_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deny {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A lifecycle hook. Implement any subset of the methods; every default is
/// a no-op. Hooks are stateful and own their own synchronization.
#[async_trait]
pub trait GatewayHook: Send + Sync {
    /// Called once per request before tool execution. Return a user
    /// identity or `None`; the last non-`None` result across hooks wins.
    async fn on_authenticate(&self, _headers: &Headers) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Called after a tool list is built. Return a (possibly filtered)
    /// list; each hook receives the previous hook's output.
    async fn after_list_tools(
        &self,
        _ctx: &ListToolsContext,
        tools: Vec<Arc<ToolEntry>>,
    ) -> Result<Vec<Arc<ToolEntry>>> {
        Ok(tools)
    }

    /// Called before each execution. Return [`ExecutionDecision::Deny`] to
    /// block it; mutate `ctx` to adjust arguments or add upstream headers.
    async fn before_execute(&self, _ctx: &mut ExecutionContext) -> ExecutionDecision {
        ExecutionDecision::Continue
    }

    /// Called after each execution. Return a (possibly transformed)
    /// result; each hook receives the previous hook's output.
    async fn after_execute(
        &self,
        _ctx: &ExecutionContext,
        result: Value,
        _is_error: bool,
    ) -> Result<Value> {
        Ok(result)
    }

    /// Called when execution fails. Observability only; errors raised here
    /// are logged and swallowed.
    async fn on_error(&self, _ctx: &ExecutionContext, _error: &anyhow::Error) {}
}

/// Ordered hook pipeline.
#[derive(Default)]
pub struct HookRunner {
    hooks: Vec<Arc<dyn GatewayHook>>,
}

impl HookRunner {
    pub fn new(hooks: Vec<Arc<dyn GatewayHook>>) -> Self {
        Self { hooks }
    }

    pub fn add(&mut self, hook: Arc<dyn GatewayHook>) {
        self.hooks.push(hook);
    }

    pub fn has_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    /// Run all `on_authenticate` hooks; last non-`None` result wins.
    pub async fn authenticate(&self, headers: &Headers) -> Result<Option<Value>> {
        let mut user = None;
        for hook in &self.hooks {
            if let Some(identity) = hook.on_authenticate(headers).await? {
                user = Some(identity);
            }
        }
        Ok(user)
    }

    /// Pipeline the tool list through all `after_list_tools` hooks.
    pub async fn after_list_tools(
        &self,
        ctx: &ListToolsContext,
        tools: &[Arc<ToolEntry>],
    ) -> Result<Vec<Arc<ToolEntry>>> {
        let mut current = tools.to_vec();
        for hook in &self.hooks {
            current = hook.after_list_tools(ctx, current).await?;
        }
        Ok(current)
    }

    /// Run `before_execute` hooks in order; the first `Deny` short-circuits.
    pub async fn before_execute(&self, ctx: &mut ExecutionContext) -> ExecutionDecision {
        for hook in &self.hooks {
            if let deny @ ExecutionDecision::Deny { .. } = hook.before_execute(ctx).await {
                return deny;
            }
        }
        ExecutionDecision::Continue
    }

    /// Pipeline the result through all `after_execute` hooks.
    pub async fn after_execute(
        &self,
        ctx: &ExecutionContext,
        result: Value,
        is_error: bool,
    ) -> Result<Value> {
        let mut current = result;
        for hook in &self.hooks {
            current = hook.after_execute(ctx, current, is_error).await?;
        }
        Ok(current)
    }

    /// Run all `on_error` hooks. Fault-tolerant by contract.
    pub async fn on_error(&self, ctx: &ExecutionContext, error: &anyhow::Error) {
        for hook in &self.hooks {
            hook.on_error(ctx, error).await;
        }
    }
}

/// A compiled-in hook factory: builds a fresh hook set for the gateway.
pub type HookFactory = Arc<dyn Fn() -> Vec<Arc<dyn GatewayHook>> + Send + Sync>;

static FACTORIES: LazyLock<RwLock<HashMap<String, HookFactory>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a hook factory under `name`. The `GATEWAY_HOOK_MODULE`
/// environment variable selects one of these at startup; call this before
/// [`crate::run`] (e.g. from an embedding binary's `main`).
pub fn register_hook_factory<F>(name: impl Into<String>, factory: F)
where
    F: Fn() -> Vec<Arc<dyn GatewayHook>> + Send + Sync + 'static,
{
    FACTORIES.write().insert(name.into(), Arc::new(factory));
}

/// Look up a registered hook factory by name.
pub fn hook_factory(name: &str) -> Option<HookFactory> {
    FACTORIES.read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolRegistry, ToolSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_tool() -> Arc<ToolEntry> {
        let registry = ToolRegistry::new();
        registry.populate_domain("apollo", vec![ToolSpec::new("ping", "Ping")], None);
        registry.get("ping").unwrap()
    }

    struct StaticUser(&'static str);

    #[async_trait]
    impl GatewayHook for StaticUser {
        async fn on_authenticate(&self, _headers: &Headers) -> Result<Option<Value>> {
            Ok(Some(Value::String(self.0.to_string())))
        }
    }

    struct NullUser;

    #[async_trait]
    impl GatewayHook for NullUser {}

    #[tokio::test]
    async fn last_non_null_identity_wins() {
        let runner = HookRunner::new(vec![
            Arc::new(StaticUser("first")),
            Arc::new(NullUser),
            Arc::new(StaticUser("second")),
        ]);
        let user = runner.authenticate(&Headers::new()).await.unwrap();
        assert_eq!(user, Some(Value::String("second".into())));
    }

    #[tokio::test]
    async fn authenticate_with_no_hooks_is_anonymous() {
        let runner = HookRunner::default();
        assert_eq!(runner.authenticate(&Headers::new()).await.unwrap(), None);
    }

    struct DenyAll;

    #[async_trait]
    impl GatewayHook for DenyAll {
        async fn before_execute(&self, _ctx: &mut ExecutionContext) -> ExecutionDecision {
            ExecutionDecision::deny("no permission")
        }
    }

    struct CountCalls(AtomicUsize);

    #[async_trait]
    impl GatewayHook for CountCalls {
        async fn before_execute(&self, _ctx: &mut ExecutionContext) -> ExecutionDecision {
            self.0.fetch_add(1, Ordering::SeqCst);
            ExecutionDecision::Continue
        }
    }

    #[tokio::test]
    async fn deny_short_circuits_remaining_hooks() {
        let counter = Arc::new(CountCalls(AtomicUsize::new(0)));
        let runner = HookRunner::new(vec![Arc::new(DenyAll), counter.clone()]);
        let mut ctx = ExecutionContext::new(sample_tool(), JsonMap::new(), Headers::new());

        let decision = runner.before_execute(&mut ctx).await;
        assert_eq!(
            decision,
            ExecutionDecision::Deny {
                code: "forbidden".into(),
                message: "no permission".into()
            }
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    struct AppendMarker(&'static str);

    #[async_trait]
    impl GatewayHook for AppendMarker {
        async fn after_execute(
            &self,
            _ctx: &ExecutionContext,
            result: Value,
            _is_error: bool,
        ) -> Result<Value> {
            let text = result.as_str().unwrap_or_default();
            Ok(Value::String(format!("{text}{}", self.0)))
        }
    }

    #[tokio::test]
    async fn after_execute_pipelines_in_order() {
        let runner = HookRunner::new(vec![Arc::new(AppendMarker("-a")), Arc::new(AppendMarker("-b"))]);
        let ctx = ExecutionContext::new(sample_tool(), JsonMap::new(), Headers::new());
        let result = runner
            .after_execute(&ctx, Value::String("base".into()), false)
            .await
            .unwrap();
        assert_eq!(result, Value::String("base-a-b".into()));
    }

    struct DropEverything;

    #[async_trait]
    impl GatewayHook for DropEverything {
        async fn after_list_tools(
            &self,
            _ctx: &ListToolsContext,
            _tools: Vec<Arc<ToolEntry>>,
        ) -> Result<Vec<Arc<ToolEntry>>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn after_list_tools_filters() {
        let runner = HookRunner::new(vec![Arc::new(DropEverything)]);
        let ctx = ListToolsContext {
            domain: None,
            headers: Headers::new(),
            user: None,
        };
        let filtered = runner
            .after_list_tools(&ctx, &[sample_tool()])
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn factory_registry_round_trip() {
        register_hook_factory("test-factory", || {
            vec![Arc::new(NullUser) as Arc<dyn GatewayHook>]
        });
        let factory = hook_factory("test-factory").expect("factory registered");
        assert_eq!(factory().len(), 1);
        assert!(hook_factory("unknown-factory").is_none());
    }
}
