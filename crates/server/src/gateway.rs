//! Gateway wiring: registry + upstream manager + hook pipeline, plus the
//! dynamically built server instructions, lifecycle state, and the
//! background refresh loop.

use crate::handler::PeerHub;
use crate::hooks::{GatewayHook, HookRunner};
use crate::registry::{RegistryDiff, ToolRegistry};
use crate::upstream::UpstreamManager;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Server lifecycle. `/readyz` reports ready only in `Populated` and
/// `Running` (and only once at least one domain population succeeded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Constructed = 0,
    Populated = 1,
    Running = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Populated,
            2 => Self::Running,
            3 => Self::Stopped,
            _ => Self::Constructed,
        }
    }
}

/// Construction-time options for [`Gateway`].
pub struct GatewayOptions {
    /// Server name advertised in the MCP handshake.
    pub name: String,
    /// Custom instructions; when set, dynamic instructions are never built
    /// and this string is served verbatim.
    pub instructions: Option<String>,
    /// Headers attached to every discovery connection.
    pub registry_auth_headers: BTreeMap<String, String>,
    /// Per-request timeout for upstream connections.
    pub upstream_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            name: "toolgate".into(),
            instructions: None,
            registry_auth_headers: BTreeMap::new(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// The assembled gateway. Shared behind an `Arc` between the MCP handler,
/// the HTTP endpoints, and the background refresh loop.
pub struct Gateway {
    name: String,
    registry: Arc<ToolRegistry>,
    manager: Arc<UpstreamManager>,
    hooks: HookRunner,
    instructions: RwLock<String>,
    custom_instructions: bool,
    lifecycle: AtomicU8,
    peers: PeerHub,
}

impl Gateway {
    pub fn new(options: GatewayOptions, hooks: Vec<Arc<dyn GatewayHook>>) -> Arc<Self> {
        let registry = Arc::new(ToolRegistry::new());
        let manager = Arc::new(UpstreamManager::new(
            Arc::clone(&registry),
            options.registry_auth_headers,
            options.upstream_timeout,
        ));
        let custom_instructions = options.instructions.is_some();
        let instructions = options
            .instructions
            .unwrap_or_else(|| build_instructions(&registry));
        Arc::new(Self {
            name: options.name,
            registry,
            manager,
            hooks: HookRunner::new(hooks),
            instructions: RwLock::new(instructions),
            custom_instructions,
            lifecycle: AtomicU8::new(Lifecycle::Constructed as u8),
            peers: PeerHub::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    pub fn peers(&self) -> &PeerHub {
        &self.peers
    }

    /// Current handshake instructions.
    pub fn instructions(&self) -> String {
        self.instructions.read().clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.store(state as u8, Ordering::SeqCst);
    }

    /// Readiness: at least one domain population succeeded and the server
    /// has not been stopped.
    pub fn is_ready(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Populated | Lifecycle::Running)
            && !self.registry.domain_names().is_empty()
    }

    /// Initial registry population across all registered upstreams.
    pub async fn populate(self: &Arc<Self>) -> (Vec<RegistryDiff>, Vec<String>) {
        let (diffs, failed) = self.manager.populate_all().await;
        self.rebuild_instructions();
        self.set_lifecycle(Lifecycle::Populated);
        if diffs.iter().any(|d| !d.is_empty()) {
            self.peers.notify_tools_changed().await;
        }
        (diffs, failed)
    }

    /// Re-discover every upstream, keeping previous snapshots for
    /// unreachable domains.
    pub async fn refresh(self: &Arc<Self>) -> (Vec<RegistryDiff>, Vec<String>) {
        let (diffs, failed) = self.manager.refresh_all().await;
        self.rebuild_instructions();
        if diffs.iter().any(|d| !d.is_empty()) {
            self.peers.notify_tools_changed().await;
        }
        (diffs, failed)
    }

    /// Dynamic-registration path: upsert an upstream and populate it.
    pub async fn add_domain(
        &self,
        domain: &str,
        url: &str,
        description: Option<String>,
        static_headers: Option<BTreeMap<String, String>>,
    ) -> Result<RegistryDiff, crate::errors::UpstreamError> {
        let result = self
            .manager
            .add_upstream(domain, url, description, static_headers)
            .await;
        self.rebuild_instructions();
        if let Ok(diff) = &result {
            if !diff.is_empty() {
                self.peers.notify_tools_changed().await;
            }
        }
        result
    }

    /// Dynamic-registration path: drop an upstream and its tools.
    pub async fn remove_domain(
        &self,
        domain: &str,
    ) -> Result<Vec<String>, crate::errors::UpstreamError> {
        let removed = self.manager.remove_upstream(domain).await?;
        self.rebuild_instructions();
        if !removed.is_empty() {
            self.peers.notify_tools_changed().await;
        }
        Ok(removed)
    }

    /// Rebuild the dynamic instructions from the current registry.
    /// User-supplied instructions are never overwritten.
    pub fn rebuild_instructions(&self) {
        if self.custom_instructions {
            return;
        }
        *self.instructions.write() = build_instructions(&self.registry);
    }

    /// Background refresh loop. Runs until `shutdown` is cancelled;
    /// per-domain atomic replacement means cancellation can never leave a
    /// domain half-updated.
    pub async fn refresh_loop(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "toolgate::refresh", "refresh loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let (diffs, failed) = self.refresh().await;
            let changed: usize = diffs.iter().filter(|d| !d.is_empty()).count();
            tracing::debug!(
                target: "toolgate::refresh",
                domains = diffs.len(),
                changed,
                failed = failed.len(),
                "registry refreshed"
            );
        }
    }
}

/// Default handshake instructions: a short workflow description plus one
/// line per domain.
fn build_instructions(registry: &ToolRegistry) -> String {
    let mut text = String::from(
        "This gateway aggregates tools from multiple upstream services. \
         Four tools are available:\n\
         1. discover_tools - Browse available tools. Call with no arguments to see \
         domains, with a domain to list its tools, or with a query to search.\n\
         2. get_tool_schema - Get a tool's parameter schema before using it.\n\
         3. execute_tool - Run any discovered tool by name.\n\
         4. refresh_registry - Re-discover upstream tools if something seems missing.\n\
         Workflow: discover_tools -> get_tool_schema -> execute_tool. Skip discovery \
         for tools you have already used in this conversation.",
    );
    let domains = registry.list_domains();
    if !domains.is_empty() {
        text.push_str("\n\nAvailable domains:");
        for domain in domains {
            text.push_str(&format!("\n- {} ({} tools)", domain.name, domain.tool_count));
            if let Some(description) = &domain.description {
                text.push_str(&format!(": {description}"));
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolSpec;

    fn gateway() -> Arc<Gateway> {
        Gateway::new(GatewayOptions::default(), Vec::new())
    }

    #[test]
    fn instructions_list_domains_with_counts() {
        let gw = gateway();
        gw.registry().populate_domain(
            "apollo",
            vec![
                ToolSpec::new("people_search", "Search people"),
                ToolSpec::new("org_search", "Search orgs"),
            ],
            Some("Sales intelligence".into()),
        );
        gw.rebuild_instructions();

        let instructions = gw.instructions();
        assert!(instructions.contains("discover_tools"));
        assert!(instructions.contains("- apollo (2 tools): Sales intelligence"));
    }

    #[test]
    fn custom_instructions_are_never_overwritten() {
        let gw = Gateway::new(
            GatewayOptions {
                instructions: Some("custom text".into()),
                ..Default::default()
            },
            Vec::new(),
        );
        gw.registry()
            .populate_domain("svc", vec![ToolSpec::new("ping", "Ping")], None);
        gw.rebuild_instructions();
        assert_eq!(gw.instructions(), "custom text");
    }

    #[test]
    fn readiness_requires_population() {
        let gw = gateway();
        assert_eq!(gw.lifecycle(), Lifecycle::Constructed);
        assert!(!gw.is_ready());

        // Populated but no domain ever succeeded: still not ready.
        gw.set_lifecycle(Lifecycle::Populated);
        assert!(!gw.is_ready());

        gw.registry()
            .populate_domain("svc", vec![ToolSpec::new("ping", "Ping")], None);
        assert!(gw.is_ready());

        gw.set_lifecycle(Lifecycle::Stopped);
        assert!(!gw.is_ready());
    }

    #[tokio::test]
    async fn refresh_loop_stops_on_cancellation() {
        let gw = gateway();
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            Arc::clone(&gw).refresh_loop(Duration::from_millis(10), token.clone()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits promptly")
            .expect("loop task does not panic");
    }
}
