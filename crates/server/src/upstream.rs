//! Upstream client management with a dual connection strategy.
//!
//! Each domain keeps one persistent *discovery* connection, used only for
//! `tools/list` during registry population and refresh; it carries the
//! registry auth headers plus the domain's static headers and no user
//! context. Tool execution opens a *fresh* one-shot connection per call so
//! that the caller's HTTP headers (merged with hook-supplied extras) reach
//! the upstream, and tears it down when the call returns.
//!
//! Discovery connections are established lazily: a domain whose upstream is
//! down at registration time still joins the registry at the next refresh.

use crate::errors::UpstreamError;
use crate::registry::{RegistryDiff, ToolEntry, ToolRegistry, ToolSpec};
use anyhow::Context as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use rmcp::ServiceExt;
use serde_json::{Map as JsonMap, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

type McpClient = RunningService<RoleClient, ()>;

/// Headers that must not be forwarded to upstreams: hop-by-hop headers and
/// transport/framing headers owned by the fresh execution connection.
const STRIPPED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "connection",
    "content-length",
    "content-type",
    "host",
    "keep-alive",
    "mcp-protocol-version",
    "mcp-session-id",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One configured upstream domain.
struct Upstream {
    url: String,
    description: Option<String>,
    static_headers: BTreeMap<String, String>,
    /// Persistent discovery connection; `None` until first use or after a
    /// failure forced a reconnect.
    discovery: tokio::sync::Mutex<Option<McpClient>>,
}

/// Manages connections to upstream MCP servers and keeps the registry
/// populated from them.
pub struct UpstreamManager {
    registry: Arc<ToolRegistry>,
    upstreams: parking_lot::RwLock<BTreeMap<String, Arc<Upstream>>>,
    /// Headers sent on every discovery connection (e.g. a registry bearer
    /// token). Domain static headers override on key conflicts.
    registry_auth_headers: BTreeMap<String, String>,
    request_timeout: Duration,
    /// Serializes add/remove/populate so per-domain populations are totally
    /// ordered.
    mutation: tokio::sync::Mutex<()>,
}

impl UpstreamManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        registry_auth_headers: BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            upstreams: parking_lot::RwLock::new(BTreeMap::new()),
            registry_auth_headers,
            request_timeout,
            mutation: tokio::sync::Mutex::new(()),
        }
    }

    /// Register `domain` without populating it (used at startup so that
    /// `populate_all` discovers every configured upstream in one pass).
    pub fn register(
        &self,
        domain: &str,
        url: &str,
        description: Option<String>,
        static_headers: Option<BTreeMap<String, String>>,
    ) {
        let upstream = Arc::new(Upstream {
            url: url.to_string(),
            description,
            static_headers: static_headers.unwrap_or_default(),
            discovery: tokio::sync::Mutex::new(None),
        });
        self.upstreams.write().insert(domain.to_string(), upstream);
    }

    /// Idempotent upsert: (re-)register `domain` and populate it.
    ///
    /// Re-registration without `static_headers` clears any previously
    /// stored headers for the domain; nothing is silently preserved. The
    /// upstream stays registered even when population fails (the next
    /// refresh retries), so the error carries no registration state.
    pub async fn add_upstream(
        &self,
        domain: &str,
        url: &str,
        description: Option<String>,
        static_headers: Option<BTreeMap<String, String>>,
    ) -> Result<RegistryDiff, UpstreamError> {
        let _guard = self.mutation.lock().await;

        let previous = self.upstreams.read().get(domain).cloned();
        if let Some(previous) = previous {
            close_discovery(&previous).await;
        }
        self.register(domain, url, description, static_headers);
        tracing::info!(target: "toolgate::upstream", domain, url, "upstream registered");

        self.populate_domain_inner(domain).await
    }

    /// Remove `domain`: close its discovery connection and drop its
    /// registry slice. Returns the tool names that were removed.
    pub async fn remove_upstream(&self, domain: &str) -> Result<Vec<String>, UpstreamError> {
        let _guard = self.mutation.lock().await;

        let Some(upstream) = self.upstreams.write().remove(domain) else {
            return Err(UpstreamError::UnknownDomain(domain.to_string()));
        };
        close_discovery(&upstream).await;

        let removed = self
            .registry
            .tools_in_domain(domain)
            .map(|tools| tools.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default();
        self.registry.remove_domain(domain);
        tracing::info!(target: "toolgate::upstream", domain, "upstream removed");
        Ok(removed)
    }

    /// Discover tools from every registered upstream. Unreachable domains
    /// are logged and reported in the second element; their previous
    /// registry snapshot (if any) is retained.
    pub async fn populate_all(&self) -> (Vec<RegistryDiff>, Vec<String>) {
        let _guard = self.mutation.lock().await;

        let domains: Vec<String> = self.upstreams.read().keys().cloned().collect();
        let mut diffs = Vec::new();
        let mut failed = Vec::new();
        for domain in domains {
            match self.populate_domain_inner(&domain).await {
                Ok(diff) => {
                    tracing::info!(
                        target: "toolgate::upstream",
                        domain = %domain,
                        tools = diff.tool_count,
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        "domain populated"
                    );
                    diffs.push(diff);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "toolgate::upstream",
                        domain = %domain,
                        error = %err,
                        "failed to populate upstream; keeping previous snapshot"
                    );
                    failed.push(domain);
                }
            }
        }
        (diffs, failed)
    }

    /// Same as [`populate_all`](Self::populate_all); refresh keeps the
    /// previous snapshot for any domain that fails.
    pub async fn refresh_all(&self) -> (Vec<RegistryDiff>, Vec<String>) {
        self.populate_all().await
    }

    /// Re-populate a single domain.
    pub async fn refresh_domain(&self, domain: &str) -> Result<RegistryDiff, UpstreamError> {
        let _guard = self.mutation.lock().await;
        self.populate_domain_inner(domain).await
    }

    /// Execute `entry` on its upstream over a fresh one-shot connection.
    ///
    /// Header priority: hook `extra_headers` > domain static headers >
    /// forwarded incoming headers (hop-by-hop stripped). The wire name is
    /// always `entry.original_name`.
    pub async fn execute(
        &self,
        entry: &ToolEntry,
        arguments: JsonMap<String, Value>,
        incoming_headers: &BTreeMap<String, String>,
        extra_headers: &BTreeMap<String, String>,
    ) -> Result<CallToolResult, UpstreamError> {
        let upstream = self
            .upstreams
            .read()
            .get(&entry.domain)
            .cloned()
            .ok_or_else(|| UpstreamError::UnknownDomain(entry.domain.clone()))?;

        let mut headers = strip_hop_by_hop(incoming_headers);
        headers.extend(upstream.static_headers.clone());
        headers.extend(extra_headers.clone());

        let client = self
            .connect(&upstream.url, &headers)
            .await
            .map_err(|source| UpstreamError::Connect {
                domain: entry.domain.clone(),
                source,
            })?;

        tracing::debug!(
            target: "toolgate::upstream",
            domain = %entry.domain,
            tool = %entry.original_name,
            "forwarding tool call"
        );
        let result = client
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(entry.original_name.clone()),
                arguments: Some(arguments),
            })
            .await;

        // One-shot connection: always torn down before returning.
        if let Err(err) = client.cancel().await {
            tracing::debug!(
                target: "toolgate::upstream",
                domain = %entry.domain,
                error = %err,
                "execution client teardown failed"
            );
        }

        result.map_err(|err| UpstreamError::Call {
            domain: entry.domain.clone(),
            source: err.into(),
        })
    }

    /// Snapshot of configured upstreams as `domain -> url`.
    pub fn list_upstreams(&self) -> BTreeMap<String, String> {
        self.upstreams
            .read()
            .iter()
            .map(|(domain, upstream)| (domain.clone(), upstream.url.clone()))
            .collect()
    }

    /// Configured domain names, sorted.
    pub fn domains(&self) -> Vec<String> {
        self.upstreams.read().keys().cloned().collect()
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.upstreams.read().contains_key(domain)
    }

    /// Close every discovery connection (shutdown path).
    pub async fn close_all(&self) {
        let upstreams: Vec<Arc<Upstream>> = self.upstreams.read().values().cloned().collect();
        for upstream in upstreams {
            close_discovery(&upstream).await;
        }
    }

    /// List tools over the domain's discovery connection and swap them into
    /// the registry. A failed listing drops the discovery connection so the
    /// next attempt reconnects from scratch.
    async fn populate_domain_inner(&self, domain: &str) -> Result<RegistryDiff, UpstreamError> {
        let upstream = self
            .upstreams
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| UpstreamError::UnknownDomain(domain.to_string()))?;

        let peer = {
            let mut guard = upstream.discovery.lock().await;
            match guard.as_ref() {
                Some(client) => client.peer().clone(),
                None => {
                    let mut headers = self.registry_auth_headers.clone();
                    headers.extend(upstream.static_headers.clone());
                    let client = self.connect(&upstream.url, &headers).await.map_err(
                        |source| UpstreamError::Connect {
                            domain: domain.to_string(),
                            source,
                        },
                    )?;
                    let peer = client.peer().clone();
                    *guard = Some(client);
                    peer
                }
            }
        };

        let tools = match peer.list_all_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                close_discovery(&upstream).await;
                return Err(UpstreamError::Call {
                    domain: domain.to_string(),
                    source: err.into(),
                });
            }
        };

        let specs = tools.into_iter().map(tool_to_spec).collect();
        Ok(self
            .registry
            .populate_domain(domain, specs, upstream.description.clone()))
    }

    /// Open an MCP client connection to `url`, trying the streamable HTTP
    /// transport first and falling back to SSE when the upstream only
    /// speaks the older streaming variant.
    async fn connect(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<McpClient> {
        let http = build_http_client(headers, self.request_timeout)?;

        let config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
        let transport = StreamableHttpClientTransport::with_client(http.clone(), config);
        match ().serve(transport).await {
            Ok(client) => Ok(client),
            Err(streamable_err) => {
                tracing::debug!(
                    target: "toolgate::upstream",
                    url,
                    error = %streamable_err,
                    "streamable HTTP connect failed; trying SSE"
                );
                let config = SseClientConfig {
                    sse_endpoint: url.to_string().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http, config)
                    .await
                    .context("SSE transport setup failed")?;
                ().serve(transport)
                    .await
                    .context("SSE client initialization failed")
            }
        }
    }
}

async fn close_discovery(upstream: &Upstream) {
    let client = upstream.discovery.lock().await.take();
    if let Some(client) = client {
        if let Err(err) = client.cancel().await {
            tracing::debug!(
                target: "toolgate::upstream",
                error = %err,
                "discovery client teardown failed"
            );
        }
    }
}

/// Copy `headers`, dropping hop-by-hop and transport-owned entries.
fn strip_hop_by_hop(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.to_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn build_http_client(
    headers: &BTreeMap<String, String>,
    timeout: Duration,
) -> anyhow::Result<reqwest::Client> {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(target: "toolgate::upstream", header = %name, "invalid header name dropped");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(target: "toolgate::upstream", header = %name, "invalid header value dropped");
            continue;
        };
        header_map.insert(name, value);
    }
    reqwest::Client::builder()
        .default_headers(header_map)
        .timeout(timeout)
        .build()
        .context("failed to build upstream HTTP client")
}

/// Map an upstream MCP tool into registry metadata. A `group` string in the
/// tool's `_meta` map becomes the entry's group.
fn tool_to_spec(tool: Tool) -> ToolSpec {
    let group = tool
        .meta
        .as_ref()
        .and_then(|meta| meta.get("group"))
        .and_then(|value| value.as_str())
        .map(String::from);
    ToolSpec {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default(),
        group,
        input_schema: (*tool.input_schema).clone(),
        annotations: tool.annotations.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let incoming = headers(&[
            ("authorization", "Bearer u1"),
            ("host", "gateway.local"),
            ("content-length", "42"),
            ("connection", "keep-alive"),
            ("x-request-id", "abc"),
            ("mcp-session-id", "s1"),
        ]);
        let stripped = strip_hop_by_hop(&incoming);
        assert_eq!(
            stripped,
            headers(&[("authorization", "Bearer u1"), ("x-request-id", "abc")])
        );
    }

    #[test]
    fn header_merge_priority() {
        // extra > static > incoming, mirroring the execute path.
        let mut merged = strip_hop_by_hop(&headers(&[
            ("authorization", "Bearer u1"),
            ("x-shared", "incoming"),
        ]));
        merged.extend(headers(&[("x-api-key", "k"), ("x-shared", "static")]));
        merged.extend(headers(&[("x-user-token", "ut"), ("x-shared", "extra")]));

        assert_eq!(merged.get("authorization").unwrap(), "Bearer u1");
        assert_eq!(merged.get("x-api-key").unwrap(), "k");
        assert_eq!(merged.get("x-user-token").unwrap(), "ut");
        assert_eq!(merged.get("x-shared").unwrap(), "extra");
    }

    #[test]
    fn tool_meta_group_is_propagated() {
        let mut meta = rmcp::model::Meta::new();
        meta.insert("group".into(), serde_json::json!("people"));
        let tool = Tool {
            name: "people_search".into(),
            title: None,
            description: Some("Search for people".into()),
            input_schema: Arc::new(JsonMap::new()),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: Some(meta),
        };
        let spec = tool_to_spec(tool);
        assert_eq!(spec.group.as_deref(), Some("people"));
        assert_eq!(spec.name, "people_search");

        let plain = Tool {
            name: "org_search".into(),
            title: None,
            description: None,
            input_schema: Arc::new(JsonMap::new()),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        };
        assert!(tool_to_spec(plain).group.is_none());
    }

    #[tokio::test]
    async fn register_and_list_upstreams() {
        let registry = Arc::new(ToolRegistry::new());
        let manager = UpstreamManager::new(registry, BTreeMap::new(), Duration::from_secs(5));
        manager.register("sales", "http://sales:8080/mcp", None, None);
        manager.register("support", "http://support:8080/mcp", None, None);

        let upstreams = manager.list_upstreams();
        assert_eq!(upstreams.len(), 2);
        assert_eq!(upstreams["sales"], "http://sales:8080/mcp");
        assert_eq!(manager.domains(), vec!["sales", "support"]);
    }

    #[tokio::test]
    async fn remove_unknown_domain_errors() {
        let registry = Arc::new(ToolRegistry::new());
        let manager = UpstreamManager::new(registry, BTreeMap::new(), Duration::from_secs(5));
        let err = manager.remove_upstream("nonexistent").await.unwrap_err();
        assert!(matches!(err, UpstreamError::UnknownDomain(_)));
    }

    #[tokio::test]
    async fn reregistration_clears_static_headers() {
        let registry = Arc::new(ToolRegistry::new());
        let manager = UpstreamManager::new(registry, BTreeMap::new(), Duration::from_secs(5));
        manager.register(
            "sales",
            "http://sales:8080/mcp",
            None,
            Some(headers(&[("x-api-key", "k")])),
        );
        // Upsert without headers: previous headers must not survive.
        manager.register("sales", "http://sales:8080/mcp", None, None);

        let upstream = manager.upstreams.read().get("sales").cloned().unwrap();
        assert!(upstream.static_headers.is_empty());
    }
}
