//! MCP `ServerHandler` implementation for the gateway.
//!
//! The handler advertises exactly the four meta-tools and dispatches
//! `tools/call` to [`crate::meta_tools`]. Incoming HTTP headers are lifted
//! out of the request extensions (the streamable HTTP transport stores the
//! request parts there) and passed down explicitly; nothing reads ambient
//! state.

use crate::errors::{codes, GatewayError};
use crate::gateway::Gateway;
use crate::hooks::Headers;
use crate::meta_tools;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Implementation, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, ToolsCapability,
};
use rmcp::service::{NotificationContext, Peer, RequestContext, RoleServer};
use rmcp::{ErrorData, ServerHandler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Connected server-side peers, for `notifications/tools/list_changed`
/// broadcasts. Peers that fail to receive a notification are dropped.
#[derive(Default)]
pub struct PeerHub {
    peers: parking_lot::Mutex<HashMap<u64, Peer<RoleServer>>>,
    next_id: AtomicU64,
}

impl PeerHub {
    pub fn register(&self, peer: Peer<RoleServer>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().insert(id, peer);
    }

    pub fn connected(&self) -> usize {
        self.peers.lock().len()
    }

    /// Broadcast `notifications/tools/list_changed` to every connected
    /// client session.
    pub async fn notify_tools_changed(&self) {
        let snapshot: Vec<(u64, Peer<RoleServer>)> = self
            .peers
            .lock()
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect();
        let mut dead = Vec::new();
        for (id, peer) in snapshot {
            if peer.notify_tool_list_changed().await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.lock();
            for id in dead {
                peers.remove(&id);
            }
        }
    }
}

/// Per-session MCP service; cheap to clone, all state lives in the shared
/// [`Gateway`].
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

/// Lift the incoming HTTP headers out of the request extensions.
///
/// The streamable HTTP server transport stores the request's
/// `http::request::Parts` in the extensions; transports without an HTTP
/// layer (e.g. in-process test clients) simply yield an empty map.
pub fn headers_from_extensions(extensions: &rmcp::model::Extensions) -> Headers {
    let mut headers = Headers::new();
    if let Some(parts) = extensions.get::<http::request::Parts>() {
        for (name, value) in &parts.headers {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), value.to_string());
            }
        }
    }
    headers
}

impl ServerHandler for GatewayService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: self.gateway.name().to_owned().into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            instructions: Some(self.gateway.instructions()),
            ..Default::default()
        }
    }

    fn on_initialized(
        &self,
        context: NotificationContext<RoleServer>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.gateway.peers().register(context.peer.clone());
        std::future::ready(())
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: meta_tools::meta_tool_defs(),
            next_cursor: None,
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        Box::pin(async move {
            let headers = headers_from_extensions(&context.extensions);
            let args = request.arguments.as_ref();

            let result = match request.name.as_ref() {
                "discover_tools" => {
                    meta_tools::discover_tools(&self.gateway, args, &headers).await
                }
                "get_tool_schema" => {
                    meta_tools::get_tool_schema(&self.gateway, args, &headers).await
                }
                "execute_tool" => meta_tools::execute_tool(&self.gateway, args, &headers).await,
                "refresh_registry" => meta_tools::refresh_registry(&self.gateway).await,
                other => {
                    return Err(ErrorData::invalid_params(
                        format!("unknown tool: {other}"),
                        None,
                    ));
                }
            };

            // Internal failures never cross the boundary unshaped: log the
            // full chain, answer with the generic envelope.
            Ok(result.unwrap_or_else(|err| {
                tracing::error!(
                    target: "toolgate::meta",
                    tool = %request.name,
                    error = %format!("{err:#}"),
                    "meta-tool failed internally"
                );
                let code = if request.name.as_ref() == "refresh_registry" {
                    codes::REFRESH_ERROR
                } else {
                    codes::EXECUTION_ERROR
                };
                GatewayError::new(code, "Internal error during tool execution").into_result()
            }))
        })
    }
}
