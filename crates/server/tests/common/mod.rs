//! Shared test harness: a minimal in-process upstream MCP server.

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::{ErrorData, ServerHandler};
use serde_json::{json, Map as JsonMap, Value};
use std::sync::Arc;

/// An upstream MCP server with a fixed tool list. Tool behavior:
///
/// - `echo_headers`: returns the HTTP headers it received.
/// - `boom`: always answers with `is_error = true`.
/// - anything else: echoes the wire tool name and arguments.
#[derive(Clone)]
pub struct MockUpstream {
    tools: Arc<Vec<Tool>>,
}

impl MockUpstream {
    pub fn new(tool_names: &[&str]) -> Self {
        let tools = tool_names
            .iter()
            .map(|name| Tool {
                name: name.to_string().into(),
                title: None,
                description: Some(format!("Mock tool {name}").into()),
                input_schema: Arc::new(
                    json!({
                        "type": "object",
                        "properties": {"name": {"type": "string"}}
                    })
                    .as_object()
                    .unwrap()
                    .clone(),
                ),
                output_schema: None,
                annotations: None,
                icons: None,
                meta: None,
            })
            .collect();
        Self {
            tools: Arc::new(tools),
        }
    }
}

impl ServerHandler for MockUpstream {
    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tools.as_ref().clone(),
            next_cursor: None,
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        Box::pin(async move {
            let payload = match request.name.as_ref() {
                "echo_headers" => {
                    let mut headers = JsonMap::new();
                    if let Some(parts) = context.extensions.get::<http::request::Parts>() {
                        for (name, value) in &parts.headers {
                            if let Ok(value) = value.to_str() {
                                headers.insert(
                                    name.as_str().to_lowercase(),
                                    Value::String(value.to_string()),
                                );
                            }
                        }
                    }
                    json!({"headers": headers})
                }
                "boom" => {
                    return Ok(CallToolResult {
                        content: vec![Content::text("Invalid parameter: limit must be > 0")],
                        is_error: Some(true),
                        structured_content: None,
                        meta: None,
                    });
                }
                other => json!({
                    "wire_name": other,
                    "args": request.arguments.clone().unwrap_or_default(),
                }),
            };
            Ok(CallToolResult {
                content: vec![Content::text(payload.to_string())],
                is_error: Some(false),
                structured_content: Some(payload),
                meta: None,
            })
        })
    }
}

/// A mock upstream served on its own single-thread runtime.
///
/// Running each upstream on a dedicated runtime makes `shutdown()` sever
/// every established connection, not just stop the accept loop, so tests
/// can simulate an upstream going down hard.
pub struct MockUpstreamServer {
    pub url: String,
    runtime: Option<tokio::runtime::Runtime>,
}

impl MockUpstreamServer {
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for MockUpstreamServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Serve `upstream` on an ephemeral port.
pub fn spawn_upstream(upstream: MockUpstream) -> MockUpstreamServer {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("build upstream runtime");
    runtime.spawn(async move {
        let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
        let service = StreamableHttpService::new(
            move || Ok(upstream.clone()),
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig::default(),
        );
        let router = axum::Router::new().nest_service("/mcp", service);
        let _ = axum::serve(listener, router).await;
    });

    MockUpstreamServer {
        url: format!("http://{addr}/mcp"),
        runtime: Some(runtime),
    }
}
