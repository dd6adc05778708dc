//! HTTP surface of the gateway.
//!
//! One axum router carries everything: the MCP service (Streamable HTTP)
//! nested at `/mcp`, the `/healthz` and `/readyz` probes, and (only when a
//! registration token is configured) the dynamic registration REST API
//! under `/registry/servers` behind constant-time bearer auth.

use crate::gateway::Gateway;
use crate::handler::GatewayService;
use crate::registration;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::Json;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};

/// Bearer token authentication middleware for the registration API.
///
/// Uses constant-time comparison to prevent timing attacks on the token.
async fn auth_middleware(
    expected_token: Arc<String>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    if let Some(auth_header) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                let provided = token.as_bytes();
                let expected = expected_token.as_bytes();
                if provided.len() == expected.len() && provided.ct_eq(expected).into() {
                    return next.run(req).await;
                }
            }
        }
    }
    tracing::debug!(
        target: "toolgate::http::auth",
        uri = %req.uri().path(),
        "registration auth failed"
    );
    // Generic message to avoid information leakage.
    (
        StatusCode::UNAUTHORIZED,
        "Invalid or missing authorization token",
    )
        .into_response()
}

/// Builds the CORS layer from allowed origins.
///
/// Invalid origins are logged as warnings and skipped; an empty list
/// disables CORS entirely (server-to-server only).
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
    } else if origins.iter().any(|o| o == "*") {
        tracing::warn!(
            target: "toolgate::http::cors",
            "Using wildcard CORS ('*'). Auth headers forwarded by browsers may \
             be exposed to malicious sites; prefer explicit origins."
        );
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    } else {
        let mut valid_origins = Vec::with_capacity(origins.len());
        for origin in origins {
            match origin.parse::<HeaderValue>() {
                Ok(value) => valid_origins.push(value),
                Err(error) => {
                    tracing::warn!(
                        target: "toolgate::http::cors",
                        origin,
                        error = %error,
                        "Failed to parse CORS origin - it will be ignored"
                    );
                }
            }
        }
        CorsLayer::new()
            .allow_origin(valid_origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    }
}

/// Liveness probe: the process is up.
async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Readiness probe: 200 once at least one domain population succeeded.
async fn readyz(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let tools = gateway.registry().tool_count();
    if gateway.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready", "tools": tools})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "tools": tools})),
        )
    }
}

/// Assemble the full gateway router.
pub fn build_router(
    gateway: Arc<Gateway>,
    registration_token: Option<String>,
    cors_origins: &[String],
) -> axum::Router {
    let mut router = axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));

    if let Some(token) = registration_token {
        let token = Arc::new(token);
        let protected = axum::Router::new()
            .route(
                "/registry/servers",
                get(registration::list_servers).post(registration::register_server),
            )
            .route(
                "/registry/servers/{domain}",
                delete(registration::deregister_server),
            )
            .layer(axum::middleware::from_fn(move |req, next| {
                let token = token.clone();
                auth_middleware(token, req, next)
            }));
        router = router.merge(protected);
    }

    let session_manager = Arc::new(LocalSessionManager::default());
    let mcp_gateway = Arc::clone(&gateway);
    let mcp_service = StreamableHttpService::new(
        move || Ok(GatewayService::new(Arc::clone(&mcp_gateway))),
        session_manager,
        StreamableHttpServerConfig::default(),
    );

    router
        .with_state(gateway)
        .nest_service("/mcp", mcp_service)
        .layer(build_cors_layer(cors_origins))
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    router: axum::Router,
    bind_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid bind address: {bind_addr}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    tracing::info!(
        target: "toolgate::http",
        bind = %addr,
        "gateway HTTP server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayOptions, Lifecycle};
    use crate::registry::ToolSpec;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_gateway() -> Arc<Gateway> {
        Gateway::new(GatewayOptions::default(), Vec::new())
    }

    #[test]
    fn parse_valid_bind_address() {
        let addr: Result<SocketAddr, _> = "127.0.0.1:3000".parse();
        assert!(addr.is_ok());
    }

    #[test]
    fn parse_invalid_bind_address() {
        let addr: Result<SocketAddr, _> = "not-an-address".parse();
        assert!(addr.is_err());
    }

    #[test]
    fn cors_layer_builds_for_all_variants() {
        let _ = build_cors_layer(&[]);
        let _ = build_cors_layer(&["*".to_string()]);
        let _ = build_cors_layer(&[
            "http://localhost:3000".to_string(),
            "not a valid origin\u{7f}".to_string(),
        ]);
    }

    #[tokio::test]
    async fn healthz_always_ok() {
        let router = build_router(test_gateway(), None, &[]);
        let response = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_tracks_population() {
        let gateway = test_gateway();
        let router = build_router(Arc::clone(&gateway), None, &[]);

        let response = router
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        gateway
            .registry()
            .populate_domain("svc", vec![ToolSpec::new("svc_ping", "Ping")], None);
        gateway.set_lifecycle(Lifecycle::Populated);

        let response = router
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn registration_routes_absent_without_token() {
        let router = build_router(test_gateway(), None, &[]);
        let response = router
            .oneshot(
                Request::get("/registry/servers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registration_requires_bearer_token() {
        let router = build_router(test_gateway(), Some("secret-token".into()), &[]);

        let response = router
            .clone()
            .oneshot(
                Request::get("/registry/servers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .clone()
            .oneshot(
                Request::get("/registry/servers")
                    .header("Authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::get("/registry/servers")
                    .header("Authorization", "Bearer secret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
