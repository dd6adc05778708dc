//! Integration tests for the dynamic registration REST API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{spawn_upstream, MockUpstream};
use serde_json::{json, Value};
use std::sync::Arc;
use toolgate_server::gateway::{Gateway, GatewayOptions};
use toolgate_server::http_transport::build_router;
use tower::ServiceExt;

const TOKEN: &str = "test-secret-registration-token";

fn router(gateway: Arc<Gateway>) -> axum::Router {
    build_router(gateway, Some(TOKEN.to_string()), &[])
}

fn post_json(body: Value) -> Request<Body> {
    Request::post("/registry/servers")
        .header("Authorization", format!("Bearer {TOKEN}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn register_list_and_deregister() {
    let server = spawn_upstream(MockUpstream::new(&["tickets_list"]));
    let url = server.url.clone();
    let gateway = Gateway::new(GatewayOptions::default(), Vec::new());
    let app = router(Arc::clone(&gateway));

    // Register.
    let response = app
        .clone()
        .oneshot(post_json(json!({
            "domain": "support",
            "url": url,
            "description": "Support ticketing",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["domain"], "support");
    assert_eq!(body["tool_count"], 1);
    assert_eq!(body["added"], json!(["tickets_list"]));

    // List shows the new upstream with its tool count.
    let response = app
        .clone()
        .oneshot(
            Request::get("/registry/servers")
                .header("Authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let servers = body["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["domain"], "support");
    assert_eq!(servers[0]["tool_count"], 1);

    // Deregister.
    let response = app
        .clone()
        .oneshot(
            Request::delete("/registry/servers/support")
                .header("Authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["removed"], json!(["tickets_list"]));
    assert_eq!(gateway.registry().tool_count(), 0);

    // A second delete is a 404.
    let response = app
        .oneshot(
            Request::delete("/registry/servers/support")
                .header("Authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_validates_request_shape() {
    let gateway = Gateway::new(GatewayOptions::default(), Vec::new());
    let app = router(gateway);

    // Missing domain.
    let response = app
        .clone()
        .oneshot(post_json(json!({"url": "http://svc:8080/mcp"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Missing URL.
    let response = app
        .clone()
        .oneshot(post_json(json!({"domain": "svc"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unsupported scheme.
    let response = app
        .clone()
        .oneshot(post_json(
            json!({"domain": "svc", "url": "ftp://svc:8080/mcp"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("scheme"));

    // Headers must be a string -> string map.
    let response = app
        .clone()
        .oneshot(post_json(json!({
            "domain": "svc",
            "url": "http://svc:8080/mcp",
            "headers": {"X-Count": 42},
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Body must be JSON at all.
    let response = app
        .oneshot(
            Request::post("/registry/servers")
                .header("Authorization", format!("Bearer {TOKEN}"))
                .header("Content-Type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn register_unreachable_upstream_reports_populate_error() {
    let gateway = Gateway::new(GatewayOptions::default(), Vec::new());
    let app = router(Arc::clone(&gateway));

    let response = app
        .clone()
        .oneshot(post_json(json!({
            "domain": "ghost",
            "url": "http://127.0.0.1:9/mcp",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["tool_count"], 0);
    assert!(body.get("populate_error").is_some());

    // The upstream is registered regardless; the next refresh will retry.
    assert!(gateway.manager().has_domain("ghost"));
    let response = app
        .oneshot(
            Request::get("/registry/servers")
                .header("Authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["servers"][0]["domain"], "ghost");
    assert_eq!(body["servers"][0]["tool_count"], 0);
}
