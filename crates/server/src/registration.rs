//! Dynamic upstream registration REST API.
//!
//! Mounted only when `GATEWAY_REGISTRATION_TOKEN` is configured; every
//! request passes the bearer-auth middleware in
//! [`crate::http_transport`] first.
//!
//! - `GET /registry/servers`: snapshot of registered upstreams with tool
//!   counts.
//! - `POST /registry/servers`: upsert an upstream (`{domain, url,
//!   description?, headers?}`) and populate it.
//! - `DELETE /registry/servers/{domain}`: remove an upstream and its
//!   tools.

use crate::errors::UpstreamError;
use crate::gateway::Gateway;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
        .into_response()
}

/// `GET /registry/servers`
///
/// Tool counts come from a single registry snapshot so concurrent
/// mutation cannot produce torn reads.
pub async fn list_servers(State(gateway): State<Arc<Gateway>>) -> Response {
    let urls = gateway.manager().list_upstreams();
    let counts: BTreeMap<String, usize> = gateway
        .registry()
        .list_domains()
        .into_iter()
        .map(|d| (d.name.clone(), d.tool_count))
        .collect();

    let servers: Vec<Value> = urls
        .iter()
        .map(|(domain, url)| {
            json!({
                "domain": domain,
                "url": url,
                "tool_count": counts.get(domain).copied().unwrap_or(0),
            })
        })
        .collect();
    Json(json!({"servers": servers})).into_response()
}

/// `POST /registry/servers`
pub async fn register_server(
    State(gateway): State<Arc<Gateway>>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return bad_request("request body must be a JSON object");
    };
    let Some(body) = body.as_object() else {
        return bad_request("request body must be a JSON object");
    };

    let Some(domain) = body.get("domain").and_then(|v| v.as_str()) else {
        return bad_request("'domain' is required and must be a string");
    };
    if domain.is_empty() {
        return bad_request("'domain' must not be empty");
    }
    let Some(url) = body.get("url").and_then(|v| v.as_str()) else {
        return bad_request("'url' is required and must be a string");
    };
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => {
            return bad_request(format!(
                "unsupported URL scheme '{}' (expected http or https)",
                parsed.scheme()
            ));
        }
        Err(error) => return bad_request(format!("invalid URL: {error}")),
    }

    let description = match body.get("description") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return bad_request("'description' must be a string"),
    };

    let headers = match body.get("headers") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => {
            let mut headers = BTreeMap::new();
            for (name, value) in map {
                let Some(value) = value.as_str() else {
                    return bad_request("'headers' must map strings to strings");
                };
                headers.insert(name.clone(), value.to_string());
            }
            Some(headers)
        }
        Some(_) => return bad_request("'headers' must be an object"),
    };

    match gateway.add_domain(domain, url, description, headers).await {
        Ok(diff) => (
            StatusCode::CREATED,
            Json(json!({
                "domain": domain,
                "tool_count": diff.tool_count,
                "added": diff.added,
                "removed": diff.removed,
            })),
        )
            .into_response(),
        // The upstream is registered even when the initial population
        // fails; the next refresh retries.
        Err(error) => {
            tracing::warn!(
                target: "toolgate::registration",
                domain,
                error = %error,
                "registered upstream could not be populated"
            );
            (
                StatusCode::CREATED,
                Json(json!({
                    "domain": domain,
                    "tool_count": 0,
                    "populate_error": error.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// `DELETE /registry/servers/{domain}`
pub async fn deregister_server(
    State(gateway): State<Arc<Gateway>>,
    Path(domain): Path<String>,
) -> Response {
    match gateway.remove_domain(&domain).await {
        Ok(removed) => Json(json!({"domain": domain, "removed": removed})).into_response(),
        Err(UpstreamError::UnknownDomain(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("'{domain}' is not a registered upstream")})),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(
                target: "toolgate::registration",
                domain,
                error = %error,
                "failed to deregister upstream"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
