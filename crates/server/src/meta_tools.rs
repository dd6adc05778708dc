//! The four meta-tools exposed to MCP clients.
//!
//! Every response is a JSON payload carried both as a text content block
//! and as `structured_content`. Errors share the envelope from
//! [`crate::errors`]; internal failures are logged in full but reach the
//! client only as a generic `execution_error`.

use crate::errors::{codes, GatewayError};
use crate::fuzzy;
use crate::gateway::Gateway;
use crate::hooks::{ExecutionContext, ExecutionDecision, Headers, ListToolsContext};
use crate::registry::{Resolution, ToolEntry};
use anyhow::Result;
use rmcp::model::{CallToolResult, Content, Tool, ToolAnnotations};
use serde_json::{json, Map as JsonMap, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Names of the tools served by the gateway itself.
pub const META_TOOL_NAMES: &[&str] = &[
    "discover_tools",
    "get_tool_schema",
    "execute_tool",
    "refresh_registry",
];

/// Helper to create an Arc-wrapped object schema.
fn schema(props: Value, required: &[&str]) -> Arc<JsonMap<String, Value>> {
    let mut map = JsonMap::new();
    map.insert("type".into(), json!("object"));
    map.insert("properties".into(), props);
    if !required.is_empty() {
        map.insert("required".into(), json!(required));
    }
    map.insert("additionalProperties".into(), json!(false));
    Arc::new(map)
}

/// The four meta-tool definitions advertised over `tools/list`.
pub fn meta_tool_defs() -> Vec<Tool> {
    vec![
        Tool {
            name: "discover_tools".into(),
            title: Some("Browse available tools".into()),
            description: Some(
                "Browse available tools by domain, group, or keyword. Call with no \
                 arguments to see all domains and their tool counts. Call with a domain \
                 to list its tools, add a group to narrow down, or pass a query to \
                 search across every domain."
                    .into(),
            ),
            input_schema: schema(
                json!({
                    "domain": {
                        "type": "string",
                        "description": "List tools in this domain only"
                    },
                    "group": {
                        "type": "string",
                        "description": "Narrow a domain listing to one group (requires domain)"
                    },
                    "query": {
                        "type": "string",
                        "description": "Keyword search across tool names and descriptions"
                    }
                }),
                &[],
            ),
            output_schema: None,
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(true),
                ..Default::default()
            }),
            icons: None,
        },
        Tool {
            name: "get_tool_schema".into(),
            title: Some("Get a tool's parameter schema".into()),
            description: Some(
                "Get the full parameter schema for a specific tool. Call this after \
                 discover_tools to see the JSON Schema describing what arguments the \
                 tool accepts, then call execute_tool."
                    .into(),
            ),
            input_schema: schema(
                json!({
                    "tool_name": {
                        "type": "string",
                        "description": "Name of the tool, as returned by discover_tools"
                    }
                }),
                &["tool_name"],
            ),
            output_schema: None,
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(true),
                ..Default::default()
            }),
            icons: None,
        },
        Tool {
            name: "execute_tool".into(),
            title: Some("Execute a discovered tool".into()),
            description: Some(
                "Execute a tool by name with the given arguments. Use discover_tools \
                 to find tools and get_tool_schema to see what arguments a tool \
                 accepts before calling this."
                    .into(),
            ),
            input_schema: schema(
                json!({
                    "tool_name": {
                        "type": "string",
                        "description": "Name of the tool to execute"
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Arguments matching the tool's schema",
                        "additionalProperties": true
                    }
                }),
                &["tool_name"],
            ),
            output_schema: None,
            annotations: Some(ToolAnnotations::default()),
            icons: None,
        },
        Tool {
            name: "refresh_registry".into(),
            title: Some("Re-discover upstream tools".into()),
            description: Some(
                "Re-query every upstream server and report which tools were added or \
                 removed. Use this when a tool you expect is missing."
                    .into(),
            ),
            input_schema: schema(json!({}), &[]),
            output_schema: None,
            annotations: Some(ToolAnnotations::default()),
            icons: None,
        },
    ]
}

/// Wrap a JSON payload as a successful tool result.
fn json_result(value: Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(value.to_string())],
        is_error: Some(false),
        structured_content: Some(value),
        meta: None,
    }
}

/// Compact tool row used by `discover_tools` listings.
fn tool_row(entry: &ToolEntry, with_domain: bool, with_group: bool) -> Value {
    let mut row = JsonMap::new();
    row.insert("name".into(), json!(entry.name));
    if with_domain {
        row.insert("domain".into(), json!(entry.domain));
    }
    if with_group {
        if let Some(group) = &entry.group {
            row.insert("group".into(), json!(group));
        }
    }
    row.insert("description".into(), json!(entry.description));
    Value::Object(row)
}

/// `discover_tools(domain?, group?, query?)`
pub async fn discover_tools(
    gateway: &Gateway,
    args: Option<&JsonMap<String, Value>>,
    headers: &Headers,
) -> Result<CallToolResult> {
    let arg = |key: &str| {
        args.and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let domain = arg("domain");
    let group = arg("group");
    let query = arg("query").filter(|q| !q.trim().is_empty());

    let user = gateway.hooks().authenticate(headers).await?;
    let registry = gateway.registry();

    // Search mode wins over domain filtering.
    if let Some(query) = query {
        let ctx = ListToolsContext {
            domain: None,
            headers: headers.clone(),
            user,
        };
        let results = gateway
            .hooks()
            .after_list_tools(&ctx, &registry.search(&query))
            .await?;
        let rows: Vec<Value> = results.iter().map(|t| tool_row(t, true, true)).collect();
        return Ok(json_result(json!({"query": query, "results": rows})));
    }

    if let Some(domain) = domain {
        let Some(tools) = registry.tools_in_domain(&domain) else {
            return Ok(GatewayError::new(
                codes::DOMAIN_NOT_FOUND,
                format!(
                    "Unknown domain '{domain}'. Available domains: {}",
                    registry.domain_names().join(", ")
                ),
            )
            .with_details(json!({"available_domains": registry.domain_names()}))
            .into_result());
        };

        let ctx = ListToolsContext {
            domain: Some(domain.clone()),
            headers: headers.clone(),
            user,
        };

        if let Some(group) = group {
            let groups = registry.groups_in_domain(&domain).unwrap_or_default();
            if !groups.iter().any(|g| g == &group) {
                return Ok(GatewayError::new(
                    codes::GROUP_NOT_FOUND,
                    format!(
                        "Unknown group '{group}' in domain '{domain}'. Available groups: {}",
                        groups.join(", ")
                    ),
                )
                .with_details(json!({"available_groups": groups}))
                .into_result());
            }
            let in_group: Vec<Arc<ToolEntry>> = tools
                .into_iter()
                .filter(|t| t.group.as_deref() == Some(group.as_str()))
                .collect();
            let visible = gateway.hooks().after_list_tools(&ctx, &in_group).await?;
            let rows: Vec<Value> = visible.iter().map(|t| tool_row(t, false, false)).collect();
            return Ok(json_result(
                json!({"domain": domain, "group": group, "tools": rows}),
            ));
        }

        let visible = gateway.hooks().after_list_tools(&ctx, &tools).await?;
        let rows: Vec<Value> = visible.iter().map(|t| tool_row(t, false, true)).collect();
        return Ok(json_result(json!({"domain": domain, "tools": rows})));
    }

    if group.is_some() {
        return Ok(GatewayError::new(
            codes::GROUP_NOT_FOUND,
            "Group filtering requires a domain. Call discover_tools with both \
             'domain' and 'group'.",
        )
        .into_result());
    }

    // No arguments: domain summary, rebuilt from the hook-filtered tool set
    // so that counts stay consistent with what the caller can see.
    let ctx = ListToolsContext {
        domain: None,
        headers: headers.clone(),
        user,
    };
    let all = registry.all_tools();
    let unfiltered_count = all.len();
    let visible = gateway.hooks().after_list_tools(&ctx, &all).await?;

    let mut by_domain: BTreeMap<&str, Vec<&Arc<ToolEntry>>> = BTreeMap::new();
    for entry in &visible {
        by_domain.entry(entry.domain.as_str()).or_default().push(entry);
    }

    let filtering_applied = visible.len() != unfiltered_count;
    let mut rows = Vec::new();
    for info in registry.list_domains() {
        let visible_tools = by_domain.get(info.name.as_str());
        if filtering_applied {
            // A domain whose every tool was hidden disappears entirely;
            // a domain that never had tools keeps its zero-count row.
            if info.tool_count > 0 && visible_tools.is_none() {
                continue;
            }
            let (count, groups) = match visible_tools {
                Some(tools) => {
                    let mut groups: Vec<String> =
                        tools.iter().filter_map(|t| t.group.clone()).collect();
                    groups.sort();
                    groups.dedup();
                    (tools.len(), groups)
                }
                None => (0, Vec::new()),
            };
            let mut row = JsonMap::new();
            row.insert("name".into(), json!(info.name));
            if let Some(description) = &info.description {
                row.insert("description".into(), json!(description));
            }
            row.insert("tool_count".into(), json!(count));
            row.insert("groups".into(), json!(groups));
            rows.push(Value::Object(row));
        } else {
            rows.push(serde_json::to_value(&info)?);
        }
    }

    Ok(json_result(
        json!({"domains": rows, "total_tools": visible.len()}),
    ))
}

/// `get_tool_schema(tool_name)`
pub async fn get_tool_schema(
    gateway: &Gateway,
    args: Option<&JsonMap<String, Value>>,
    headers: &Headers,
) -> Result<CallToolResult> {
    let tool_name = args
        .and_then(|a| a.get("tool_name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let user = gateway.hooks().authenticate(headers).await?;
    let ctx = ListToolsContext {
        domain: None,
        headers: headers.clone(),
        user,
    };

    // Fuzzy candidates are limited to what the caller may see: a tool
    // hidden by `after_list_tools` answers `tool_not_found`, never its
    // schema.
    let visible = gateway
        .hooks()
        .after_list_tools(&ctx, &gateway.registry().all_tools())
        .await?;
    let mut names: Vec<String> = visible.iter().map(|t| t.name.clone()).collect();
    names.sort();

    let entry = match gateway.registry().resolve(tool_name, &names) {
        Resolution::Exact(entry) => entry,
        Resolution::Fuzzy(entry) => {
            tracing::debug!(
                target: "toolgate::meta",
                requested = tool_name,
                resolved = %entry.name,
                "fuzzy-resolved tool name"
            );
            entry
        }
        Resolution::Miss(suggestions) => {
            return Ok(not_found_error(tool_name, suggestions).into_result());
        }
    };

    let mut payload = JsonMap::new();
    payload.insert("name".into(), json!(entry.name));
    payload.insert("domain".into(), json!(entry.domain));
    if let Some(group) = &entry.group {
        payload.insert("group".into(), json!(group));
    }
    payload.insert("description".into(), json!(entry.description));
    payload.insert("parameters".into(), Value::Object(entry.input_schema.clone()));
    Ok(json_result(Value::Object(payload)))
}

/// `execute_tool(tool_name, arguments?)`
pub async fn execute_tool(
    gateway: &Gateway,
    args: Option<&JsonMap<String, Value>>,
    headers: &Headers,
) -> Result<CallToolResult> {
    let tool_name = args
        .and_then(|a| a.get("tool_name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let arguments = args
        .and_then(|a| a.get("arguments"))
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    // Execution never fuzzy-resolves: running a near-miss tool is not safe.
    let Some(entry) = gateway.registry().get(tool_name) else {
        let suggestions = fuzzy::suggest(
            tool_name,
            &gateway.registry().all_names(),
            fuzzy::MAX_SUGGESTIONS,
        );
        return Ok(not_found_error(tool_name, suggestions).into_result());
    };

    let user = gateway.hooks().authenticate(headers).await?;
    let mut ctx = ExecutionContext::new(Arc::clone(&entry), arguments, headers.clone());
    ctx.user = user;

    if let ExecutionDecision::Deny { code, message } =
        gateway.hooks().before_execute(&mut ctx).await
    {
        tracing::debug!(
            target: "toolgate::meta",
            tool = %entry.name,
            code = %code,
            "execution denied by hook"
        );
        return Ok(GatewayError::new(code, message).into_result());
    }

    let call = gateway
        .manager()
        .execute(&entry, ctx.arguments.clone(), &ctx.headers, &ctx.extra_headers)
        .await;

    let result = match call {
        Ok(result) => result,
        Err(err) => {
            let error = anyhow::Error::new(err);
            gateway.hooks().on_error(&ctx, &error).await;
            return Ok(GatewayError::new(
                codes::UPSTREAM_ERROR,
                format!(
                    "Tool execution failed for upstream '{}': {error:#}",
                    entry.domain
                ),
            )
            .into_result());
        }
    };

    let is_error = result.is_error.unwrap_or(false);
    let payload = upstream_payload(&result);
    let transformed = match gateway.hooks().after_execute(&ctx, payload, is_error).await {
        Ok(value) => value,
        Err(err) => {
            gateway.hooks().on_error(&ctx, &err).await;
            return Err(err);
        }
    };

    if is_error {
        let message = match &transformed {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let value = json!({"tool": entry.name, "error": message, "code": codes::EXECUTION_ERROR});
        return Ok(CallToolResult {
            content: vec![Content::text(value.to_string())],
            is_error: Some(true),
            structured_content: Some(value),
            meta: None,
        });
    }

    Ok(json_result(json!({"tool": entry.name, "result": transformed})))
}

/// `refresh_registry()`
pub async fn refresh_registry(gateway: &Arc<Gateway>) -> Result<CallToolResult> {
    let (diffs, failed) = gateway.refresh().await;
    Ok(json_result(json!({"diffs": diffs, "failed": failed})))
}

/// Extract the payload from an upstream `CallToolResult`: structured
/// content when present, otherwise the first text block (parsed as JSON
/// when possible).
fn upstream_payload(result: &CallToolResult) -> Value {
    if let Some(structured) = &result.structured_content {
        return structured.clone();
    }
    let Some(text) = result.content.first().and_then(|c| c.as_text()) else {
        return Value::Null;
    };
    serde_json::from_str(&text.text).unwrap_or_else(|_| Value::String(text.text.clone()))
}

fn not_found_error(tool_name: &str, suggestions: Vec<String>) -> GatewayError {
    if suggestions.is_empty() {
        GatewayError::new(
            codes::TOOL_NOT_FOUND,
            format!("Tool '{tool_name}' not found. Use discover_tools to browse available tools."),
        )
    } else {
        GatewayError::new(
            codes::TOOL_NOT_FOUND,
            format!(
                "Tool '{tool_name}' not found. Did you mean one of: {}?",
                suggestions.join(", ")
            ),
        )
        .with_details(json!({"suggestions": suggestions}))
    }
}
