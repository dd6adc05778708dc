//! Public entry point for the `toolgate-server` crate.
//!
//! toolgate is a progressive tool-discovery gateway for MCP: it aggregates
//! tools from multiple upstream MCP servers into an in-memory registry and
//! exposes exactly four meta-tools (`discover_tools`, `get_tool_schema`,
//! `execute_tool`, `refresh_registry`) to clients, routing each execution
//! to the right upstream with the caller's headers attached.
//!
//! Modules:
//!
//! - `registry`: in-memory tool index with collision resolution and search.
//! - `upstream`: upstream connections (persistent discovery, one-shot execution).
//! - `hooks`: user-supplied lifecycle callbacks around listing and execution.
//! - `meta_tools`: the four LLM-facing operations.
//! - `gateway` / `handler`: wiring and the MCP server handler.
//! - `http_transport` / `registration`: the HTTP surface.

mod app;
mod fuzzy;
#[cfg(test)]
mod test_support;

/// Command-line interface for the gateway.
pub mod cli;
/// Environment-variable configuration.
pub mod config;
/// Structured error envelopes and codes.
pub mod errors;
/// Gateway assembly, lifecycle, and background refresh.
pub mod gateway;
/// MCP server handler.
pub mod handler;
/// Lifecycle hooks and the hook-factory registry.
pub mod hooks;
/// HTTP router and server.
pub mod http_transport;
/// The four LLM-facing meta-tools.
pub mod meta_tools;
/// Dynamic upstream registration REST API.
pub mod registration;
/// In-memory tool registry.
pub mod registry;
/// Upstream connection management.
pub mod upstream;

pub use app::run;
