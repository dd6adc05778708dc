//! Application entry point: configuration, wiring, and the serve loop.
//!
//! `run()` parses the CLI, reads the environment contract, assembles the
//! [`Gateway`](crate::gateway::Gateway), populates the registry from the
//! configured upstreams, and serves HTTP until shutdown. The background
//! refresh loop (when enabled) is cancelled and awaited before the process
//! exits, so a mid-flight refresh can never leave a domain half-updated.

use crate::cli::{Cli, Commands};
use crate::config::GatewayConfig;
use crate::gateway::{Gateway, GatewayOptions, Lifecycle};
use crate::hooks::{self, GatewayHook};
use crate::http_transport;
use anyhow::{bail, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// Registration tokens shorter than this trigger a startup warning.
const MIN_TOKEN_LENGTH: usize = 16;

/// The main entry point for the `toolgate` gateway.
pub fn run() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let (host, port) = match cli.command {
        Some(Commands::Serve { host, port }) => (host, port),
        None => (None, None),
    };

    let mut config = GatewayConfig::from_env()?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let hooks = load_hooks(&config)?;

    let rt = Runtime::new()?;
    rt.block_on(serve(config, hooks))
}

/// Resolve the configured hook factory, if any.
fn load_hooks(config: &GatewayConfig) -> Result<Vec<Arc<dyn GatewayHook>>> {
    let Some(name) = &config.hook_module else {
        return Ok(Vec::new());
    };
    let Some(factory) = hooks::hook_factory(name) else {
        bail!(
            "GATEWAY_HOOK_MODULE names unknown hook factory '{name}'; \
             register it with toolgate_server::hooks::register_hook_factory"
        );
    };
    let hooks = factory();
    tracing::info!(
        target: "toolgate::app",
        factory = %name,
        hooks = hooks.len(),
        "loaded hook factory"
    );
    Ok(hooks)
}

/// Build the gateway from configuration and serve it until shutdown.
async fn serve(config: GatewayConfig, hooks: Vec<Arc<dyn GatewayHook>>) -> Result<()> {
    if let Some(token) = &config.registration_token {
        if token.len() < MIN_TOKEN_LENGTH {
            tracing::warn!(
                target: "toolgate::app",
                "GATEWAY_REGISTRATION_TOKEN is shorter than {MIN_TOKEN_LENGTH} characters; \
                 use a high-entropy token"
            );
        }
    }

    let gateway = Gateway::new(
        GatewayOptions {
            name: config.name.clone(),
            instructions: config.instructions.clone(),
            registry_auth_headers: config.registry_auth_headers(),
            upstream_timeout: config.upstream_timeout,
        },
        hooks,
    );

    for (domain, url) in &config.upstreams {
        gateway.manager().register(
            domain,
            url,
            config.domain_descriptions.get(domain).cloned(),
            config.upstream_headers.get(domain).cloned(),
        );
    }

    let (diffs, failed) = gateway.populate().await;
    let total: usize = diffs.iter().map(|d| d.tool_count).sum();
    tracing::info!(
        target: "toolgate::app",
        tools = total,
        domains = diffs.len(),
        failed = failed.len(),
        "registry populated"
    );

    let shutdown = CancellationToken::new();
    let refresh_handle = config.refresh_interval.map(|interval| {
        tracing::info!(
            target: "toolgate::app",
            interval_secs = interval.as_secs(),
            "background refresh enabled"
        );
        tokio::spawn(Arc::clone(&gateway).refresh_loop(interval, shutdown.clone()))
    });

    let router = http_transport::build_router(
        Arc::clone(&gateway),
        config.registration_token.clone(),
        &config.cors_origins,
    );

    gateway.set_lifecycle(Lifecycle::Running);
    let serve_result = http_transport::serve(router, &config.bind_addr(), async {
        shutdown_signal().await;
    })
    .await;

    // Shutdown sequence: stop the refresh loop, then tear down discovery
    // connections.
    shutdown.cancel();
    if let Some(handle) = refresh_handle {
        let _ = handle.await;
    }
    gateway.manager().close_all().await;
    gateway.set_lifecycle(Lifecycle::Stopped);
    tracing::info!(target: "toolgate::app", "gateway stopped");

    serve_result
}

/// Resolves on SIGINT (ctrl-c) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return ctrl_c.await,
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
