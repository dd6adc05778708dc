use clap::{Parser, Subcommand};

/// Command-line interface for the `toolgate` gateway.
#[derive(Debug, Parser)]
#[command(
    name = "toolgate",
    about = "Progressive tool-discovery gateway for MCP"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available `toolgate` commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Runs the gateway HTTP server (the default when no command is given).
    Serve {
        /// Bind address (overrides `GATEWAY_HOST`).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides `GATEWAY_PORT`).
        #[arg(long)]
        port: Option<u16>,
    },
}
