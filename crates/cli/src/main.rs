//! Command-line interface for the `toolgate` gateway.
//!
//! This crate serves as the main entry point for the executable, delegating
//! its core functionality to the `toolgate-server` crate.

fn main() -> anyhow::Result<()> {
    toolgate_server::run()
}
