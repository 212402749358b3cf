use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Path to the configuration file. Defaults to ./coedit.conf when it
    /// exists, built-in defaults otherwise.
    #[arg(long, global = true, env = "COEDIT_CONFIG")]
    pub config: Option<PathBuf>,
    /// Log at debug level (RUST_LOG overrides this).
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the collaboration server.
    Start {
        /// Override the configured bind port.
        #[arg(long, env = "COEDIT_PORT")]
        port: Option<u16>,
    },
    /// Run the schema migrations against the configured store.
    Migrate,
    /// Check that the configured store is reachable.
    Health,
}

#[test]
fn verify() {
    use clap::CommandFactory as _;
    Cli::command().debug_assert();
}
