//! CLI tool for skein sessions.
//!
//! Provides commands for:
//! - config: Print the effective session configuration
//! - loopback: Drive two in-process sessions and report statistics

mod commands;

use clap::{Parser, Subcommand};
use commands::{config, loopback};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "CLI tool for skein multiplexed sessions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print and validate session configuration
    Config(config::ConfigArgs),
    /// Run an in-process upload over a pipe
    Loopback(loopback::LoopbackArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config(args) => config::run(args),
        Commands::Loopback(args) => loopback::run(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(match e.downcast_ref::<skein_core::SkeinError>() {
            Some(skein_core::SkeinError::Config(_)) => 2,
            Some(_) => 3,
            None => 1,
        });
    }
}
