use anyhow::Result;
use clap::Parser;

use chainctl::cli::{Cli, Commands};
use chainctl::commands;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan(args) => commands::plan(&args),
        Commands::Probe(args) => commands::probe(&args).await,
        Commands::Check(args) => commands::check(&args).await,
        Commands::Deploy(args) => commands::deploy(&args).await,
    }
}
