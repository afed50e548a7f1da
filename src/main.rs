//! blockctl - coordinated firewall rule commits for Linux gateways

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use blockctl::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    // Logs go to stderr, stdout carries `state` snapshots
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => blockctl::commands::run::run(&cli.config).await,
        Commands::Validate => blockctl::commands::validate::run(&cli.config),
        Commands::Version => {
            println!("blockctl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
