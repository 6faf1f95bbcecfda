//! edgeacl - ACL sync and firewall enforcement for edge nodes.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use edgeacl::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => edgeacl::commands::run::run(&cli.config).await,
        Commands::Check { ip } => edgeacl::commands::check::run(&ip, &cli.config).await,
        Commands::Cidr {
            from,
            to,
            max_prefix_len,
        } => edgeacl::commands::cidr::run(&from, &to, max_prefix_len),
        Commands::Version => {
            println!("edgeacl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
