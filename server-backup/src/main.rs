//! Server Backup - Main entry point
//!
//! Backs up every configured server once and exits.

use anyhow::Result;
use clap::{Parser, Subcommand};
use server_backup::remote::ssh::SshConnector;
use server_backup::sync::s3::S3Connector;
use server_backup::{config, utils, Config, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/servers.toml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Mirror every backup log line to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Skip object-store retention and sync
    #[arg(long, global = true)]
    no_sync: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every configured server (default)
    Run,

    /// Write a commented sample configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A local .env may carry RUST_LOG and AWS_* settings
    dotenvy::dotenv().ok();

    let mut args = Args::parse();

    match args.command.take().unwrap_or(Command::Run) {
        Command::InitConfig { force } => {
            utils::logger::init(args.log_level.as_deref().unwrap_or("info"))?;
            config::write_sample(&args.config, force)?;
            tracing::info!("Wrote sample configuration to {}", args.config.display());
            Ok(())
        }
        Command::Run => run(args).await,
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::from_file(&args.config)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;
    config.verbose |= args.verbose;

    tracing::info!(
        "Starting server-backup v{} ({} servers, config {})",
        env!("CARGO_PKG_VERSION"),
        config.servers.len(),
        args.config.display()
    );

    let mut orchestrator = Orchestrator::new(config, Arc::new(SshConnector));
    if args.no_sync {
        tracing::info!("Object-store sync disabled");
    } else {
        orchestrator = orchestrator.with_store_connector(Arc::new(S3Connector));
    }

    let report = orchestrator.run().await?;

    for server in &report.servers {
        match &server.error {
            Some(e) => tracing::error!(server = %server.name, "Unreachable: {}", e),
            None => tracing::info!(
                server = %server.name,
                projects = server.projects.len(),
                failed = server.failed_projects(),
                uploaded = server.sync.as_ref().map_or(0, |s| s.uploaded),
                "Server done"
            ),
        }
        for project in server.projects.iter().filter(|p| p.failed()) {
            tracing::warn!(
                server = %server.name,
                project = %project.path,
                "archive {}, database {}",
                project.archive,
                project.database
            );
        }
    }

    tracing::info!("Run log written to {}", report.log_file.display());
    Ok(())
}
