//! rdcsync: peer-to-peer file replication with remote differential
//! compression.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use rdcsync::config::CONFIG_FILE;
use rdcsync::conflict::ConflictResolutionStrategy;
use rdcsync::wire::{self, RemoteDestination, TcpConnector, TcpResolver};
use rdcsync::{Config, Metadata, SyncDestination, SyncServer};

#[derive(Parser)]
#[command(name = "rdcsync")]
#[command(version)]
#[command(about = "Replicate files between peer servers with conflict detection")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "RDCSYNC_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Server to talk to (defaults to server.url from the configuration)
    #[arg(short, long, global = true, env = "RDCSYNC_SERVER")]
    server: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server until interrupted
    Serve,

    /// Store a local file on the server
    Upload {
        /// Name of the file on the server
        file: String,

        /// Local path to read
        path: PathBuf,
    },

    /// Push one file to a destination server
    Push {
        file: String,

        /// Destination server URL (host:port)
        destination: String,
    },

    /// Push every unsynchronized change to a destination server
    SyncAll { destination: String },

    /// Resolve a conflict on the server
    Resolve {
        file: String,

        #[arg(value_enum)]
        keep: Keep,
    },

    /// Show files, jobs and conflicts of the server
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Keep {
    /// Keep the version this server has
    Current,
    /// Accept the version the conflict came from
    Remote,
}

impl From<Keep> for ConflictResolutionStrategy {
    fn from(keep: Keep) -> Self {
        match keep {
            Keep::Current => ConflictResolutionStrategy::CurrentVersion,
            Keep::Remote => ConflictResolutionStrategy::RemoteVersion,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "rdcsync=debug" } else { "rdcsync=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let url = cli.server.unwrap_or_else(|| config.server.url.clone());
    let compression = config.synchronization.compression;
    let remote = || {
        RemoteDestination::new(url.as_str(), Arc::new(TcpConnector)).with_compression(compression)
    };

    match cli.command {
        Commands::Serve => serve_command(config).await?,
        Commands::Upload { file, path } => {
            let content = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let etag = remote().upload(&file, Metadata::new(), content).await?;
            println!("{} stored on {} as {}", file, url, etag);
        }
        Commands::Push { file, destination } => {
            print_json(&remote().push(&file, &destination).await?)?;
        }
        Commands::SyncAll { destination } => {
            print_json(&remote().synchronize_destination(&destination).await?)?;
        }
        Commands::Resolve { file, keep } => {
            remote().resolve_conflict(&file, keep.into()).await?;
            println!("Conflict on {} resolved", file);
        }
        Commands::Status => {
            print_json(&remote().status().await?)?;
        }
    }

    Ok(())
}

async fn serve_command(config: Config) -> Result<()> {
    let address = config.listen_address().to_string();
    let resolver = Arc::new(
        TcpResolver::new(Arc::new(TcpConnector), config.server.url.as_str())
            .with_compression(config.synchronization.compression),
    );
    let server = Arc::new(SyncServer::open(config, resolver)?);

    tokio::select! {
        result = wire::listen(server, &address) => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
