//! # discq - DVD pipeline node
//!
//! Operator and peer surface for a staged disc ripping pipeline. External
//! worker scripts image, encode, transfer and archive discs; this binary
//! inspects and repairs their shared state and moves encode jobs between
//! nodes of a cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the peer and dashboard API
//! discq serve
//!
//! # Show stage counts, locks and running workers
//! discq status
//!
//! # Cancel a queued or running item
//! discq cancel Movie-1700000000.encoding --delete-files
//!
//! # Name a disc ripped under a generic label
//! discq rename DVD_VIDEO-1700000000.image-ready "The Matrix" --year 1999
//!
//! # Hand an image to the least busy peer
//! discq offload Movie-1700000000.image-ready
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use discq::commands::{
    cancel::CancelCommand, capacity::CapacityCommand, kill::KillCommand,
    notify_origin::NotifyOriginCommand, offload::OffloadCommand, peers::PeersCommand,
    pending::PendingCommand, queue::QueueCommand, rename::RenameCommand, serve::ServeCommand,
    status::StatusCommand,
};
use discq::config::Config;
use discq::AppContext;

/// discq - staged DVD pipeline node
#[derive(Parser)]
#[command(
    name = "discq",
    about = "Inspect, repair and distribute a staged DVD ripping pipeline",
    long_about = "Reads the pipeline's state files and lock files, cancels or kills stuck work, and hands encode jobs between cluster nodes.",
    version
)]
struct Cli {
    /// Staging directory holding state files and images
    #[arg(long, global = true, env = "STAGING_DIR")]
    staging_dir: Option<PathBuf>,
    /// Directory holding worker lock files
    #[arg(long, global = true, env = "LOCK_DIR")]
    lock_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Serve the peer and dashboard HTTP API
    Serve {
        /// Address to listen on (defaults to DASHBOARD_LISTEN)
        #[arg(long, short = 'l')]
        listen: Option<String>,
    },
    /// Show stage counts, locks and running workers
    Status,
    /// List state files, newest first
    Queue {
        /// Page number, 10 items per page
        #[arg(long, short = 'p')]
        page: Option<usize>,
    },
    /// Cancel a queue item and revert its stage
    Cancel {
        /// State file name, e.g. Movie-1700000000.encoding
        state_file: String,
        /// Also delete finished images or encodes waiting in the queue
        #[arg(long)]
        delete_files: bool,
    },
    /// Kill a pipeline worker and clean up after it
    Kill {
        /// Process id of the worker
        pid: u32,
    },
    /// List items that still need a real title
    Pending,
    /// Rename an item to its real title
    Rename {
        /// State file name, e.g. DVD_VIDEO-1700000000.image-ready
        state_file: String,
        /// Movie title
        title: String,
        /// Four digit release year
        #[arg(long, short = 'y')]
        year: Option<String>,
    },
    /// Show this node's encode capacity
    Capacity,
    /// Query capacity of every configured peer
    Peers,
    /// Hand an image-ready item to a peer
    Offload {
        /// State file name of the item
        state_file: String,
        /// Peer name (defaults to the peer with most free slots)
        #[arg(long)]
        peer: Option<String>,
    },
    /// Report a received job's outcome to the node it came from
    NotifyOrigin {
        /// State file name of the received item
        state_file: String,
        /// Report a failed encode instead of success
        #[arg(long)]
        failed: bool,
        /// Encoded file on this node (defaults to the recorded mkv_path)
        #[arg(long)]
        result_path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "discq=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(staging_dir) = cli.staging_dir {
        config.staging_dir = staging_dir;
    }
    if let Some(lock_dir) = cli.lock_dir {
        config.lock_dir = lock_dir;
    }
    let ctx = Arc::new(AppContext::new(config));

    let result = match cli.command {
        Commands::Serve { listen } => {
            info!("Starting serve command, listen: {:?}", listen);
            ServeCommand::new(ctx, listen).execute().await
        }
        Commands::Status => StatusCommand::new(ctx).execute().await,
        Commands::Queue { page } => QueueCommand::new(ctx, page).execute().await,
        Commands::Cancel {
            state_file,
            delete_files,
        } => {
            info!(
                "Starting cancel command for {}, delete files: {}",
                state_file, delete_files
            );
            CancelCommand::new(ctx, state_file, delete_files)
                .execute()
                .await
        }
        Commands::Kill { pid } => {
            info!("Starting kill command for PID {}", pid);
            KillCommand::new(ctx, pid).execute().await
        }
        Commands::Pending => PendingCommand::new(ctx).execute().await,
        Commands::Rename {
            state_file,
            title,
            year,
        } => {
            info!("Starting rename command for {} to {:?}", state_file, title);
            RenameCommand::new(ctx, state_file, title, year).execute().await
        }
        Commands::Capacity => CapacityCommand::new(ctx).execute().await,
        Commands::Peers => PeersCommand::new(ctx).execute().await,
        Commands::Offload { state_file, peer } => {
            info!("Starting offload command for {}, peer: {:?}", state_file, peer);
            OffloadCommand::new(ctx, state_file, peer).execute().await
        }
        Commands::NotifyOrigin {
            state_file,
            failed,
            result_path,
        } => NotifyOriginCommand::new(ctx, state_file, !failed, result_path)
            .execute()
            .await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
