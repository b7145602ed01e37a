use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pcitrack_core::Config;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "pcitrack")]
#[command(about = "PCI device tracker", long_about = None)]
struct Cli {
    /// Database file (overrides the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the devices of a compute node
    List {
        /// Compute node id (defaults to the configured node)
        #[arg(short, long)]
        node: Option<i64>,

        /// Only show devices in this status (e.g., "available", "allocated")
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one device with its PF/VF relations
    Show {
        /// PCI address (e.g., "0000:01:00.1")
        address: String,

        /// Compute node id (defaults to the configured node)
        #[arg(short, long)]
        node: Option<i64>,
    },

    /// List the devices owned by an instance
    Instance {
        /// Instance uuid
        uuid: String,
    },

    /// Assign uuids to device rows that predate them
    BackfillUuids {
        /// Maximum number of rows to handle (defaults to the configured batch)
        #[arg(short, long)]
        max_count: Option<usize>,
    },

    /// Remove an unused device and delete it from the database
    Remove {
        /// PCI address
        address: String,

        /// Compute node id (defaults to the configured node)
        #[arg(short, long)]
        node: Option<i64>,
    },

    /// Release a claimed or allocated device
    Free {
        /// PCI address
        address: String,

        /// Compute node id (defaults to the configured node)
        #[arg(short, long)]
        node: Option<i64>,

        /// Only free the device if this instance owns it
        #[arg(short, long)]
        instance: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db.to_string_lossy().to_string();
    }
    pcitrack_core::init_observability(&config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let ctx = commands::Context::open(config).await?;

    match cli.command {
        Commands::List { node, status } => {
            commands::list(&ctx, node, status.as_deref()).await?;
        }

        Commands::Show { address, node } => {
            commands::show(&ctx, node, &address).await?;
        }

        Commands::Instance { uuid } => {
            commands::instance(&ctx, &uuid).await?;
        }

        Commands::BackfillUuids { max_count } => {
            commands::backfill_uuids(&ctx, max_count).await?;
        }

        Commands::Remove { address, node } => {
            commands::remove(&ctx, node, &address).await?;
        }

        Commands::Free { address, node, instance } => {
            commands::free(&ctx, node, &address, instance.as_deref()).await?;
        }
    }

    Ok(())
}
