use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use catalog_feeds::FixtureFeed;
use catalog_sync::{export_item_tree, SnapshotFile, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "catalog")]
#[command(about = "Item catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync {
        /// Read feed payloads from a fixture directory instead of the network.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Create the item tables if they are missing.
    Migrate,
    /// Check that the configured store answers queries.
    Check,
    /// Write the category/group/item tree built from the snapshot file.
    ExportTree {
        #[arg(long, default_value = "item_data.json")]
        out: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("invalid configuration")?;

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures } => {
            let mut pipeline = SyncPipeline::new(config).await?;
            if let Some(dir) = fixtures {
                let feed = FixtureFeed::from_dir(&dir)
                    .with_context(|| format!("loading fixtures from {}", dir.display()))?;
                pipeline = pipeline.with_feed(Arc::new(feed));
            }
            let summary = pipeline.run_once().await?;
            for line in summary.render_lines() {
                println!("{line}");
            }
            println!("reports: {}", summary.reports_dir);
        }
        Commands::Migrate => {
            let pipeline = SyncPipeline::new(config).await?;
            pipeline.migrate().await?;
            println!("schema ready on {}", pipeline.store().backend());
        }
        Commands::Check => {
            let pipeline = SyncPipeline::new(config).await?;
            pipeline.check().await?;
            println!("{} reachable", pipeline.store().backend());
        }
        Commands::ExportTree { out } => {
            let snapshot = SnapshotFile::new(config.snapshot_path.clone());
            let exported = export_item_tree(&snapshot, &out).await?;
            tracing::info!(items = exported, out = %out.display(), "item tree exported");
            println!("exported {exported} items to {}", out.display());
        }
    }

    Ok(())
}
