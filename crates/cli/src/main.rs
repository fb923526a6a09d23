//! Operator CLI for bitstream asset stores.

mod config;

use anyhow::{Context, Result};
use bitstore_core::SYNCHRONIZED_STORE_NUMBER;
use bitstore_core::config::AppConfig;
use bitstore_metadata::{BitstreamRepo, CheckResult};
use bitstore_service::{BitstreamStorageService, build_service, build_sync_service};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bitstorectl")]
#[command(about = "Operator tooling for bitstream asset stores")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "BITSTORE_CONFIG",
        default_value = "config/bitstore.toml"
    )]
    config: String,

    /// Log per-record detail and skip records that fail instead of aborting
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move live bitstreams from one store to another
    Migrate(MigrateArgs),
    /// Reclaim storage held by deleted bitstreams
    Cleanup(CleanupArgs),
    /// Copy primary store bitstreams into the secondary store of the sync pair
    Synchronize {
        /// Rows per commit (default: migration.batch_size)
        #[arg(short = 'p', long)]
        batch_size: Option<u32>,
    },
    /// Recompute checksums and record the results
    Verify(VerifyArgs),
    /// List configured stores and the live bitstreams they hold
    Stores,
}

#[derive(Args)]
struct MigrateArgs {
    /// Source store number
    #[arg(short = 'a', long)]
    source: i32,

    /// Destination store number
    #[arg(short = 'b', long)]
    destination: i32,

    /// Remove the source copy once the move has committed
    #[arg(short = 'd', long)]
    delete_old: bool,

    /// Rows per commit (default: migration.batch_size)
    #[arg(short = 'p', long)]
    batch_size: Option<u32>,
}

#[derive(Args)]
struct CleanupArgs {
    /// Keep deleted rows in the database and remove only their bytes
    #[arg(short, long)]
    leave_db_records: bool,
}

#[derive(Args)]
struct VerifyArgs {
    /// Verify every live bitstream held by this store number
    #[arg(short, long, conflicts_with = "ids")]
    store: Option<i32>,

    /// Bitstream ids to verify
    ids: Vec<Uuid>,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(&cli.config)?;
    let verbose = cli.verbose;

    match cli.command {
        Commands::Migrate(args) => {
            let service = start(&config).await?;
            let batch_size = args
                .batch_size
                .unwrap_or(service.migration_config().batch_size);
            let stats = service
                .migrate(
                    args.source,
                    args.destination,
                    args.delete_old,
                    batch_size,
                    verbose,
                )
                .await
                .with_context(|| {
                    format!(
                        "migration from store {} to store {} failed",
                        args.source, args.destination
                    )
                })?;
            print_json(&stats)
        }
        Commands::Cleanup(args) => {
            let service = start(&config).await?;
            let stats = service
                .cleanup(!args.leave_db_records, verbose)
                .await
                .context("cleanup failed")?;
            print_json(&stats)
        }
        Commands::Synchronize { batch_size } => {
            let service = build_sync_service(&config)
                .await
                .context("failed to start storage service")?;
            let batch_size = batch_size.unwrap_or(config.migration.batch_size);
            let stats = service
                .synchronize(batch_size, verbose)
                .await
                .context("synchronization failed")?;
            print_json(&stats)
        }
        Commands::Verify(args) => {
            let service = start(&config).await?;
            verify(&service, args, config.cleanup.page_size).await
        }
        Commands::Stores => {
            let service = start(&config).await?;
            list_stores(&service, &config).await
        }
    }
}

async fn start(config: &AppConfig) -> Result<BitstreamStorageService> {
    build_service(config)
        .await
        .context("failed to start storage service")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn verify(service: &BitstreamStorageService, args: VerifyArgs, page_size: u32) -> Result<()> {
    let mut rows = Vec::new();
    if let Some(store) = args.store {
        let mut offset = 0u64;
        loop {
            let page = service
                .metadata()
                .find_bitstreams_by_store(store, page_size, offset)
                .await
                .context("failed to list bitstreams")?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            rows.extend(page);
        }
    } else if args.ids.is_empty() {
        anyhow::bail!("nothing to verify: pass bitstream ids or --store");
    } else {
        for id in &args.ids {
            rows.push(service.find_live(*id).await?);
        }
    }

    let mut failed = 0u64;
    for row in &rows {
        let check = service
            .verify(row)
            .await
            .with_context(|| format!("failed to verify bitstream {}", row.bitstream_id))?;
        if check.check_result() != Some(CheckResult::Match) {
            failed += 1;
        }
        println!("{}\t{}", row.bitstream_id, check.result);
    }

    tracing::info!(checked = rows.len(), failed, "verification finished");
    if failed > 0 {
        anyhow::bail!("{failed} of {} bitstreams failed verification", rows.len());
    }
    Ok(())
}

async fn list_stores(service: &BitstreamStorageService, config: &AppConfig) -> Result<()> {
    let mut stores = Vec::new();
    for entry in &config.assetstore.stores {
        let live = service
            .metadata()
            .count_bitstreams_by_store(entry.index)
            .await
            .context("failed to count bitstreams")?;
        stores.push(json!({
            "index": entry.index,
            "type": entry.backend.kind(),
            "configured_enabled": entry.enabled,
            "available": service.stores().is_enabled(entry.index),
            "incoming": entry.index == config.assetstore.incoming,
            "live_bitstreams": live,
        }));
    }

    let synchronized = match config.assetstore.sync {
        Some(sync) => Some(json!({
            "primary": sync.primary,
            "secondary": sync.secondary,
            "live_bitstreams": service
                .metadata()
                .count_bitstreams_by_store(SYNCHRONIZED_STORE_NUMBER)
                .await
                .context("failed to count bitstreams")?,
        })),
        None => None,
    };

    print_json(&json!({ "stores": stores, "sync": synchronized }))
}
