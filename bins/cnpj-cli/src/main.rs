//! # CNPJ CLI - pipeline front end
//!
//! Subcommands over the ETL engine:
//!
//! - `pipeline [--month YYYY-MM]`: download → convert → export+upload →
//!   integrity sample → consolidated archive → manifest
//! - `single --cnpj <id>`: project one identifier to a local JSON file
//! - `test`: sampled local-vs-remote integrity check
//! - `zip`: build the consolidated archive
//!
//! ## Usage
//!
//! ```bash
//! cnpj-cli pipeline --month 2024-05
//! cnpj-cli single --cnpj 12.345.678/0001-90
//! RUST_LOG=debug cnpj-cli test
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cnpj_core::{canonical, cnpj, AppConfig, TransferAgent};
use cnpj_etl::{archive, integrity, tables, CsvLoader, ExportOrchestrator, QueryEngine};
use cnpj_io::{HashCatalog, RclonePool, WebDownloader};

/// Directory the consolidated archive is written into.
const ZIP_EXPORT_DIR: &str = "cnpj_json_export";

#[derive(Parser, Debug)]
#[command(name = "cnpj-cli")]
#[command(about = "CNPJ registry ETL: CSV archives to content-addressed JSON documents")]
struct Cli {
    /// Path to the configuration file (defaults to ./config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline for one monthly drop
    Pipeline {
        /// Month to process (YYYY-MM). Defaults to the current month.
        #[arg(short, long)]
        month: Option<String>,
    },
    /// Project a single CNPJ to a local JSON file
    Single {
        /// The identifier, masked or raw
        #[arg(short, long)]
        cnpj: String,
    },
    /// Compare a sample of local renderings against the remote store
    Test,
    /// Build the consolidated archive from the local dataset
    Zip,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let result = match cli.command {
        Command::Pipeline { month } => run_pipeline(&config, month, &cancel).await,
        Command::Single { cnpj } => run_single(&config, &cnpj).await,
        Command::Test => run_test(&config, &cancel).await,
        Command::Zip => run_zip(&config).await,
    };

    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run_pipeline(
    config: &AppConfig,
    month: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let month = month.unwrap_or_else(|| chrono::Local::now().format("%Y-%m").to_string());
    let agent: Arc<dyn TransferAgent> = Arc::new(RclonePool::new(&config.rclone, cancel.clone()));

    info!(%month, "1/6 downloading monthly archives");
    let downloader = WebDownloader::new(
        &config.paths.download_dir,
        &config.paths.data_dir,
        &config.downloader,
    )?;
    downloader
        .download_and_extract(&month, &tables::csv_resume_globs(), cancel)
        .await?;

    info!("2/6 converting CSVs to parquet");
    let loader = CsvLoader::new(&config.paths.data_dir, &config.paths.parquet_dir);
    loader.convert_all(cancel).await?;

    info!("3/6 exporting and uploading documents");
    let engine = Arc::new(QueryEngine::open(&config.duckdb, &config.paths.parquet_dir)?);
    engine.register_views().await?;
    let catalog = Arc::new(
        HashCatalog::open(Path::new(&config.paths.hash_cache_dir), agent.as_ref()).await?,
    );
    let orchestrator = ExportOrchestrator::new(
        engine.clone(),
        catalog,
        agent.clone(),
        &config.paths.output_dir,
        config.ndjson.max_parallel_processing,
    );
    orchestrator.export_and_upload(cancel).await?;

    info!("4/6 sampled integrity check");
    let report = integrity::run_sample(config, agent.as_ref()).await?;
    if !report.all_ok() {
        warn!("integrity sample reported mismatches");
    }

    info!("5/6 building consolidated archive");
    let zip_path = archive::build_consolidated_archive(&engine, Path::new(ZIP_EXPORT_DIR)).await?;

    info!("6/6 publishing manifest");
    archive::publish_manifest(&engine, agent.as_ref(), &zip_path).await?;

    info!("pipeline complete");
    Ok(())
}

async fn run_single(config: &AppConfig, identifier: &str) -> Result<()> {
    if !cnpj::is_valid(identifier) {
        anyhow::bail!("invalid CNPJ: {identifier}");
    }
    let parts = cnpj::parse(identifier)?;

    let engine = QueryEngine::open(&config.duckdb, &config.paths.parquet_dir)?;
    engine.register_views().await?;

    let document = engine
        .project_one(&parts)
        .await?
        .with_context(|| format!("CNPJ {} not found in the dataset", parts.full()))?;
    let json = canonical::canonicalize(&document);

    let output_dir = Path::new(&config.paths.output_dir);
    std::fs::create_dir_all(output_dir)?;
    let target = output_dir.join(format!("{}.json", parts.full()));
    std::fs::write(&target, json.as_bytes())?;

    info!(path = %target.display(), bytes = json.len(), "document written");
    Ok(())
}

async fn run_test(config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    let agent = RclonePool::new(&config.rclone, cancel.clone());
    let report = integrity::run_sample(config, &agent).await?;

    let passed = report.results.iter().filter(|r| r.ok).count();
    if report.all_ok() {
        info!(passed, total = report.results.len(), "all sampled documents match");
        Ok(())
    } else {
        anyhow::bail!(
            "{passed}/{} sampled documents match; see log for divergences",
            report.results.len()
        )
    }
}

async fn run_zip(config: &AppConfig) -> Result<()> {
    let engine = QueryEngine::open(&config.duckdb, &config.paths.parquet_dir)?;
    engine.register_views().await?;
    let zip_path = archive::build_consolidated_archive(&engine, Path::new(ZIP_EXPORT_DIR)).await?;
    info!(path = %zip_path.display(), "archive ready");
    Ok(())
}
