//! Ingest Service - Loads vendor spreadsheets into the fact warehouse
//!
//! Responsibilities:
//! - Detect the vendor template of an upload
//! - Snapshot the raw bytes and sheet grids
//! - Parse sheets according to the stored ingest profile
//! - Upsert facts idempotently and record a batch with diagnostics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ingest::config::Config;
use ingest::detect::{detect_dataset_type, DatasetType};
use ingest::pipeline::{ImportRequest, Pipeline};
use ingest::profile::ProfileDocument;
use ingest::progress::LogProgress;
use ingest::store::{MemoryWarehouse, PgWarehouse, SaveOutcome, Warehouse};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Loads vendor spreadsheets into the fact warehouse")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one workbook
    Import {
        #[arg(long)]
        file: PathBuf,

        /// Dataset type (e.g. YONGYI_DAILY); detected when omitted
        #[arg(long)]
        dataset_type: Option<DatasetType>,

        #[arg(long)]
        uploader: Option<String>,

        /// Dry run - import into an in-memory warehouse, nothing is saved
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Profile document to use for a dry run
        #[arg(long, requires = "dry_run")]
        profile: Option<PathBuf>,
    },
    /// Print the detected dataset type of a file
    Detect {
        #[arg(long)]
        file: PathBuf,
    },
    /// Validate and store an ingest profile document
    LoadProfile {
        #[arg(long)]
        file: PathBuf,
    },
    /// Create warehouse tables if missing
    InitSchema,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn read_profile(path: &Path) -> Result<ProfileDocument> {
    let json = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    let doc = ProfileDocument::from_json(&json).context("Invalid profile document")?;
    doc.compile().context("Profile does not compile")?;
    Ok(doc)
}

async fn connect(config: &Config) -> Result<PgWarehouse> {
    PgWarehouse::connect(config.require_db_url()?, config.max_connections)
        .await
        .context("Failed to connect to database")
}

async fn run_import(
    config: &Config,
    file: &Path,
    dataset_type: Option<DatasetType>,
    uploader: Option<String>,
    dry_run: bool,
    profile: Option<&Path>,
) -> Result<()> {
    let bytes = fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request = ImportRequest {
        filename: file_name(file),
        bytes,
        dataset_type,
        uploader,
    };
    println!("File: {}", request.filename);
    println!("Size: {} bytes", request.bytes.len());
    println!("Mode: {}", if dry_run { "dry-run" } else { "live" });

    let response = if dry_run {
        let warehouse = MemoryWarehouse::new();
        if let Some(path) = profile {
            let doc = read_profile(path).await?;
            warehouse.save_profile(&doc).await?;
        }
        let pipeline = Pipeline::new(&warehouse, &LogProgress, config.pipeline_options());
        let response = pipeline.import(&request).await?;
        println!("\nDry run - {} facts held in memory, nothing saved", warehouse.count_facts().await?);
        response
    } else {
        let warehouse = connect(config).await?;
        let pipeline = Pipeline::new(&warehouse, &LogProgress, config.pipeline_options());
        pipeline.import(&request).await?
    };

    println!("\nBatch: {}", response.batch_id);
    println!("Dataset: {}", response.dataset_type);
    println!("Status: {}", response.status.as_str());
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ingest=info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Market Data Ingest ===");

    match args.command {
        Command::Import {
            file,
            dataset_type,
            uploader,
            dry_run,
            profile,
        } => run_import(&config, &file, dataset_type, uploader, dry_run, profile.as_deref()).await?,
        Command::Detect { file } => {
            let bytes = fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file_name(&file);
            let found = detect_dataset_type(&bytes, &name);
            println!("File: {}", name);
            println!("Dataset: {} (by {})", found.dataset_type, found.by.as_str());
        }
        Command::LoadProfile { file } => {
            let doc = read_profile(&file).await?;
            let warehouse = connect(&config).await?;
            match warehouse.save_profile(&doc).await? {
                SaveOutcome::Stored { version } => {
                    println!("Stored profile {} v{}", doc.dataset_type, version)
                }
                SaveOutcome::Unchanged { version } => {
                    println!("Profile {} v{} already stored, nothing to do", doc.dataset_type, version)
                }
            }
        }
        Command::InitSchema => {
            let warehouse = connect(&config).await?;
            warehouse.ensure_schema().await.context("Failed to create schema")?;
            println!("Schema ready");
        }
    }

    println!("\n=== Done ===");
    Ok(())
}
