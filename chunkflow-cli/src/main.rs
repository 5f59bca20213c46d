use anyhow::{Context, Result};
use bytes::Bytes;
use chunkflow_config::{ChunkflowConfig, ConfigLoader};
use chunkflow_execution::{worker_main, PoolManager, TaskRegistry, TaskSubmission, TracingEventSink};
use chunkflow_logging::{init_logging_from_config, init_worker_tracing, TracingLogger};
use clap::Parser;
use futures::stream::{FuturesOrdered, StreamExt};
use serde_json::{json, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

mod cli;
use cli::{Cli, Commands, ConfigCommands};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<ChunkflowConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) if path.exists() => loader
            .from_file(path)
            .context(format!("Failed to load configuration from {:?}", path)),
        Some(path) => {
            warn!("Configuration file not found: {:?}. Using defaults.", path);
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

fn init_logging(config: &mut ChunkflowConfig, log_level: Option<&str>) -> Result<()> {
    if let Some(level) = log_level {
        config.logging.level = level.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }
    init_logging_from_config(&config.logging)
}

/// One planned chunk as returned by `calculateChunks`
#[derive(serde::Deserialize)]
struct ChunkRange {
    index: u64,
    start: u64,
    end: u64,
    size: u64,
}

/// Plan the chunks of a file, then hash each chunk on the pool
async fn process_file(
    config: &ChunkflowConfig,
    file: &Path,
    chunk_size: u64,
    plan_category: &str,
    hash_category: &str,
    show_status: bool,
) -> Result<JsonValue> {
    if chunk_size == 0 {
        return Err(anyhow::anyhow!("--chunk-size must be greater than 0"));
    }
    let file_size = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("Cannot read {:?}", file))?
        .len();

    let manager = PoolManager::builder(
        config.pool.clone(),
        Arc::new(TracingEventSink),
        Arc::new(TracingLogger::new()),
    )
    .start()
    .context("Failed to start worker pool")?;

    let plan = manager
        .submit(
            TaskSubmission::new(
                plan_category,
                "calculateChunks",
                json!({ "fileSize": file_size, "chunkSize": chunk_size }),
            )
            .with_priority(0),
        )
        .await
        .context("Failed to plan chunks")?;
    let ranges: Vec<ChunkRange> = serde_json::from_value(plan["chunks"].clone())
        .context("Unexpected chunk plan")?;
    info!("Hashing {} chunks of {:?}", ranges.len(), file);

    // Bound the number of chunks held in memory at once
    let window = config.pool.max_workers.max(1) * 2;
    let mut reader = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Cannot open {:?}", file))?;
    let mut in_flight = FuturesOrdered::new();
    let mut hashes = Vec::with_capacity(ranges.len());

    for range in &ranges {
        let mut buffer = vec![0u8; range.size as usize];
        reader
            .read_exact(&mut buffer)
            .await
            .with_context(|| format!("Failed to read chunk {}", range.index))?;
        in_flight.push_back(manager.submit(TaskSubmission::new(
            hash_category,
            "hashChunk",
            Bytes::from(buffer),
        )));

        if in_flight.len() >= window {
            if let Some(result) = in_flight.next().await {
                hashes.push(result.context("Failed to hash chunk")?);
            }
        }
    }
    while let Some(result) = in_flight.next().await {
        hashes.push(result.context("Failed to hash chunk")?);
    }

    let chunks: Vec<JsonValue> = ranges
        .iter()
        .zip(&hashes)
        .map(|(range, hashed)| {
            json!({
                "index": range.index,
                "start": range.start,
                "end": range.end,
                "size": range.size,
                "hash": hashed["hash"],
            })
        })
        .collect();

    let mut summary = json!({
        "file": file.display().to_string(),
        "fileSize": file_size,
        "chunkSize": chunk_size,
        "totalChunks": ranges.len(),
        "chunks": chunks,
    });
    if show_status {
        let status = manager.status().await.context("Failed to read pool status")?;
        summary["pool"] = serde_json::to_value(status)?;
    }

    let report = manager.terminate().await.context("Failed to stop worker pool")?;
    debug!(
        "Pool stopped: drained={}, {} contexts acknowledged, {} forced",
        report.drained, report.contexts_acknowledged, report.contexts_forced
    );

    Ok(summary)
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match load_config(Some(config_file)) {
        Ok(config) => {
            println!("✅ Configuration file is valid");
            println!(
                "   {} categories, up to {} contexts",
                config.pool.categories.len(),
                config.pool.max_workers
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed: {:#}", e);
            error!("Configuration validation failed: {:#}", e);
            Err(e)
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: &PathBuf, force: bool) -> Result<()> {
    info!("Generating configuration at: {:?}", output);

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    fs::write(output, ChunkflowConfig::generate_sample())
        .context("Failed to write configuration file")?;

    println!("✅ Configuration generated at: {:?}", output);
    println!(
        "🔧 Validate with: chunkflow config validate --config-file {:?}",
        output
    );

    Ok(())
}

/// Handle configuration display
fn handle_config_show(config_file: Option<&PathBuf>, format: &str) -> Result<()> {
    let config = load_config(config_file)?;
    let output_value = serde_json::to_value(&config).context("Failed to serialize config")?;

    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output =
                serde_yaml::to_string(&output_value).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output = serde_json::to_string_pretty(&output_value)
                .context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Worker mode first: stdout carries the protocol, logs go to stderr
    if let Commands::Worker = cli.command {
        init_worker_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
        return worker_main(TaskRegistry::with_builtins())
            .await
            .context("Execution context failed");
    }

    let mut config = load_config(cli.config.as_ref())?;
    init_logging(&mut config, cli.log_level.as_deref())?;
    debug!("Chunkflow CLI starting");

    match &cli.command {
        Commands::Process {
            file,
            chunk_size,
            plan_category,
            hash_category,
            show_status,
        } => {
            let summary = process_file(
                &config,
                file,
                *chunk_size,
                plan_category,
                hash_category,
                *show_status,
            )
            .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("Failed to format result")?
            );
            Ok(())
        }
        Commands::Config { config_cmd } => match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(output, *force),
            ConfigCommands::Show {
                config_file,
                format,
            } => handle_config_show(config_file.as_ref().or(cli.config.as_ref()), format),
        },
        Commands::Worker => Ok(()),
    }
}
