//! Strata CLI
//!
//! Command-line interface for Strata operations:
//! - Ingest a JSON-lines file of records
//! - Build hourly indexes for a device
//! - Generate a default config file

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata::config::generate_default_config;
use strata::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "strata")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hierarchical, time-partitioned event store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Feed a JSON-lines file of records through the ingestion pipeline
    Ingest {
        /// Path to the records file (one JSON record per line)
        path: PathBuf,
        /// Build hourly indexes for the ingested hours afterwards
        #[arg(long)]
        aggregate: bool,
        /// Seconds to wait for the pipeline to drain
        #[arg(long, default_value = "60")]
        shutdown_timeout: u64,
    },

    /// Build hourly indexes for one device
    Aggregate {
        #[arg(long)]
        tenant: i32,
        #[arg(long)]
        device: i64,
        /// Start time: ISO 8601 or epoch milliseconds
        #[arg(long)]
        from: String,
        /// End time (default: now)
        #[arg(long)]
        to: Option<String>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        return write_default_config(output.as_deref());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default().context("loading default config")?,
    };
    init_logging(&config.logging);

    tracing::info!("Strata v{}", env!("CARGO_PKG_VERSION"));
    let data_dir = config.data_dir();
    tracing::info!("Data directory: {:?}", data_dir);

    let registry = Arc::new(IndexRegistry::from_record_kinds());
    let store: Arc<dyn DurableStore> = Arc::new(LocalFileStore::new(data_dir));
    let cache: Arc<dyn DistributedCache> = Arc::new(InMemoryCache::new());

    match cli.command {
        Commands::Ingest {
            path,
            aggregate,
            shutdown_timeout,
        } => {
            let pipeline = IngestPipeline::new(
                Arc::clone(&registry),
                Arc::clone(&store),
                Arc::clone(&cache),
                config.pipeline_config(),
            );
            let ranges = ingest_file(&pipeline, &path).await?;

            pipeline.shutdown().await;
            if !pipeline
                .wait_for_shutdown(Duration::from_secs(shutdown_timeout))
                .await
            {
                bail!("pipeline did not drain within {}s", shutdown_timeout);
            }
            println!("{}", pipeline.stats().await);

            if aggregate {
                let aggregator =
                    HourlyIndexAggregator::new(store, cache, registry, config.aggregator_config());
                let mut total = AggregationReport::default();
                for (partition, (from_ms, to_ms)) in ranges {
                    total += aggregator
                        .build_hourly_index(partition.tenant_id, partition.device_id, from_ms, to_ms)
                        .await?;
                }
                println!("{}", total);
            }
        }

        Commands::Aggregate {
            tenant,
            device,
            from,
            to,
        } => {
            let from_ms = parse_timestamp(&from)?;
            let to_ms = match to.as_deref() {
                Some(s) => parse_timestamp(s)?,
                None => Utc::now().timestamp_millis(),
            };
            if to_ms < from_ms {
                bail!("--to is before --from");
            }

            let aggregator =
                HourlyIndexAggregator::new(store, cache, registry, config.aggregator_config());
            let report = aggregator
                .build_hourly_index(tenant, device, from_ms, to_ms)
                .await?;
            println!("{}", report);
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("strata={}", config.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Feed every line of `path` to the pipeline. Returns the time range seen
/// per partition.
async fn ingest_file(
    pipeline: &IngestPipeline,
    path: &Path,
) -> anyhow::Result<BTreeMap<PartitionKey, (i64, i64)>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut ranges: BTreeMap<PartitionKey, (i64, i64)> = BTreeMap::new();
    let mut line_number = 0u64;
    let mut unparsable = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record = match Record::from_line(&line) {
            Ok(record) => record,
            Err(e) => {
                unparsable += 1;
                tracing::warn!(line = line_number, error = %e, "Skipping unparsable record");
                continue;
            }
        };

        let routing = record.partition_key().zip(record.produced_timestamp_ms());
        if pipeline.add_model(record).await? {
            if let Some((partition, ts)) = routing {
                let range = ranges.entry(partition).or_insert((ts, ts));
                range.0 = range.0.min(ts);
                range.1 = range.1.max(ts);
            }
        }
    }

    tracing::info!(
        lines = line_number,
        unparsable,
        partitions = ranges.len(),
        "Finished reading input"
    );
    Ok(ranges)
}

fn parse_timestamp(s: &str) -> anyhow::Result<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    s.parse::<i64>()
        .with_context(|| format!("invalid timestamp: {} (expected ISO 8601 or epoch ms)", s))
}

fn write_default_config(output: Option<&Path>) -> anyhow::Result<()> {
    let content = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Config written to {}", path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}
