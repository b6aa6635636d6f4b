// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stats_recorder::{
    load_config_with_env, BackendRegistry, ExtractorPool, Record, StatsBuffer, StatsConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stats Recorder - Persist pipeline telemetry records to storage backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read JSON-lines records from stdin and store them in every stream
    Ingest,
    /// Print the records stored for a stream as JSON lines
    Dump {
        /// Stream name from the configuration file
        #[arg(short, long)]
        stream: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let config = load_config_with_env(&args.config)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from: {:?}", args.config);

    let registry = BackendRegistry::with_defaults();

    match args.command {
        Command::Ingest => ingest(&config, &registry).await,
        Command::Dump { stream } => dump(&config, &registry, &stream).await,
    }
}

async fn ingest(config: &StatsConfig, registry: &BackendRegistry) -> Result<()> {
    let pool: ExtractorPool<Record> = ExtractorPool::new();
    let mut buffers = Vec::with_capacity(config.streams.len());

    for stream in &config.streams {
        let buffer = Arc::new(StatsBuffer::from_config(stream, registry)?);
        if !buffer.backend().health_check().await? {
            warn!("Stream '{}': backend reports unhealthy", stream.name);
        }
        pool.subscribe(buffer.clone()).await;
        buffers.push((buffer, stream.max_retries));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0usize;
    let mut published = 0usize;
    let mut failures = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("stdin line {} is not a record", line_number))?;

        match pool.publish(record).await {
            Ok(()) => published += 1,
            Err(e) => {
                // Records stay pending in the buffer and are retried on drain
                failures += 1;
                warn!("Line {}: {}", line_number, e);
            }
        }
    }

    info!(
        "Published {} records ({} with delivery errors)",
        published + failures,
        failures
    );

    let mut drain_failed = false;
    for (buffer, max_retries) in &buffers {
        if let Err(e) = buffer.drain(*max_retries).await {
            error!("Stream '{}': drain failed: {}", buffer.name(), e);
            drain_failed = true;
        }
        let stats = buffer.stats().await;
        info!(
            "Stream '{}': {} records in {} flushes, {} failed flushes, {} pending",
            buffer.name(),
            stats.flushed_records,
            stats.flushes,
            stats.failed_flushes,
            stats.pending
        );
    }

    if drain_failed {
        anyhow::bail!("some streams could not be drained");
    }
    Ok(())
}

async fn dump(config: &StatsConfig, registry: &BackendRegistry, stream: &str) -> Result<()> {
    let stream_config = config
        .stream(stream)
        .with_context(|| format!("unknown stream '{}'", stream))?;
    let buffer = StatsBuffer::from_config(stream_config, registry)?;

    let records = buffer.load_required().await?;
    let mut stdout = tokio::io::stdout();
    for record in &records {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
    }
    stdout.flush().await?;

    info!("Stream '{}': dumped {} records", stream, records.len());
    Ok(())
}
