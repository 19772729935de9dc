//! Hazard Store Binary Entry Point
//!
//! Ingests JSON-lines alert feeds into the store and queries stored events.
//! Results are written to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hazard_store::{
    AppConfig, ClientManager, EventFilter, EventQueryEngine, EventRepository, WriteMode,
    config::{DEFAULT_CONFIG_PATH, parse_duration},
    ingest,
};
use tokio::io::{AsyncBufRead, BufReader};
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hazard Store - deduplicating alert event store
#[derive(Parser, Debug)]
#[command(name = "hazard-store", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file [default: configs/config.yaml]
    #[arg(short, long, env = "HAZARD_STORE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store target identifier (overrides config file)
    #[arg(long, env = "HAZARD_STORE_PROJECT", global = true)]
    project: Option<String>,

    /// Local emulator connection URL (overrides config file)
    #[arg(long, env = "HAZARD_STORE_EMULATOR_URL", global = true)]
    emulator_url: Option<String>,

    /// Write mode: last_writer_wins or precondition (overrides config file)
    #[arg(long, global = true)]
    write_mode: Option<WriteMode>,

    /// Per-operation timeout, e.g. 500ms or 5s (overrides config file)
    #[arg(long, value_parser = parse_duration, global = true)]
    operation_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest JSON-lines events from a file or stdin
    Ingest {
        /// Feed file; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Print one stored event
    Get {
        /// Event id
        id: String,
    },
    /// Print stored events, most recent first, one JSON document per line
    List {
        /// Maximum number of events
        #[arg(short, long, default_value_t = 100)]
        limit: u32,

        /// Only events updated at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only events touching one of these area codes (repeatable)
        #[arg(long = "area")]
        areas: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hazard_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration; only an explicitly named file must exist
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            AppConfig::load(path)?
        }
        None => AppConfig::load_or_default(DEFAULT_CONFIG_PATH)?,
    };

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(project) = cli.project {
        config.store.project = Some(project);
    }
    if let Some(url) = cli.emulator_url {
        config.store.emulator_url = Some(url);
    }
    if let Some(mode) = cli.write_mode {
        config.store.write_mode = mode;
    }
    if let Some(timeout) = cli.operation_timeout {
        config.store.operation_timeout = timeout;
    }
    config.validate()?;

    tracing::debug!(
        project = ?config.store.project(),
        write_mode = %config.store.write_mode,
        "Configuration ready"
    );

    let clients = Arc::new(ClientManager::new(config.store.clone()));
    let result = run(cli.command, &config, &clients).await;

    clients.release().await;
    result
}

async fn run(
    command: Command,
    config: &AppConfig,
    clients: &Arc<ClientManager>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Ingest { file } => {
            let repo = EventRepository::new(Arc::clone(clients));
            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match file {
                Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };

            tokio::select! {
                result = ingest(&repo, &config.ingest, reader) => {
                    let summary = result?;
                    println!("{}", serde_json::to_string(&summary)?);
                }
                Ok(()) = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C signal, stopping ingestion");
                }
            }
        }
        Command::Get { id } => {
            let engine = EventQueryEngine::new(Arc::clone(clients));
            match engine.get(&id).await? {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => {
                    tracing::info!(event_id = %id, "Event not found");
                    println!("null");
                }
            }
        }
        Command::List {
            limit,
            since,
            areas,
        } => {
            let mut filter = EventFilter::new(limit);
            if let Some(since) = since {
                filter = filter.updated_after(since);
            }
            if !areas.is_empty() {
                filter = filter.area_codes(areas);
            }

            let engine = EventQueryEngine::new(Arc::clone(clients));
            let mut stream = engine.list(filter).await?;
            let mut count = 0usize;
            while let Some(event) = stream.next().await {
                println!("{}", serde_json::to_string(&event?)?);
                count += 1;
            }
            tracing::debug!(count, "Listing complete");
        }
    }
    Ok(())
}
