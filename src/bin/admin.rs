//! AI Model Admin CLI
//!
//! Operator tool for the dead-letter queue: inspect what landed there,
//! replay a record to its original topic, or discard it with a reason.

use ai_model::config::ServiceConfig;
use ai_model::engine::collaborators::FileCatalog;
use ai_model::engine::nats_bus::{self, NatsDeadLetterStore, NatsMessageBus};
use ai_model::engine::DeadLetterHandler;
use ai_model::models::{DeadLetterRecord, DeadLetterStatus};
use anyhow::{Context, Result};
use async_nats::jetstream;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ai-model-admin")]
#[command(about = "AI Model Admin CLI - Dead-letter review and catalog inspection")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(long, env = "AI_MODEL_CONFIG", default_value = "ai-model.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dead-letter queue management
    Dlq {
        #[command(subcommand)]
        action: DlqCommands,
    },

    /// List the agents in the configured catalog
    Agents,
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-letter records, newest first
    List {
        /// pending_review, replayed or discarded
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one record including its payload
    Show { id: Uuid },

    /// Republish a pending record's payload to its original topic
    Replay {
        id: Uuid,

        /// Confirm the replay
        #[arg(long)]
        confirm: bool,
    },

    /// Mark a pending record as discarded
    Discard {
        id: Uuid,

        /// Why the record is being discarded
        #[arg(long)]
        reason: String,

        /// Confirm the discard
        #[arg(long)]
        confirm: bool,
    },

    /// Record counts per status
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = ServiceConfig::load_from(Some(cli.config.clone()))?;

    match cli.command {
        Commands::Agents => list_agents(&config)?,
        Commands::Dlq { action } => {
            if let DlqCommands::Replay { confirm: false, .. } = action {
                error!("❌ Replay requires --confirm flag for safety");
                return Ok(());
            }
            if let DlqCommands::Discard { confirm: false, .. } = action {
                error!("❌ Discard requires --confirm flag for safety");
                return Ok(());
            }

            let handler = connect(&config).await?;
            run_dlq(&handler, action).await?;
        }
    }

    Ok(())
}

async fn connect(config: &ServiceConfig) -> Result<DeadLetterHandler> {
    let client = nats_bus::connect_with_retry(&config.nats).await?;
    let js = jetstream::new(client);
    let kv = nats_bus::ensure_kv_bucket(&js, &config.dead_letter.bucket).await?;
    Ok(DeadLetterHandler::new(
        Arc::new(NatsDeadLetterStore::new(kv)),
        Arc::new(NatsMessageBus::new(js)),
    ))
}

async fn run_dlq(handler: &DeadLetterHandler, action: DlqCommands) -> Result<()> {
    match action {
        DlqCommands::List { status, limit } => {
            let status = status
                .map(|s| s.parse::<DeadLetterStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let records = handler.list(status, limit).await?;
            if records.is_empty() {
                info!("📭 No dead-letter records");
                return Ok(());
            }
            info!("📋 {} dead-letter record(s):", records.len());
            for record in &records {
                print_summary(record);
            }
        }

        DlqCommands::Show { id } => match handler.get(&id).await? {
            Some(record) => print_detail(&record),
            None => warn!("⚠️  No dead-letter record {}", id),
        },

        DlqCommands::Replay { id, .. } => {
            let record = handler.replay(&id).await.context("replay failed")?;
            info!("✅ Replayed {} to {}", record.id, record.original_topic);
        }

        DlqCommands::Discard { id, reason, .. } => {
            let record = handler.discard(&id, &reason).await.context("discard failed")?;
            info!("🗑️  Discarded {}: {}", record.id, reason);
        }

        DlqCommands::Stats => {
            let counts = handler.stats().await?;
            info!("📊 Dead-letter statistics:");
            for status in [
                DeadLetterStatus::PendingReview,
                DeadLetterStatus::Replayed,
                DeadLetterStatus::Discarded,
            ] {
                info!("   {}: {}", status.as_str(), counts.get(&status).copied().unwrap_or(0));
            }
        }
    }
    Ok(())
}

fn print_summary(record: &DeadLetterRecord) {
    info!(
        "   {} [{}] {} attempts={} at {} - {}",
        record.id,
        record.status.as_str(),
        record.original_topic,
        record.delivery_attempts,
        record.received_at.format("%Y-%m-%d %H:%M:%S"),
        record.reason
    );
}

fn print_detail(record: &DeadLetterRecord) {
    print_summary(record);
    if let Some(replayed_at) = record.replayed_at {
        info!("   replayed at {}", replayed_at);
    }
    if let (Some(discarded_at), Some(reason)) = (record.discarded_at, &record.discard_reason) {
        info!("   discarded at {}: {}", discarded_at, reason);
    }
    info!("   payload ({} bytes): {}", record.payload.len(), record.payload_preview(2000));
}

fn list_agents(config: &ServiceConfig) -> Result<()> {
    let catalog = FileCatalog::from_paths(&config.catalog.agents_path, &config.catalog.prompts_path)?;
    let ids = catalog.agent_ids();
    info!("🤖 {} agent(s) in {}:", ids.len(), config.catalog.agents_path.display());
    for id in ids {
        info!("   {}", id);
    }
    Ok(())
}
