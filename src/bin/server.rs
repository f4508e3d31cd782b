// AI Model - agent execution service
// Consumes agent requests from NATS and publishes their outcomes
// Run with: cargo run --bin server

//! # AI Model Server Binary
//!
//! Wires the library together and runs two subscriptions until Ctrl-C:
//!
//! ```text
//! ai.agent.requested ──▶ Subscriber ──▶ ExecutionContext ──▶ AgentExecutor
//!        │                                                      │
//!        └─ drop / retries exhausted ──▶ events.dlq              ▼
//!                                          │             ai.agent.{id}.completed|failed
//!                                          ▼             ai.cost.recorded
//!                                   DeadLetterHandler ──▶ KV bucket
//! ```
//!
//! Configuration comes from `ai-model.toml` (or `--config`), overridden by
//! `AI_MODEL_*` environment variables. The Anthropic key is read from the
//! variable named by `llm.api_key_env`.

use ai_model::config::{DeadLetterBackend, ServiceConfig};
use ai_model::engine::collaborators::{
    ContextFetcher, FileCatalog, KnowledgeRetriever, StaticContextFetcher, StaticKnowledgeBase,
};
use ai_model::engine::nats_bus::{self, NatsDeadLetterStore, NatsMessageBus};
use ai_model::engine::{
    AgentExecutor, AgentServices, DeadLetterHandler, DeadLetterStore, DeliveryPipeline,
    ExecutionContext, InMemoryDeadLetterStore, MessageBus, Publisher, Subscriber,
};
use ai_model::llm::AnthropicGateway;
use async_nats::jetstream;
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ai-model-server")]
#[command(about = "AI Model agent execution service")]
#[command(version = "0.1")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "AI_MODEL_CONFIG", default_value = "ai-model.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
        eprintln!("Environment variables must be set manually or via system configuration");
    }

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    info!("🚀 Starting AI Model Server...");
    info!("=====================================");

    let config = ServiceConfig::load_from(Some(cli.config.clone()))?;
    info!("Config file: {}", cli.config.display());
    info!("NATS: {}", config.nats.url);
    info!("Request topic: {}", config.dispatch.request_topic);
    info!("Dead-letter topic: {}", config.dead_letter.topic);

    // Collaborators
    let catalog = Arc::new(FileCatalog::from_paths(
        &config.catalog.agents_path,
        &config.catalog.prompts_path,
    )?);
    info!("🤖 Agents: {}", catalog.agent_ids().join(", "));

    let knowledge: Arc<dyn KnowledgeRetriever> = match &config.catalog.knowledge_path {
        Some(path) => Arc::new(StaticKnowledgeBase::from_path(path)?),
        None => {
            warn!("⚠️  No knowledge base configured; retrieval returns nothing");
            Arc::new(StaticKnowledgeBase::default())
        }
    };
    let context: Arc<dyn ContextFetcher> = match &config.catalog.entities_path {
        Some(path) => Arc::new(StaticContextFetcher::from_path(path)?),
        None => {
            warn!("⚠️  No entity records configured; context tools return nothing");
            Arc::new(StaticContextFetcher::default())
        }
    };

    let llm = match AnthropicGateway::from_env(&config.llm) {
        Ok(gateway) => {
            info!("✅ Anthropic gateway configured");
            gateway
        }
        Err(e) => {
            error!("❌ {}", e);
            return Err(e.into());
        }
    };

    // Transport
    let client = nats_bus::connect_with_retry(&config.nats).await?;
    let js = jetstream::new(client);
    let stream = nats_bus::ensure_stream(
        &js,
        &config.nats,
        &[config.dispatch.request_topic.clone(), config.dead_letter.topic.clone()],
    )
    .await?;
    info!("Stream {} binds {:?}", config.nats.stream_name, stream.cached_info().config.subjects);
    let bus: Arc<dyn MessageBus> = Arc::new(NatsMessageBus::new(js.clone()));

    let store: Arc<dyn DeadLetterStore> = match config.dead_letter.backend {
        DeadLetterBackend::Nats => {
            let kv = nats_bus::ensure_kv_bucket(&js, &config.dead_letter.bucket).await?;
            Arc::new(NatsDeadLetterStore::new(kv))
        }
        DeadLetterBackend::Memory => {
            warn!("⚠️  Dead letters are kept in memory and lost on restart");
            Arc::new(InMemoryDeadLetterStore::new())
        }
    };

    // Engine
    let services = AgentServices {
        config_cache: catalog.clone(),
        prompt_cache: catalog,
        llm: Arc::new(llm),
        knowledge,
        context,
    };
    let executor = Arc::new(AgentExecutor::new(
        services,
        Publisher::new(bus.clone()),
        config.dispatch.workflow_timeout(),
    ));
    let execution = Arc::new(ExecutionContext::start("ai-model-exec")?);
    let subscriber = Subscriber::new(executor, execution.clone(), config.dispatch.handoff_timeout());
    let dead_letters = DeadLetterHandler::new(store, bus.clone());

    let request_pipeline = DeliveryPipeline::new(bus.clone(), config.retry.clone(), config.dead_letter.topic.clone());
    let dead_letter_pipeline = DeliveryPipeline::terminal(bus.clone(), config.retry.clone());

    let request_consumer = nats_bus::durable_consumer(
        &stream,
        &config.nats.consumer_name,
        &config.dispatch.request_topic,
        config.nats.ack_wait(),
    )
    .await?;
    let dead_letter_consumer = nats_bus::durable_consumer(
        &stream,
        &config.nats.dead_letter_consumer_name,
        &config.dead_letter.topic,
        config.nats.ack_wait(),
    )
    .await?;

    let cancel = CancellationToken::new();
    let max_in_flight = config.dispatch.max_in_flight;

    let requests = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            nats_bus::run_subscription(request_consumer, &subscriber, &request_pipeline, cancel, max_in_flight).await
        })
    };
    let dead_letter_loop = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            nats_bus::run_subscription(dead_letter_consumer, &dead_letters, &dead_letter_pipeline, cancel, 1).await
        })
    };

    info!("✅ Listening on {}", config.dispatch.request_topic);
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down...");
    cancel.cancel();

    for (name, task) in [("requests", requests), ("dead letters", dead_letter_loop)] {
        match task.await {
            Ok(Ok(())) => info!("{} subscription stopped", name),
            Ok(Err(e)) => error!("{} subscription failed: {}", name, e),
            Err(e) => error!("{} subscription panicked: {}", name, e),
        }
    }

    execution.shutdown();
    info!("👋 Goodbye");
    Ok(())
}
