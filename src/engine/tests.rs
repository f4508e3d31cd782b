//! Delivery-to-outcome scenarios across subscriber, pipeline, dispatcher,
//! workflows, publisher and dead-letter handler.

use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::bus::{InMemoryMessageBus, InboundMessage, MessageHandler};
use super::collaborators::{FileCatalog, Passage, StaticContextFetcher, StaticKnowledgeBase};
use super::dead_letter::{DeadLetterHandler, DeadLetterStore, InMemoryDeadLetterStore};
use super::delivery::{DeliveryPipeline, Settlement};
use super::dispatcher::{AgentExecutor, AgentServices};
use super::execution::ExecutionContext;
use super::jobs::JobTracker;
use super::publisher::{Publisher, COST_TOPIC};
use super::subscriber::Subscriber;
use super::testing::{services, services_with, test_prompt, Reply, ScriptedLlm, UnreachableCache};
use crate::config::RetryPolicy;
use crate::models::{
    AgentConfig, AgentRequestEvent, AnalyzerSpec, DeadLetterReason, DeadLetterStatus,
    EntityLinkage, ExplorerSettings, ExtractorSettings, FieldSchema, FieldType, GeneratorSettings,
    JobState, WorkflowSettings,
};

const REQUEST_TOPIC: &str = "ai.agent.requested";
const DLQ_TOPIC: &str = "events.dlq";

struct Harness {
    bus: Arc<InMemoryMessageBus>,
    subscriber: Subscriber,
    pipeline: DeliveryPipeline,
    dead_letters: DeadLetterHandler,
    store: Arc<InMemoryDeadLetterStore>,
    executor: Arc<AgentExecutor>,
    context: Arc<ExecutionContext>,
}

impl Harness {
    fn new(services: AgentServices, handoff_timeout: Duration) -> Self {
        let bus = Arc::new(InMemoryMessageBus::new());
        let executor = Arc::new(AgentExecutor::new(
            services,
            Publisher::new(bus.clone()),
            Duration::from_secs(5),
        ));
        let context = Arc::new(ExecutionContext::start("scenario-exec").unwrap());
        let store = Arc::new(InMemoryDeadLetterStore::new());
        Self {
            subscriber: Subscriber::new(executor.clone(), context.clone(), handoff_timeout),
            pipeline: DeliveryPipeline::new(bus.clone(), RetryPolicy::default(), DLQ_TOPIC),
            dead_letters: DeadLetterHandler::new(store.clone(), bus.clone()),
            store,
            executor,
            context,
            bus,
        }
    }

    async fn deliver(&self, payload: Vec<u8>, attempt: u32) -> Settlement {
        let message = InboundMessage::new(REQUEST_TOPIC, payload).with_attempt(attempt);
        self.pipeline.process(&self.subscriber, message).await
    }

    /// Feed whatever reached the dead-letter topic to the handler.
    async fn drain_dead_letters(&self) {
        for published in self.bus.published_on(DLQ_TOPIC).await {
            let message = InboundMessage::new(DLQ_TOPIC, published.payload);
            self.dead_letters.handle(message).await;
        }
    }
}

fn qc_extractor() -> AgentConfig {
    AgentConfig::new(
        "qc-event-extractor",
        "qc-extraction",
        WorkflowSettings::Extractor(ExtractorSettings {
            schema: FieldSchema {
                required: vec!["grade".to_string(), "weight_kg".to_string()],
                fields: BTreeMap::from([
                    ("grade".to_string(), FieldType::String),
                    ("weight_kg".to_string(), FieldType::Number),
                ]),
                ..FieldSchema::default()
            },
            validation_retries: 1,
        }),
    )
}

fn advice_writer() -> AgentConfig {
    AgentConfig::new(
        "advice-writer",
        "advice",
        WorkflowSettings::Generator(GeneratorSettings::default()),
    )
}

fn catalog() -> FileCatalog {
    FileCatalog::from_parts(
        vec![qc_extractor(), advice_writer()],
        vec![test_prompt("qc-extraction"), test_prompt("advice")],
    )
}

fn qc_request(input: Value) -> AgentRequestEvent {
    AgentRequestEvent::new("req-qc-1", "qc-event-extractor", EntityLinkage::for_farmer("WM-0001"), input)
}

fn extraction_llm() -> ScriptedLlm {
    ScriptedLlm::new().when("Task: extract", Reply::text(r#"{"grade": "A", "weight_kg": 12.5}"#))
}

#[tokio::test]
async fn malformed_payload_lands_in_dead_letter_store_intact() {
    let harness = Harness::new(services(catalog(), Arc::new(ScriptedLlm::new())), Duration::from_secs(2));
    let garbage = b"{\"agent_id\": \"qc-event-extractor\", oops".to_vec();

    let settlement = harness.deliver(garbage.clone(), 1).await;
    assert!(matches!(settlement, Settlement::DeadLettered(DeadLetterReason::Dropped { .. })));

    harness.drain_dead_letters().await;
    let records = harness.store.list(None, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, garbage);
    assert_eq!(records[0].original_topic, REQUEST_TOPIC);
    assert_eq!(records[0].status, DeadLetterStatus::PendingReview);
}

#[tokio::test]
async fn request_without_agent_id_is_dead_lettered_intact() {
    let llm = Arc::new(ScriptedLlm::new());
    let harness = Harness::new(services(catalog(), llm.clone()), Duration::from_secs(2));
    let payload = json!({
        "request_id": "req-orphan",
        "linkage": {"farmer_id": "WM-0001"},
        "input_data": {"text": "Grade A leaf"}
    })
    .to_string()
    .into_bytes();

    let settlement = harness.deliver(payload.clone(), 1).await;
    let Settlement::DeadLettered(DeadLetterReason::Dropped { detail }) = &settlement else {
        panic!("expected a dropped dead letter, got {:?}", settlement);
    };
    assert!(detail.contains("agent_id"));

    harness.drain_dead_letters().await;
    let records = harness.store.list(Some(DeadLetterStatus::PendingReview), 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, payload);
    assert_eq!(records[0].original_topic, REQUEST_TOPIC);
    assert_eq!(records[0].delivery_attempts, 1);
    assert!(matches!(records[0].reason, DeadLetterReason::Dropped { .. }));
    assert!(llm.calls().is_empty());
    assert!(harness.bus.published_on(COST_TOPIC).await.is_empty());
}

#[tokio::test]
async fn unknown_agent_is_dropped_without_outcome_events() {
    let harness = Harness::new(services(catalog(), Arc::new(ScriptedLlm::new())), Duration::from_secs(2));
    let request = AgentRequestEvent::new("req-9", "ghost-agent", EntityLinkage::for_region("NYERI"), json!({}));

    let settlement = harness.deliver(serde_json::to_vec(&request).unwrap(), 1).await;
    assert!(matches!(settlement, Settlement::DeadLettered(DeadLetterReason::Dropped { .. })));
    assert!(harness.bus.published_on("ai.agent.ghost-agent.failed").await.is_empty());
}

#[tokio::test]
async fn handoff_timeout_retries_without_dead_letter() {
    let llm = ScriptedLlm::new().when(
        "Task: generate",
        Reply::delayed(Duration::from_secs(3), Reply::text("late advice")),
    );
    let harness = Harness::new(services(catalog(), Arc::new(llm)), Duration::from_millis(100));
    let request = AgentRequestEvent::new("req-slow", "advice-writer", EntityLinkage::for_farmer("WM-0001"), json!({}));

    let settlement = harness.deliver(serde_json::to_vec(&request).unwrap(), 1).await;
    assert!(matches!(settlement, Settlement::Nak(_)));
    assert!(harness.bus.published_on(DLQ_TOPIC).await.is_empty());
    assert!(harness.bus.published_on("ai.agent.advice-writer.completed").await.is_empty());
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let cache = Arc::new(UnreachableCache);
    let mut services = services(catalog(), Arc::new(ScriptedLlm::new()));
    services.config_cache = cache;
    let harness = Harness::new(services, Duration::from_secs(2));
    let payload = serde_json::to_vec(&qc_request(json!({"text": "grade A"}))).unwrap();

    assert!(matches!(harness.deliver(payload.clone(), 1).await, Settlement::Nak(_)));
    let last = harness.deliver(payload, RetryPolicy::default().max_attempts).await;
    assert_eq!(
        last,
        Settlement::DeadLettered(DeadLetterReason::RetriesExhausted { attempts: 3 })
    );
}

#[tokio::test]
async fn qc_event_extractor_end_to_end() {
    let harness = Harness::new(services(catalog(), Arc::new(extraction_llm())), Duration::from_secs(5));
    let payload = json!({
        "request_id": "req-qc-1",
        "agent_id": "qc-event-extractor",
        "linkage": {"farmer_id": "WM-0001"},
        "input_data": {"text": "Grade A leaf, 12.5 kg, collected this morning"},
        "source": "collection-model"
    });

    let settlement = harness.deliver(payload.to_string().into_bytes(), 1).await;
    assert_eq!(settlement, Settlement::Ack);

    let completed = harness.bus.published_on("ai.agent.qc-event-extractor.completed").await;
    assert_eq!(completed.len(), 1);
    let event = completed[0].json().unwrap();
    assert_eq!(event["request_id"], "req-qc-1");
    assert_eq!(event["linkage"]["farmer_id"], "WM-0001");
    assert_eq!(event["result"]["result_type"], "extractor");
    assert_eq!(event["result"]["extracted_fields"], json!({"grade": "A", "weight_kg": 12.5}));
    assert_eq!(harness.bus.published_on(COST_TOPIC).await.len(), 1);
}

#[tokio::test]
async fn extractor_is_idempotent_for_identical_input() {
    let harness = Harness::new(services(catalog(), Arc::new(extraction_llm())), Duration::from_secs(5));
    let request = qc_request(json!({"text": "Grade A leaf, 12.5 kg"}));

    harness.executor.dispatch(&request).await.unwrap();
    harness.executor.dispatch(&request).await.unwrap();

    let completed = harness.bus.published_on("ai.agent.qc-event-extractor.completed").await;
    assert_eq!(completed.len(), 2);
    let first = completed[0].json().unwrap();
    let second = completed[1].json().unwrap();
    assert_eq!(first["result"], second["result"]);
}

fn passage(id: &str, domain: &str, text: &str) -> Passage {
    Passage {
        id: id.to_string(),
        source: format!("kb/{}.md", domain),
        domain: domain.to_string(),
        text: text.to_string(),
        published_at: None,
        score: 0.0,
    }
}

#[tokio::test]
async fn explorer_keeps_analyzers_that_beat_the_deadline() {
    let analyzers = ["fungal", "weather", "soil"]
        .iter()
        .map(|name| AnalyzerSpec {
            name: name.to_string(),
            focus: format!("{} causes", name),
            knowledge_domain: Some(name.to_string()),
        })
        .collect();
    let mut config = AgentConfig::new(
        "disease-diagnosis",
        "diagnosis",
        WorkflowSettings::Explorer(ExplorerSettings {
            confidence_threshold: 0.7,
            analyzers,
            analyzer_deadline_ms: 300,
        }),
    );
    config.rag.enabled = true;

    let knowledge = StaticKnowledgeBase::new(vec![
        passage("p1", "fungal", "Yellow leaf spots follow blister blight"),
        passage("p2", "weather", "Yellow leaf after long dry spells"),
        passage("p3", "soil", "Yellow leaf from nitrogen deficiency"),
    ]);
    let llm = ScriptedLlm::new()
        .when("Task: triage", Reply::text(r#"{"confidence": 0.3, "summary": "unclear"}"#))
        .when(
            "Task: analyze (fungal)",
            Reply::text(r#"{"diagnosis": "Blister blight", "confidence": 0.82, "severity": "high", "recommendations": ["apply copper fungicide"]}"#),
        )
        .when(
            "Task: analyze (weather)",
            Reply::text(r#"{"diagnosis": "Drought stress", "confidence": 0.55, "severity": "medium", "recommendations": ["mulch"]}"#),
        )
        .when(
            "Task: analyze (soil)",
            Reply::delayed(
                Duration::from_secs(5),
                Reply::text(r#"{"diagnosis": "Nitrogen deficiency", "confidence": 0.99, "severity": "low"}"#),
            ),
        );

    let services = services_with(
        FileCatalog::from_parts(vec![config], vec![test_prompt("diagnosis")]),
        Arc::new(llm),
        Arc::new(knowledge),
        Arc::new(StaticContextFetcher::default()),
    );
    let harness = Harness::new(services, Duration::from_secs(5));
    let request = AgentRequestEvent::new(
        "req-dx",
        "disease-diagnosis",
        EntityLinkage::for_farmer("WM-0001"),
        json!({"symptoms": "yellow leaf spots"}),
    );

    let outcome = harness.executor.dispatch(&request).await.unwrap();
    assert!(outcome.is_completed());

    let completed = harness.bus.published_on("ai.agent.disease-diagnosis.completed").await;
    let result = &completed[0].json().unwrap()["result"];
    assert_eq!(result["diagnosis"], "Blister blight");
    assert_eq!(result["severity"], "high");
    assert_eq!(result["rag_sources_used"], json!(["kb/fungal.md", "kb/weather.md"]));
    assert_eq!(result["recommendations"], json!(["apply copper fungicide", "mulch"]));
}

#[tokio::test]
async fn job_progress_streams_to_completion() {
    let harness = Harness::new(services(catalog(), Arc::new(extraction_llm())), Duration::from_secs(5));
    let tracker = JobTracker::new(harness.executor.clone(), harness.context.handle().clone());
    let request = qc_request(json!({"pages": ["page one", "page two"]}));

    let job_id = tracker.start_job(request).unwrap();
    let events: Vec<_> = tokio::time::timeout(Duration::from_secs(5), tracker.progress_stream(job_id).collect::<Vec<_>>())
        .await
        .unwrap();

    let last = events.last().unwrap();
    assert_eq!(last.state, JobState::Completed);
    assert_eq!(last.progress_percent, 100);

    let status = tracker.poll_status(&job_id).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.pages_processed, 2);
    assert!(tracker.poll_status(&uuid::Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn invalid_job_request_is_rejected() {
    let harness = Harness::new(services(catalog(), Arc::new(extraction_llm())), Duration::from_secs(5));
    let tracker = JobTracker::new(harness.executor.clone(), harness.context.handle().clone());
    let request = AgentRequestEvent::new("req-x", "qc-event-extractor", EntityLinkage::default(), json!({}));
    assert!(tracker.start_job(request).is_err());
}
