//! Explorer: fetch context → retrieve knowledge → triage → analyze → aggregate → emit.
//!
//! Triage asks the model how confident it already is. At or above the
//! configured threshold only the primary (first) analyzer runs. Below it,
//! every analyzer runs concurrently under one shared deadline; analyzers
//! that fail or miss the deadline are left out, and at least one has to
//! succeed.
//!
//! Findings are ranked by confidence, then by how recent their supporting
//! evidence is, then by the order in which the analyzers finished.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    call_llm, fetch_context, query_text, retrieve_knowledge, step_prompt, string_list,
    WorkflowContext, WorkflowFailure, WorkflowOutput, WorkflowResult,
};
use crate::engine::collaborators::Passage;
use crate::models::{
    AgentResult, AnalyzerSpec, Confidence, ErrorType, ExplorerResult, ExplorerSettings, Severity,
};

enum Step {
    FetchContext,
    RetrieveKnowledge,
    Triage,
    AnalyzePrimary,
    AnalyzeAll,
    Aggregate,
    Emit,
}

#[derive(Debug, Clone, PartialEq)]
struct Finding {
    analyzer: String,
    diagnosis: String,
    confidence: Confidence,
    severity: Severity,
    contributing_factors: Vec<String>,
    recommendations: Vec<String>,
    sources: Vec<String>,
    evidence_at: Option<DateTime<Utc>>,
    completion_order: usize,
}

#[derive(Default)]
struct ExplorationState {
    context: Value,
    /// Passages per analyzer name
    evidence: BTreeMap<String, Vec<Passage>>,
    triage_confidence: f64,
    triage_summary: String,
    findings: Vec<Finding>,
    result: Option<ExplorerResult>,
}

pub struct ExplorerWorkflow<'a> {
    settings: &'a ExplorerSettings,
}

impl<'a> ExplorerWorkflow<'a> {
    pub fn new(settings: &'a ExplorerSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowResult {
        if self.settings.analyzers.is_empty() {
            return Err(WorkflowFailure::new(
                ErrorType::AnalysisFailed,
                "explorer has no analyzers configured",
            ));
        }

        let mut state = ExplorationState::default();
        let mut step = Step::FetchContext;

        loop {
            step = match step {
                Step::FetchContext => {
                    ctx.report("fetching context");
                    state.context = fetch_context(ctx).await?;
                    Step::RetrieveKnowledge
                }
                Step::RetrieveKnowledge => {
                    let text = query_text(&ctx.request.input_data);
                    for analyzer in &self.settings.analyzers {
                        let domains = match &analyzer.knowledge_domain {
                            Some(domain) => vec![domain.clone()],
                            None => ctx.config.rag.domains.clone(),
                        };
                        let passages = retrieve_knowledge(ctx, &text, domains).await;
                        state.evidence.insert(analyzer.name.clone(), passages);
                    }
                    Step::Triage
                }
                Step::Triage => {
                    self.triage(ctx, &mut state).await?;
                    if state.triage_confidence >= self.settings.confidence_threshold {
                        Step::AnalyzePrimary
                    } else {
                        Step::AnalyzeAll
                    }
                }
                Step::AnalyzePrimary => {
                    let order = AtomicUsize::new(0);
                    let primary = &self.settings.analyzers[0];
                    let finding = self.analyze(ctx, &state, primary, &order).await;
                    state.findings.extend(finding);
                    Step::Aggregate
                }
                Step::AnalyzeAll => {
                    self.analyze_all(ctx, &mut state).await;
                    Step::Aggregate
                }
                Step::Aggregate => {
                    if state.findings.is_empty() {
                        return Err(WorkflowFailure::new(
                            ErrorType::AnalysisFailed,
                            "no analyzer produced a finding",
                        ));
                    }
                    state.result = Some(aggregate(&mut state.findings));
                    Step::Emit
                }
                Step::Emit => {
                    let Some(result) = state.result.take() else {
                        return Err(WorkflowFailure::new(ErrorType::AnalysisFailed, "nothing to emit"));
                    };
                    info!(
                        request_id = %ctx.request.request_id,
                        analyzers = state.findings.len(),
                        confidence = %result.confidence,
                        "exploration complete"
                    );
                    return Ok(WorkflowOutput {
                        result: AgentResult::Explorer(result),
                    });
                }
            };
        }
    }

    async fn triage(&self, ctx: &WorkflowContext, state: &mut ExplorationState) -> Result<(), WorkflowFailure> {
        let mut vars = ctx.base_variables(&state.context);
        let all: Vec<&Passage> = state.evidence.values().flatten().collect();
        vars.insert("knowledge".to_string(), json!(all));
        let prompt = step_prompt(
            ctx,
            &vars,
            "Task: triage\nAssess how confidently the problem can be identified from this \
             information alone. Return JSON: {\"confidence\": 0.0-1.0, \"summary\": \"...\"}",
        )?;
        let reply = call_llm(ctx, &ctx.completion_request(prompt), true).await?;
        let json = reply.json.unwrap_or(Value::Null);
        state.triage_confidence = Confidence::saturating(json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0)).value();
        state.triage_summary = json
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(
            request_id = %ctx.request.request_id,
            confidence = state.triage_confidence,
            threshold = self.settings.confidence_threshold,
            "triage"
        );
        Ok(())
    }

    async fn analyze_all(&self, ctx: &WorkflowContext, state: &mut ExplorationState) {
        let deadline = Instant::now() + Duration::from_millis(self.settings.analyzer_deadline_ms);
        let order = AtomicUsize::new(0);
        let shared: &ExplorationState = state;

        let runs = self.settings.analyzers.iter().map(|analyzer| {
            let order = &order;
            async move {
                match tokio::time::timeout_at(deadline, self.analyze(ctx, shared, analyzer, order)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            request_id = %ctx.request.request_id,
                            analyzer = %analyzer.name,
                            "analyzer missed the shared deadline"
                        );
                        None
                    }
                }
            }
        });
        let outcomes = join_all(runs).await;

        state.findings.extend(outcomes.into_iter().flatten());
    }

    /// One analyzer. Failures are logged and yield no finding. Usage lands on
    /// the context as each call completes, so a deadline cancelling this
    /// future keeps what was already spent.
    async fn analyze(
        &self,
        ctx: &WorkflowContext,
        state: &ExplorationState,
        analyzer: &AnalyzerSpec,
        order: &AtomicUsize,
    ) -> Option<Finding> {
        let passages = state.evidence.get(&analyzer.name).cloned().unwrap_or_default();

        let mut vars = ctx.base_variables(&state.context);
        vars.insert("knowledge".to_string(), json!(passages));
        vars.insert("analyzer".to_string(), json!(analyzer.name));
        vars.insert("focus".to_string(), json!(analyzer.focus));
        vars.insert("triage_summary".to_string(), json!(state.triage_summary));

        let instructions = format!(
            "Task: analyze ({})\nFocus on: {}\nReturn JSON: {{\"diagnosis\": \"...\", \
             \"confidence\": 0.0-1.0, \"severity\": \"low|medium|high|critical\", \
             \"contributing_factors\": [...], \"recommendations\": [...]}}",
            analyzer.name, analyzer.focus
        );
        let reply = match step_prompt(ctx, &vars, &instructions) {
            Ok(prompt) => call_llm(ctx, &ctx.completion_request(prompt), true).await,
            Err(failure) => Err(failure),
        };
        let json = match reply {
            Ok(reply) => reply.json.unwrap_or(Value::Null),
            Err(failure) => {
                warn!(request_id = %ctx.request.request_id, analyzer = %analyzer.name, "analyzer failed: {}", failure);
                return None;
            }
        };

        let diagnosis = json.get("diagnosis").and_then(Value::as_str).unwrap_or_default().trim().to_string();
        if diagnosis.is_empty() {
            warn!(request_id = %ctx.request.request_id, analyzer = %analyzer.name, "analyzer returned no diagnosis");
            return None;
        }

        let finding = Finding {
            analyzer: analyzer.name.clone(),
            diagnosis,
            confidence: Confidence::saturating(json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0)),
            severity: json
                .get("severity")
                .and_then(Value::as_str)
                .and_then(Severity::parse)
                .unwrap_or(Severity::Medium),
            contributing_factors: string_list(json.get("contributing_factors")),
            recommendations: string_list(json.get("recommendations")),
            sources: passages.iter().map(|p| p.source.clone()).collect(),
            evidence_at: passages.iter().filter_map(|p| p.published_at).max(),
            completion_order: order.fetch_add(1, Ordering::SeqCst),
        };
        Some(finding)
    }
}

/// Rank findings in place and fold them into one result.
fn aggregate(findings: &mut [Finding]) -> ExplorerResult {
    findings.sort_by(|a, b| {
        b.confidence
            .value()
            .total_cmp(&a.confidence.value())
            .then_with(|| b.evidence_at.cmp(&a.evidence_at))
            .then_with(|| a.completion_order.cmp(&b.completion_order))
    });

    let top = &findings[0];
    let mut factors = Vec::new();
    let mut recommendations = Vec::new();
    let mut sources = BTreeSet::new();
    for finding in findings.iter() {
        for factor in &finding.contributing_factors {
            if !factors.contains(factor) {
                factors.push(factor.clone());
            }
        }
        for recommendation in &finding.recommendations {
            if !recommendations.contains(recommendation) {
                recommendations.push(recommendation.clone());
            }
        }
        sources.extend(finding.sources.iter().cloned());
    }

    ExplorerResult {
        diagnosis: top.diagnosis.clone(),
        confidence: top.confidence,
        severity: top.severity,
        contributing_factors: factors,
        recommendations,
        rag_sources_used: sources.into_iter().collect(),
    }
}
