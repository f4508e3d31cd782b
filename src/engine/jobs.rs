//! Long-running extraction jobs
//!
//! [`JobTracker::start_job`] runs a request on the execution context in the
//! background and returns immediately with a job id. Callers then either poll
//! [`JobTracker::poll_status`] or follow [`JobTracker::progress_stream`],
//! which yields progress events for that job until it completes or fails.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::dispatcher::{AgentExecutor, DispatchStatus};
use crate::models::{AgentRequestEvent, JobProgressEvent, JobState, JobStatus};
use crate::{AiModelError, Result};

/// Job statuses plus the broadcast feed of their changes.
///
/// Finished jobs stay pollable for `finished_ttl`, and at most
/// `max_finished` of them are kept. Running jobs are never pruned.
#[derive(Clone)]
pub struct JobRegistry {
    statuses: Arc<DashMap<Uuid, JobStatus>>,
    sender: broadcast::Sender<JobProgressEvent>,
    finished_ttl: Duration,
    max_finished: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

impl JobRegistry {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            statuses: Arc::new(DashMap::new()),
            sender,
            finished_ttl: Duration::hours(1),
            max_finished: 1024,
        }
    }

    pub fn with_retention(mut self, finished_ttl: Duration, max_finished: usize) -> Self {
        self.finished_ttl = finished_ttl;
        self.max_finished = max_finished;
        self
    }

    pub fn register(&self, request: &AgentRequestEvent) -> Uuid {
        self.prune();
        let job_id = Uuid::new_v4();
        let status = JobStatus::new(job_id, &request.request_id, &request.agent_id);
        self.statuses.insert(job_id, status);
        job_id
    }

    /// Drop finished jobs past their TTL, then the oldest finished ones
    /// beyond the cap. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now() - self.finished_ttl;
        let mut removed = 0;
        self.statuses.retain(|_, status| {
            let expired = status.state.is_terminal() && status.updated_at < cutoff;
            removed += usize::from(expired);
            !expired
        });

        let mut finished: Vec<(DateTime<Utc>, Uuid)> = self
            .statuses
            .iter()
            .filter(|entry| entry.state.is_terminal())
            .map(|entry| (entry.updated_at, *entry.key()))
            .collect();
        if finished.len() > self.max_finished {
            finished.sort();
            let excess = finished.len() - self.max_finished;
            for (_, job_id) in finished.into_iter().take(excess) {
                if self.statuses.remove(&job_id).is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.statuses.len(), "pruned finished jobs");
        }
        removed
    }

    pub fn status(&self, job_id: &Uuid) -> Option<JobStatus> {
        self.statuses.get(job_id).map(|entry| entry.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Apply `change` and broadcast the result. Terminal jobs are frozen.
    pub fn update(&self, job_id: &Uuid, change: impl FnOnce(&mut JobStatus)) {
        let event = {
            let Some(mut entry) = self.statuses.get_mut(job_id) else {
                warn!(%job_id, "progress for unknown job");
                return;
            };
            if entry.state.is_terminal() {
                return;
            }
            change(&mut entry);
            entry.updated_at = Utc::now();
            JobProgressEvent::from(&*entry)
        };
        debug!(%job_id, state = ?event.state, percent = event.progress_percent, "job progress");
        let _ = self.sender.send(event);
    }

    pub fn reporter(&self, job_id: Uuid) -> ProgressReporter {
        ProgressReporter {
            registry: self.clone(),
            job_id,
        }
    }
}

/// Handle a workflow uses to report progress on its job.
#[derive(Clone)]
pub struct ProgressReporter {
    registry: JobRegistry,
    job_id: Uuid,
}

impl ProgressReporter {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn running(&self, message: &str) {
        self.registry.update(&self.job_id, |status| {
            status.state = JobState::Running;
            status.message = message.to_string();
        });
    }

    pub fn pages_total(&self, total: u32) {
        self.registry.update(&self.job_id, |status| {
            status.state = JobState::Running;
            status.pages_total = total;
        });
    }

    pub fn page_done(&self, processed: u32) {
        self.registry.update(&self.job_id, |status| {
            status.pages_processed = processed;
            if status.pages_total > 0 {
                // the last few percent are left for validation and publishing
                let ratio = processed.min(status.pages_total) as f64 / status.pages_total as f64;
                status.progress_percent = (ratio * 90.0).round() as u8;
            }
            status.message = format!("extracted page {} of {}", processed, status.pages_total);
        });
    }

    pub fn completed(&self, message: &str) {
        self.registry.update(&self.job_id, |status| {
            status.state = JobState::Completed;
            status.progress_percent = 100;
            status.message = message.to_string();
        });
    }

    pub fn failed(&self, error: &str) {
        self.registry.update(&self.job_id, |status| {
            status.state = JobState::Failed;
            status.message = "failed".to_string();
            status.error = Some(error.to_string());
        });
    }
}

pub struct JobTracker {
    registry: JobRegistry,
    executor: Arc<AgentExecutor>,
    runtime: tokio::runtime::Handle,
}

impl JobTracker {
    /// `runtime` is where jobs run, normally the execution context's handle.
    pub fn new(executor: Arc<AgentExecutor>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            registry: JobRegistry::default(),
            executor,
            runtime,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn start_job(&self, request: AgentRequestEvent) -> Result<Uuid> {
        request
            .validate()
            .map_err(|e| AiModelError::InvalidInput(e.to_string()))?;

        let job_id = self.registry.register(&request);
        let reporter = self.registry.reporter(job_id);
        let executor = self.executor.clone();

        self.runtime.spawn(async move {
            reporter.running("started");
            match executor.dispatch_with_progress(&request, Some(reporter.clone())).await {
                Ok(outcome) => match outcome.status {
                    DispatchStatus::Completed { .. } => reporter.completed("completed"),
                    DispatchStatus::Failed { error_type, message } => {
                        reporter.failed(&format!("{}: {}", error_type, message))
                    }
                },
                Err(e) => reporter.failed(&e.to_string()),
            }
        });
        Ok(job_id)
    }

    pub fn poll_status(&self, job_id: &Uuid) -> Option<JobStatus> {
        self.registry.status(job_id)
    }

    /// Progress events for one job, ending after its terminal event.
    ///
    /// The current status is yielded first so late subscribers still see
    /// where the job stands (and a finished job yields exactly one event).
    pub fn progress_stream(&self, job_id: Uuid) -> impl Stream<Item = JobProgressEvent> + Send + 'static {
        let live = BroadcastStream::new(self.registry.subscribe());
        let snapshot = self.registry.status(&job_id).map(|status| JobProgressEvent::from(&status));
        let already_done = snapshot.as_ref().map_or(true, |event| event.state.is_terminal());

        let head = stream::iter(snapshot);
        let tail = stream::unfold((live, already_done), move |(mut live, done)| async move {
            if done {
                return None;
            }
            loop {
                match live.next().await {
                    Some(Ok(event)) if event.job_id == job_id => {
                        let terminal = event.state.is_terminal();
                        return Some((event, (live, terminal)));
                    }
                    Some(Ok(_)) => continue,
                    // lagged; keep following
                    Some(Err(_)) => continue,
                    None => return None,
                }
            }
        });
        head.chain(tail)
    }
}
