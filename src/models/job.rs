use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Pollable status of a long-running extraction job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub request_id: String,
    pub agent_id: String,
    pub state: JobState,
    pub progress_percent: u8,
    pub pages_total: u32,
    pub pages_processed: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn new(job_id: Uuid, request_id: &str, agent_id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            request_id: request_id.to_string(),
            agent_id: agent_id.to_string(),
            state: JobState::Pending,
            progress_percent: 0,
            pages_total: 0,
            pages_processed: 0,
            message: "queued".to_string(),
            error: None,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Incremental progress pushed to job subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgressEvent {
    pub job_id: Uuid,
    pub state: JobState,
    pub progress_percent: u8,
    pub pages_total: u32,
    pub pages_processed: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&JobStatus> for JobProgressEvent {
    fn from(status: &JobStatus) -> Self {
        Self {
            job_id: status.job_id,
            state: status.state,
            progress_percent: status.progress_percent,
            pages_total: status.pages_total,
            pages_processed: status.pages_processed,
            message: status.message.clone(),
            timestamp: status.updated_at,
        }
    }
}
