use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use estimator_core::EstimateId;
use estimator_infra::jobs::{Job, JobFailure, JobId, JobProgress, JobState};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub image_path: String,
    pub estimate_id: EstimateId,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBatchRequest {
    pub image_paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<JsonValue>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub status_url: String,
}

impl JobAccepted {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status_url: format!("/api/jobs/{job_id}"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub task: String,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: Option<JobProgress>,
    pub result: Option<JsonValue>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            task: job.task,
            state: job.state,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            progress: job.progress,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
