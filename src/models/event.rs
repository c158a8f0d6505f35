use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Status-change event pushed to notification subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub subject_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub attempt: i32,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Snapshot the notifiable fields of a job as it was just persisted.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            subject_id: job.subject_id.clone(),
            status: job.status,
            result_ref: job.result_ref.clone(),
            error_detail: job.error_detail.clone(),
            attempt: job.attempt,
            timestamp: Utc::now(),
        }
    }
}
