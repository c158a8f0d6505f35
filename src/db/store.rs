use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::report::StatusBreakdown;

/// Minimal view of a persisted row, tolerant of a missing or unknown status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobAudit {
    pub id: Uuid,
    pub subject_id: String,
    pub raw_status: Option<String>,
    pub attempt: i32,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub has_result: bool,
    pub has_error: bool,
}

impl JobAudit {
    /// Parsed status, `None` if missing or not a known value.
    pub fn status(&self) -> Option<JobStatus> {
        self.raw_status.as_deref().and_then(|s| s.parse().ok())
    }

    /// Status implied by the outcome fields of a row whose status is unreadable.
    pub fn implied_status(&self) -> JobStatus {
        if self.has_result {
            JobStatus::Completed
        } else if self.has_error {
            JobStatus::Failed
        } else if self.finished_at.is_some() {
            JobStatus::Cancelled
        } else {
            JobStatus::Queued
        }
    }
}

/// Durable record of every job. Every write is a single row update keyed by
/// job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly created job.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Overwrite the job row only if it is still at `expected` status and
    /// `expected_attempt`. Fails with [`StoreError::Conflict`] otherwise.
    ///
    /// The attempt is part of the guard because a retried job passes through
    /// `processing` once per attempt.
    async fn update(
        &self,
        job: &Job,
        expected: JobStatus,
        expected_attempt: i32,
    ) -> Result<(), StoreError>;

    /// Jobs currently in `status`, oldest submission first.
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    async fn find_recent_by_subject(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobAudit>, StoreError>;

    /// Every job belonging to a project scope.
    async fn audit_scope(&self, scope_id: &str) -> Result<Vec<JobAudit>, StoreError>;

    /// Force a status onto a row whose status is missing or invalid.
    /// Returns false if the row already held a valid status.
    async fn repair_status(&self, id: Uuid, status: JobStatus) -> Result<bool, StoreError>;

    async fn count_by_status(&self) -> Result<StatusBreakdown, StoreError>;

    /// Connectivity probe for health checks.
    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {job_id} is no longer {expected} at attempt {attempt}")]
    Conflict {
        job_id: Uuid,
        expected: JobStatus,
        attempt: i32,
    },

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} has unreadable status {status:?}")]
    InvalidStatus {
        job_id: Uuid,
        status: Option<String>,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
