use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::db::store::{JobAudit, JobStore, StoreError};
use crate::models::job::{Job, JobStatus};
use crate::models::report::StatusBreakdown;

/// [`JobStore`] backed by the `segmentation_jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        queries::insert_job(&self.pool, job).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        queries::get_job(&self.pool, id).await
    }

    async fn update(
        &self,
        job: &Job,
        expected: JobStatus,
        expected_attempt: i32,
    ) -> Result<(), StoreError> {
        let touched =
            queries::update_job_if_status(&self.pool, job, expected, expected_attempt).await?;
        if touched == 1 {
            return Ok(());
        }
        if queries::job_exists(&self.pool, job.id).await? {
            Err(StoreError::Conflict {
                job_id: job.id,
                expected,
                attempt: expected_attempt,
            })
        } else {
            Err(StoreError::NotFound(job.id))
        }
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        queries::get_jobs_by_status(&self.pool, status).await
    }

    async fn find_recent_by_subject(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobAudit>, StoreError> {
        queries::get_recent_for_subject(&self.pool, subject_id, since).await
    }

    async fn audit_scope(&self, scope_id: &str) -> Result<Vec<JobAudit>, StoreError> {
        queries::get_scope_audit(&self.pool, scope_id).await
    }

    async fn repair_status(&self, id: Uuid, status: JobStatus) -> Result<bool, StoreError> {
        Ok(queries::repair_status(&self.pool, id, status).await? == 1)
    }

    async fn count_by_status(&self) -> Result<StatusBreakdown, StoreError> {
        let mut breakdown = StatusBreakdown::default();
        for (raw, count) in queries::count_by_status(&self.pool).await? {
            let status = raw.as_deref().and_then(|s| s.parse().ok());
            breakdown.add(status, count.max(0) as u64);
        }
        Ok(breakdown)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
