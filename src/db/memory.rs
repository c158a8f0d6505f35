use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::store::{JobAudit, JobStore, StoreError};
use crate::models::job::{Job, JobStatus};
use crate::models::report::StatusBreakdown;

struct Row {
    job: Job,
    /// Status as stored; diverges from `job.status` only when corrupted.
    raw_status: Option<String>,
}

impl Row {
    fn audit(&self) -> JobAudit {
        JobAudit {
            id: self.job.id,
            subject_id: self.job.subject_id.clone(),
            raw_status: self.raw_status.clone(),
            attempt: self.job.attempt,
            submitted_at: self.job.submitted_at,
            finished_at: self.job.finished_at,
            has_result: self.job.result_ref.is_some(),
            has_error: self.job.error_detail.is_some(),
        }
    }

    fn status(&self) -> Option<JobStatus> {
        self.raw_status.as_deref().and_then(|s| s.parse().ok())
    }
}

/// In-process job store for tests and single-node local runs.
///
/// Writes can be made to fail on demand, and a row's status can be
/// overwritten with arbitrary text to simulate damaged records.
#[derive(Default)]
pub struct MemoryJobStore {
    rows: Mutex<HashMap<Uuid, Row>>,
    fail_writes: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the stored status text of a row, bypassing validation.
    pub async fn set_raw_status(&self, id: Uuid, status: Option<&str>) {
        if let Some(row) = self.rows.lock().await.get_mut(&id) {
            row.raw_status = status.map(str::to_string);
        }
    }

    /// Insert a row in whatever status it carries. Ignores `set_fail_writes`.
    pub async fn put(&self, job: Job) {
        let raw_status = Some(job.status.to_string());
        self.rows.lock().await.insert(job.id, Row { job, raw_status });
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut rows = self.rows.lock().await;
        rows.insert(
            job.id,
            Row {
                job: job.clone(),
                raw_status: Some(job.status.to_string()),
            },
        );
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let rows = self.rows.lock().await;
        match rows.get(&id) {
            Some(row) => {
                let status = row.status().ok_or_else(|| StoreError::InvalidStatus {
                    job_id: id,
                    status: row.raw_status.clone(),
                })?;
                let mut job = row.job.clone();
                job.status = status;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        job: &Job,
        expected: JobStatus,
        expected_attempt: i32,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;
        if row.status() != Some(expected) || row.job.attempt != expected_attempt {
            return Err(StoreError::Conflict {
                job_id: job.id,
                expected,
                attempt: expected_attempt,
            });
        }
        row.job = job.clone();
        row.raw_status = Some(job.status.to_string());
        Ok(())
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = self.rows.lock().await;
        let mut jobs: Vec<Job> = rows
            .values()
            .filter(|row| row.status() == Some(status))
            .map(|row| {
                let mut job = row.job.clone();
                job.status = status;
                job
            })
            .collect();
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }

    async fn find_recent_by_subject(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobAudit>, StoreError> {
        let rows = self.rows.lock().await;
        let mut audits: Vec<JobAudit> = rows
            .values()
            .filter(|row| row.job.subject_id == subject_id && row.job.submitted_at >= since)
            .map(Row::audit)
            .collect();
        audits.sort_by_key(|a| a.submitted_at);
        Ok(audits)
    }

    async fn audit_scope(&self, scope_id: &str) -> Result<Vec<JobAudit>, StoreError> {
        let rows = self.rows.lock().await;
        let mut audits: Vec<JobAudit> = rows
            .values()
            .filter(|row| row.job.owner.project_id.as_deref() == Some(scope_id))
            .map(Row::audit)
            .collect();
        audits.sort_by_key(|a| a.submitted_at);
        Ok(audits)
    }

    async fn repair_status(&self, id: Uuid, status: JobStatus) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.status().is_some() {
            return Ok(false);
        }
        row.job.status = status;
        row.raw_status = Some(status.to_string());
        Ok(true)
    }

    async fn count_by_status(&self) -> Result<StatusBreakdown, StoreError> {
        let rows = self.rows.lock().await;
        let mut breakdown = StatusBreakdown::default();
        for row in rows.values() {
            breakdown.add(row.status(), 1);
        }
        Ok(breakdown)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{OwnerContext, SegmentationPayload, SubmitRequest};

    fn job(subject: &str) -> Job {
        Job::new(
            SubmitRequest::new(subject, SegmentationPayload::default(), 0)
                .with_owner(OwnerContext::new("p-1", "u-1")),
        )
    }

    #[tokio::test]
    async fn test_update_requires_expected_status() {
        let store = MemoryJobStore::new();
        let mut j = job("img-1");
        store.insert(&j).await.unwrap();

        j.status = JobStatus::Processing;
        let err = store.update(&j, JobStatus::Processing, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        store.update(&j, JobStatus::Queued, 0).await.unwrap();
        let loaded = store.load(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_update_requires_expected_attempt() {
        let store = MemoryJobStore::new();
        let mut j = job("img-1");
        j.status = JobStatus::Processing;
        j.attempt = 1;
        store.put(j.clone()).await;

        // A writer holding the attempt-0 copy must not overwrite attempt 1.
        let mut stale = j.clone();
        stale.status = JobStatus::Queued;
        stale.attempt = 1;
        let err = store
            .update(&stale, JobStatus::Processing, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { attempt: 0, .. }));
        assert_eq!(
            store.load(j.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        store.update(&stale, JobStatus::Processing, 1).await.unwrap();
        assert_eq!(
            store.load(j.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_failed_writes_leave_rows_untouched() {
        let store = MemoryJobStore::new();
        let mut j = job("img-1");
        store.insert(&j).await.unwrap();
        store.set_fail_writes(true);

        j.status = JobStatus::Cancelled;
        assert!(matches!(
            store.update(&j, JobStatus::Queued, 0).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_fail_writes(false);
        assert_eq!(
            store.load(j.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_repair_only_touches_unreadable_status() {
        let store = MemoryJobStore::new();
        let j = job("img-1");
        store.insert(&j).await.unwrap();
        assert!(!store.repair_status(j.id, JobStatus::Queued).await.unwrap());

        store.set_raw_status(j.id, Some("segmented")).await;
        assert!(store.load(j.id).await.is_err());
        assert!(store.repair_status(j.id, JobStatus::Queued).await.unwrap());
        assert_eq!(
            store.load(j.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_breakdown_counts_unknown() {
        let store = MemoryJobStore::new();
        let a = job("a");
        let b = job("b");
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        store.set_raw_status(b.id, None).await;

        let breakdown = store.count_by_status().await.unwrap();
        assert_eq!(breakdown.queued, 1);
        assert_eq!(breakdown.unknown, 1);
        assert_eq!(breakdown.total(), 2);
    }
}
