use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobStatus;

/// Read-only view of the scheduler used for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue_length: usize,
    pub processing_count: usize,
    pub max_concurrent: usize,
    /// Running jobs in dispatch order.
    pub running_job_ids: Vec<Uuid>,
    pub queued_job_ids_in_order: Vec<Uuid>,
}

/// Count of persisted jobs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Rows whose status is missing or not a known value.
    pub unknown: u64,
}

impl StatusBreakdown {
    pub fn add(&mut self, status: Option<JobStatus>, count: u64) {
        let slot = match status {
            Some(JobStatus::Queued) => &mut self.queued,
            Some(JobStatus::Processing) => &mut self.processing,
            Some(JobStatus::Completed) => &mut self.completed,
            Some(JobStatus::Failed) => &mut self.failed,
            Some(JobStatus::Cancelled) => &mut self.cancelled,
            None => &mut self.unknown,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.cancelled + self.unknown
    }
}

/// Kind of drift detected between persisted status and reality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    WithoutStatus,
    InvalidStatus,
    Orphaned,
}

/// One detected inconsistency and what was (or would be) done about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub job_id: Uuid,
    pub subject_id: String,
    pub kind: IssueKind,
    /// Persisted status text as found, if any.
    pub found_status: Option<String>,
    /// Status the job was (or would be) repaired to.
    pub repaired_to: JobStatus,
    pub fixed: bool,
}

/// Result of a consistency check or fix over one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub scope_id: String,
    pub total_jobs: usize,
    pub without_status: usize,
    pub invalid_status: usize,
    pub orphaned: usize,
    pub fixed_issues: usize,
    pub dry_run: bool,
    pub issues: Vec<ConsistencyIssue>,
}

/// Outcome of one orphan-recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub orphaned: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Orphan repairs that lost an optimistic race and were skipped.
    pub skipped: usize,
    pub breakdown: StatusBreakdown,
}

impl ReconcileReport {
    pub fn fixed_issues(&self) -> usize {
        self.requeued + self.failed
    }
}
