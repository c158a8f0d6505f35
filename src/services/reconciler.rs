//! Repairs drift between persisted job status and what this process is
//! actually doing.
//!
//! After a restart every `processing` row is an orphan: nothing in memory is
//! running it. The reconciler requeues orphans that still have retries left
//! and fails the rest. It also restores `queued` rows into the scheduler's
//! queue, and audits project scopes for rows whose status is missing or
//! unreadable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{JobAudit, JobStore, StoreError};
use crate::models::job::{Job, JobStatus};
use crate::models::report::{ConsistencyIssue, ConsistencyReport, IssueKind, ReconcileReport};
use crate::services::scheduler::Scheduler;
use crate::services::state_machine::{self, Transition};

/// Error detail recorded on orphans that are out of retries.
pub const ORPHANED_ERROR: &str = "orphaned after restart";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period of the background orphan sweep.
    pub interval: Duration,
    /// How far back `verify_recent_submissions` looks.
    pub recent_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            recent_window: Duration::from_secs(3600),
        }
    }
}

pub struct Reconciler {
    scheduler: Scheduler,
    store: Arc<dyn JobStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(scheduler: Scheduler, config: ReconcilerConfig) -> Self {
        let store = Arc::clone(scheduler.store());
        Self {
            scheduler,
            store,
            config,
        }
    }

    /// Startup repair: reload the queue from the store, then recover orphans.
    pub async fn startup(&self) -> Result<ReconcileReport, StoreError> {
        let restored = self.restore_queued().await?;
        let report = self.reconcile_orphans().await?;
        tracing::info!(
            restored,
            orphaned = report.orphaned,
            requeued = report.requeued,
            failed = report.failed,
            queued = report.breakdown.queued,
            processing = report.breakdown.processing,
            completed = report.breakdown.completed,
            "Startup reconciliation complete"
        );
        Ok(report)
    }

    /// Load every persisted `queued` job into the scheduler's queue.
    pub async fn restore_queued(&self) -> Result<usize, StoreError> {
        let queued = self.store.find_by_status(JobStatus::Queued).await?;
        Ok(self.scheduler.restore(queued))
    }

    /// Requeue or fail every `processing` job that holds no slot here.
    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport, StoreError> {
        let processing = self.store.find_by_status(JobStatus::Processing).await?;
        // Taken after the query: a job dispatched in between was still
        // `queued` in the store when we read it.
        let running = self.scheduler.running_ids();

        let mut report = ReconcileReport::default();
        for job in processing.iter().filter(|j| !running.contains(&j.id)) {
            report.orphaned += 1;
            match self.repair_orphan(job).await? {
                Some(JobStatus::Queued) => report.requeued += 1,
                Some(_) => report.failed += 1,
                None => report.skipped += 1,
            }
        }
        report.breakdown = self.store.count_by_status().await?;

        if report.orphaned > 0 {
            metrics::counter!("segmentation_orphans_repaired_total")
                .increment(report.fixed_issues() as u64);
        }
        Ok(report)
    }

    /// Returns the status the orphan was moved to, or `None` if the row
    /// changed underneath us.
    ///
    /// `job` must have been read before this call. If that attempt is live it
    /// either holds a slot now or has already written past `job.attempt`, and
    /// the attempt-guarded write below then conflicts.
    async fn repair_orphan(&self, job: &Job) -> Result<Option<JobStatus>, StoreError> {
        if self.scheduler.is_running(&job.id) {
            return Ok(None);
        }
        let transition = if job.attempt < self.scheduler.config().max_retries {
            Transition::Requeue
        } else {
            Transition::Fail {
                error_detail: ORPHANED_ERROR.to_string(),
            }
        };
        let next = match state_machine::apply(job, transition, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Rejected illegal transition");
                return Ok(None);
            }
        };

        match self
            .store
            .update(&next, JobStatus::Processing, job.attempt)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        tracing::warn!(
            job_id = %next.id,
            subject_id = %next.subject_id,
            attempt = next.attempt,
            repaired_to = %next.status,
            "Recovered orphaned job"
        );
        self.scheduler.notify(&next);
        if next.status == JobStatus::Queued {
            self.scheduler.restore(vec![next.clone()]);
        }
        Ok(Some(next.status))
    }

    /// Report inconsistencies in a project scope without changing anything.
    pub async fn check_consistency(&self, scope_id: &str) -> Result<ConsistencyReport, StoreError> {
        self.inspect(scope_id, false).await
    }

    /// Detect and repair inconsistencies in a project scope. With `dry_run`
    /// the report lists what would be repaired.
    pub async fn fix_consistency(
        &self,
        scope_id: &str,
        dry_run: bool,
    ) -> Result<ConsistencyReport, StoreError> {
        self.inspect(scope_id, !dry_run).await
    }

    async fn inspect(&self, scope_id: &str, repair: bool) -> Result<ConsistencyReport, StoreError> {
        let audits = self.store.audit_scope(scope_id).await?;
        let running = self.scheduler.running_ids();

        let mut report = ConsistencyReport {
            scope_id: scope_id.to_string(),
            total_jobs: audits.len(),
            dry_run: !repair,
            ..Default::default()
        };

        for audit in &audits {
            let Some(mut issue) = self.classify(audit, &running) else {
                continue;
            };
            match issue.kind {
                IssueKind::WithoutStatus => report.without_status += 1,
                IssueKind::InvalidStatus => report.invalid_status += 1,
                IssueKind::Orphaned => report.orphaned += 1,
            }
            tracing::warn!(
                job_id = %issue.job_id,
                kind = ?issue.kind,
                found = ?issue.found_status,
                "Consistency issue detected"
            );

            if repair {
                issue.fixed = self.repair(&issue).await?;
                if issue.fixed {
                    report.fixed_issues += 1;
                }
            }
            report.issues.push(issue);
        }

        Ok(report)
    }

    fn classify(&self, audit: &JobAudit, running: &HashSet<Uuid>) -> Option<ConsistencyIssue> {
        let kind = match (&audit.raw_status, audit.status()) {
            (None, _) => IssueKind::WithoutStatus,
            (Some(_), None) => IssueKind::InvalidStatus,
            (Some(_), Some(JobStatus::Processing)) if !running.contains(&audit.id) => {
                IssueKind::Orphaned
            }
            _ => return None,
        };
        let repaired_to = match kind {
            IssueKind::Orphaned if audit.attempt < self.scheduler.config().max_retries => {
                JobStatus::Queued
            }
            IssueKind::Orphaned => JobStatus::Failed,
            _ => audit.implied_status(),
        };
        Some(ConsistencyIssue {
            job_id: audit.id,
            subject_id: audit.subject_id.clone(),
            kind,
            found_status: audit.raw_status.clone(),
            repaired_to,
            fixed: false,
        })
    }

    async fn repair(&self, issue: &ConsistencyIssue) -> Result<bool, StoreError> {
        match issue.kind {
            IssueKind::Orphaned => match self.store.load(issue.job_id).await? {
                Some(job) if job.status == JobStatus::Processing => {
                    Ok(self.repair_orphan(&job).await?.is_some())
                }
                _ => Ok(false),
            },
            IssueKind::WithoutStatus | IssueKind::InvalidStatus => {
                if !self
                    .store
                    .repair_status(issue.job_id, issue.repaired_to)
                    .await?
                {
                    return Ok(false);
                }
                tracing::info!(
                    job_id = %issue.job_id,
                    repaired_to = %issue.repaired_to,
                    "Repaired job status"
                );
                if let Some(job) = self.store.load(issue.job_id).await? {
                    self.scheduler.notify(&job);
                    if job.status == JobStatus::Queued {
                        self.scheduler.restore(vec![job]);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Jobs for `subject_id` inside the recent window whose status is
    /// missing or unreadable, which points at a failed write during submission.
    pub async fn verify_recent_submissions(
        &self,
        subject_id: &str,
    ) -> Result<Vec<JobAudit>, StoreError> {
        let window = chrono::Duration::from_std(self.config.recent_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let since = Utc::now() - window;
        let missing: Vec<JobAudit> = self
            .store
            .find_recent_by_subject(subject_id, since)
            .await?
            .into_iter()
            .filter(|audit| audit.status().is_none())
            .collect();

        for audit in &missing {
            tracing::warn!(
                job_id = %audit.id,
                subject_id,
                found = ?audit.raw_status,
                "Recent job has no readable status"
            );
        }
        Ok(missing)
    }

    /// Sweep for orphans every `interval` until `cancel` fires. Each tick
    /// also runs a dispatch pass so rolled-back jobs are retried.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        // The first tick completes immediately; startup already reconciled.
        ticker.tick().await;
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.reconcile_orphans().await {
                        Ok(report) if report.orphaned > 0 => {
                            tracing::warn!(
                                orphaned = report.orphaned,
                                requeued = report.requeued,
                                failed = report.failed,
                                "Reconciliation repaired orphaned jobs"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Reconciliation cycle failed"),
                    }
                    self.scheduler.dispatch();
                }
            }
        }
    }
}
