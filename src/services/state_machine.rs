//! Job status lifecycle.
//!
//! ```text
//! queued ──Start──▶ processing ──Complete──▶ completed
//!   │  ▲                 │
//!   │  └────Requeue──────┤
//!   │                    └──────Fail──────▶ failed
//!   └──Cancel──▶ cancelled
//! ```
//!
//! `Requeue` is the retry edge: a failed attempt below the retry maximum, or
//! an orphan found by the reconciler, goes back to `queued`. Terminal states
//! have no outgoing edge.

use chrono::{DateTime, Utc};

use crate::models::job::{Job, JobStatus};

/// A requested status change together with the data it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Complete { result_ref: String },
    Fail { error_detail: String },
    Cancel,
    Requeue,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Processing,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Cancel => JobStatus::Cancelled,
            Transition::Requeue => JobStatus::Queued,
        }
    }
}

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Queued, Processing)
            | (Queued, Cancelled)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Queued)
    )
}

/// Validate `transition` against the job's current status and return the
/// job as it looks afterwards. The input is left untouched so callers can
/// roll back by discarding the result.
pub fn apply(job: &Job, transition: Transition, now: DateTime<Utc>) -> Result<Job, TransitionError> {
    let to = transition.target();
    if !can_transition(job.status, to) {
        return Err(TransitionError::Illegal {
            job_id: job.id,
            from: job.status,
            to,
        });
    }

    let mut next = job.clone();
    next.status = to;
    match transition {
        Transition::Start => {
            // Set once; a retried job keeps the time of its first start.
            next.started_at.get_or_insert(now);
        }
        Transition::Complete { result_ref } => {
            next.result_ref = Some(result_ref);
            next.finished_at = Some(now);
        }
        Transition::Fail { error_detail } => {
            next.error_detail = Some(error_detail);
            next.finished_at = Some(now);
        }
        Transition::Cancel => {
            next.finished_at = Some(now);
        }
        Transition::Requeue => {
            next.attempt += 1;
        }
    }
    Ok(next)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    Illegal {
        job_id: uuid::Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}
