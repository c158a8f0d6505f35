//! Segmentation job scheduler.
//!
//! All queue and slot bookkeeping lives in one [`SchedulerState`] behind a
//! `std::sync::Mutex`. The lock is only held for in-memory edits and is never
//! held across an `.await`; store writes and inference happen outside it.
//!
//! A dispatch pass moves jobs from the priority queue into free slots and
//! spawns one execution task per job. The task persists the `processing`
//! transition, awaits the [`InferenceInvoker`], applies the outcome through
//! the state machine, and runs the next dispatch pass.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use garde::Validate;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{Job, JobStatus, OwnerContext, SegmentationPayload, SubmitRequest};
use crate::models::report::QueueSnapshot;
use crate::services::inference::{InferenceInvoker, InferenceOutcome};
use crate::services::notifier::NotifierHandle;
use crate::services::priority_queue::PriorityQueue;
use crate::services::state_machine::{self, Transition, TransitionError};

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of jobs allowed in `processing` at once.
    pub max_concurrent: usize,
    /// Failed attempts that are retried before a job is marked `failed`.
    pub max_retries: i32,
    /// Extra tries for a completion write before the job is left to the
    /// reconciler.
    pub store_retry_attempts: u32,
    pub store_retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 3,
            store_retry_attempts: 3,
            store_retry_backoff: Duration::from_millis(200),
        }
    }
}

struct RunningSlot {
    /// Dispatch order, for stable snapshots.
    seq: u64,
}

struct SchedulerState {
    queue: PriorityQueue,
    running: HashMap<Uuid, RunningSlot>,
    next_seq: u64,
    accepting: bool,
}

impl SchedulerState {
    fn record_gauges(&self) {
        metrics::gauge!("segmentation_queue_depth").set(self.queue.len() as f64);
        metrics::gauge!("segmentation_jobs_processing").set(self.running.len() as f64);
    }
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    invoker: InferenceInvoker,
    notifier: NotifierHandle,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

/// Handle to a scheduler instance. Clones share the same queue and slots.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        invoker: InferenceInvoker,
        notifier: NotifierHandle,
    ) -> Self {
        let config = SchedulerConfig {
            max_concurrent: config.max_concurrent.max(1),
            max_retries: config.max_retries.max(0),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                invoker,
                notifier,
                state: Mutex::new(SchedulerState {
                    queue: PriorityQueue::new(),
                    running: HashMap::new(),
                    next_seq: 0,
                    accepting: true,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        // Critical sections never panic midway, so a poisoned lock still
        // holds consistent state.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate, persist, and queue one segmentation job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, SchedulerError> {
        request.validate()?;
        if !self.state().accepting {
            return Err(SchedulerError::ShuttingDown);
        }

        let job = Job::new(request);
        self.inner.store.insert(&job).await.map_err(|e| {
            tracing::error!(subject_id = %job.subject_id, error = %e, "Failed to persist new job");
            e
        })?;

        tracing::info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            priority = job.priority,
            "Segmentation job queued"
        );
        metrics::counter!("segmentation_jobs_submitted_total").increment(1);

        {
            let mut state = self.state();
            state.queue.enqueue(job.clone());
            state.record_gauges();
        }
        self.inner.notifier.notify(&job);
        self.dispatch();

        Ok(job.id)
    }

    /// Submit one job per subject with shared parameters.
    ///
    /// Every request is validated before anything is persisted. A store
    /// failure part-way leaves the earlier jobs submitted and returns the error.
    pub async fn submit_batch<S: AsRef<str>>(
        &self,
        subject_ids: &[S],
        payload: SegmentationPayload,
        priority: i32,
        owner: OwnerContext,
    ) -> Result<Vec<Uuid>, SchedulerError> {
        let requests: Vec<SubmitRequest> = subject_ids
            .iter()
            .map(|subject| {
                SubmitRequest::new(subject.as_ref(), payload.clone(), priority)
                    .with_owner(owner.clone())
            })
            .collect();
        for request in &requests {
            request.validate()?;
        }

        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.submit(request).await?);
        }
        tracing::info!(count = ids.len(), "Batch submitted");
        Ok(ids)
    }

    /// Cancel a job that has not started yet.
    ///
    /// Returns `Ok(false)` for jobs that are running, finished, unknown, or
    /// already cancelled.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, SchedulerError> {
        let removed = {
            let mut state = self.state();
            let removed = state.queue.remove(&job_id);
            state.record_gauges();
            removed
        };
        let Some(job) = removed else {
            return Ok(false);
        };

        let cancelled = match state_machine::apply(&job, Transition::Cancel, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Rejected illegal transition");
                self.state().queue.enqueue(job);
                return Err(e.into());
            }
        };

        match self
            .inner
            .store
            .update(&cancelled, JobStatus::Queued, job.attempt)
            .await
        {
            Ok(()) => {}
            Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                // The durable record moved on without us; drop the stale copy.
                tracing::warn!(job_id = %job_id, error = %e, "Queued job was not queued in store");
                return Ok(false);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to persist cancellation");
                self.state().queue.enqueue(job);
                return Err(e.into());
            }
        }

        tracing::info!(job_id = %job_id, subject_id = %cancelled.subject_id, "Segmentation job cancelled");
        metrics::counter!("segmentation_jobs_cancelled_total").increment(1);
        self.inner.notifier.notify(&cancelled);
        self.dispatch();
        Ok(true)
    }

    /// Consistent copy of the queue and slot state.
    pub fn status(&self) -> QueueSnapshot {
        let state = self.state();
        let mut running: Vec<(u64, Uuid)> = state
            .running
            .iter()
            .map(|(id, slot)| (slot.seq, *id))
            .collect();
        running.sort_unstable();

        QueueSnapshot {
            queue_length: state.queue.len(),
            processing_count: state.running.len(),
            max_concurrent: self.inner.config.max_concurrent,
            running_job_ids: running.into_iter().map(|(_, id)| id).collect(),
            queued_job_ids_in_order: state.queue.ids_in_order(),
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, SchedulerError> {
        Ok(self.inner.store.load(job_id).await?)
    }

    /// Ids of jobs holding a slot in this process.
    pub fn running_ids(&self) -> HashSet<Uuid> {
        self.state().running.keys().copied().collect()
    }

    pub fn is_running(&self, job_id: &Uuid) -> bool {
        self.state().running.contains_key(job_id)
    }

    /// Publish a status event for a transition persisted outside the scheduler.
    pub(crate) fn notify(&self, job: &Job) {
        self.inner.notifier.notify(job);
    }

    /// Put persisted `queued` jobs back into the in-memory queue, skipping
    /// any that hold a slot or are queued already. Returns how many were added.
    pub fn restore(&self, jobs: Vec<Job>) -> usize {
        let added = {
            let mut state = self.state();
            let mut added = 0;
            for job in jobs {
                if job.status != JobStatus::Queued || state.running.contains_key(&job.id) {
                    continue;
                }
                if state.queue.enqueue(job) {
                    added += 1;
                }
            }
            state.record_gauges();
            added
        };
        if added > 0 {
            tracing::info!(restored = added, "Restored queued jobs");
        }
        self.dispatch();
        added
    }

    /// Fill free slots from the queue. Never waits for inference.
    pub fn dispatch(&self) {
        let started: Vec<Job> = {
            let mut state = self.state();
            let mut started = Vec::new();
            if !state.accepting {
                return;
            }
            while state.running.len() < self.inner.config.max_concurrent {
                let Some(job) = state.queue.dequeue_next() else {
                    break;
                };
                let seq = state.next_seq;
                state.next_seq += 1;
                state.running.insert(job.id, RunningSlot { seq });
                started.push(job);
            }
            state.record_gauges();
            started
        };

        for job in started {
            tracing::debug!(job_id = %job.id, subject_id = %job.subject_id, "Dispatching job");
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_job(job).await });
        }
    }

    /// Persist `processing` for a dispatched job, invoke the backend, and
    /// record the outcome.
    ///
    /// If the `processing` write fails transiently the job goes back to the
    /// queue and another dispatch pass runs after `store_retry_backoff`.
    async fn run_job(&self, job: Job) {
        let running = match state_machine::apply(&job, Transition::Start, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Rejected illegal transition");
                self.release(&job.id);
                return;
            }
        };

        if let Err(e) = self
            .inner
            .store
            .update(&running, JobStatus::Queued, job.attempt)
            .await
        {
            let stale = matches!(e, StoreError::Conflict { .. } | StoreError::NotFound(_));
            tracing::error!(
                job_id = %job.id,
                error = %e,
                "Failed to persist processing status"
            );
            {
                let mut state = self.state();
                state.running.remove(&job.id);
                if !stale {
                    // Rolled back; retried by the delayed dispatch below.
                    state.queue.enqueue(job);
                }
                state.record_gauges();
            }
            self.signal_if_idle();
            if stale {
                self.dispatch();
            } else {
                let scheduler = self.clone();
                let delay = self.inner.config.store_retry_backoff;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    scheduler.dispatch();
                });
            }
            return;
        }

        tracing::info!(
            job_id = %running.id,
            subject_id = %running.subject_id,
            attempt = running.attempt,
            "Segmentation job started"
        );
        self.inner.notifier.notify(&running);

        let outcome = self.inner.invoker.execute(&running).await;
        self.finish(running, outcome).await;
    }

    async fn finish(&self, job: Job, outcome: InferenceOutcome) {
        let transition = match outcome {
            InferenceOutcome::Success { result_ref } => Transition::Complete { result_ref },
            InferenceOutcome::Failure { error_detail } => {
                if job.attempt < self.inner.config.max_retries {
                    tracing::info!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        error = %error_detail,
                        "Job attempt failed, scheduling retry"
                    );
                    Transition::Requeue
                } else {
                    Transition::Fail {
                        error_detail: format!(
                            "Segmentation failed after {} attempts: {}",
                            job.attempt + 1,
                            error_detail
                        ),
                    }
                }
            }
        };

        let next = match state_machine::apply(&job, transition, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Rejected illegal transition");
                self.release(&job.id);
                self.dispatch();
                return;
            }
        };

        let persisted = self.persist_completion(&next, job.attempt).await;
        {
            let mut state = self.state();
            state.running.remove(&job.id);
            if persisted && next.status == JobStatus::Queued {
                state.queue.enqueue(next.clone());
            }
            state.record_gauges();
        }

        if persisted {
            match next.status {
                JobStatus::Completed => {
                    metrics::counter!("segmentation_jobs_completed_total").increment(1);
                    tracing::info!(job_id = %next.id, "Segmentation job completed");
                }
                JobStatus::Failed => {
                    metrics::counter!("segmentation_jobs_failed_total").increment(1);
                    tracing::warn!(
                        job_id = %next.id,
                        attempt = next.attempt,
                        "Job failed after max retries"
                    );
                }
                _ => {
                    metrics::counter!("segmentation_jobs_retried_total").increment(1);
                    tracing::info!(job_id = %next.id, attempt = next.attempt, "Job re-queued for retry");
                }
            }
            self.inner.notifier.notify(&next);
        } else {
            tracing::error!(
                job_id = %next.id,
                "Could not record job outcome; leaving it to the reconciler"
            );
        }

        self.signal_if_idle();
        self.dispatch();
    }

    /// Write a completion transition, retrying transient store failures.
    /// `ran_attempt` is the attempt that was `processing`; a requeued `job`
    /// already carries the next one.
    async fn persist_completion(&self, job: &Job, ran_attempt: i32) -> bool {
        let config = &self.inner.config;
        for attempt in 0..=config.store_retry_attempts {
            match self
                .inner
                .store
                .update(job, JobStatus::Processing, ran_attempt)
                .await
            {
                Ok(()) => return true,
                Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                    tracing::error!(job_id = %job.id, error = %e, "Completion write rejected");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Completion write failed"
                    );
                    if attempt < config.store_retry_attempts {
                        tokio::time::sleep(config.store_retry_backoff * (attempt + 1)).await;
                    }
                }
            }
        }
        false
    }

    fn release(&self, job_id: &Uuid) {
        {
            let mut state = self.state();
            state.running.remove(job_id);
            state.record_gauges();
        }
        self.signal_if_idle();
    }

    fn signal_if_idle(&self) {
        let idle = self.state().running.is_empty();
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Stop accepting and dispatching work, then wait up to `grace` for
    /// running jobs to finish. Returns true if every slot drained in time.
    ///
    /// Jobs still queued stay `queued` in the store and are restored on the
    /// next start.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let running = {
            let mut state = self.state();
            state.accepting = false;
            state.running.len()
        };
        tracing::info!(running, "Scheduler draining");

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.inner.idle.notified();
                let idle = self.state().running.is_empty();
                if idle {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!("Scheduler drained");
        } else {
            tracing::warn!(
                remaining = self.state().running.len(),
                "Shutdown grace period elapsed with jobs still running"
            );
        }
        drained
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Validation failed: {0}")]
    Validation(#[from] garde::Report),

    #[error("Store write failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}
