//! Test helper utilities: scripted inference backends and a scheduler
//! harness over the in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use segmentation_queue::{
    db::{JobAudit, JobStore, MemoryJobStore, StoreError},
    models::report::StatusBreakdown,
    models::job::{Job, JobStatus, OwnerContext, SegmentationPayload, SubmitRequest},
    services::{
        inference::{InferenceBackend, InferenceError, InferenceInvoker},
        notifier::{BroadcastNotifier, NotifierHandle, RoomEvent},
        reconciler::{Reconciler, ReconcilerConfig},
        scheduler::{Scheduler, SchedulerConfig},
    },
};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

/// Backend that holds every call until the test releases its subject.
#[derive(Default)]
pub struct GatedBackend {
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedBackend {
    fn gate(&self, subject_id: &str) -> Arc<Semaphore> {
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(subject_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    /// Let one pending (or future) call for `subject_id` finish successfully.
    pub fn release(&self, subject_id: &str) {
        self.gate(subject_id).add_permits(1);
    }

    /// Subjects in the order their inference started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for GatedBackend {
    async fn segment(
        &self,
        subject_id: &str,
        _payload: &SegmentationPayload,
    ) -> Result<String, InferenceError> {
        self.started.lock().unwrap().push(subject_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let gate = self.gate(subject_id);
        let acquired = gate.acquire().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        acquired
            .map_err(|e| InferenceError::Backend(e.to_string()))?
            .forget();
        Ok(format!("masks/{subject_id}.json"))
    }
}

/// Backend that fails its first `failures` calls, then succeeds.
pub struct ScriptedBackend {
    failures: usize,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn segment(
        &self,
        subject_id: &str,
        _payload: &SegmentationPayload,
    ) -> Result<String, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(InferenceError::Backend(format!("model crashed on call {call}")));
        }
        Ok(format!("masks/{subject_id}.json"))
    }
}

/// Backend that never answers within any reasonable timeout.
pub struct HangingBackend;

#[async_trait]
impl InferenceBackend for HangingBackend {
    async fn segment(
        &self,
        _subject_id: &str,
        _payload: &SegmentationPayload,
    ) -> Result<String, InferenceError> {
        sleep(Duration::from_secs(3600)).await;
        Ok(String::new())
    }
}

/// Store whose `processing` scan returns a snapshot captured earlier, as if
/// the rows changed between the reconciler's read and its write.
pub struct StaleReadStore {
    pub inner: Arc<MemoryJobStore>,
    pub stale_processing: Mutex<Vec<Job>>,
}

#[async_trait]
impl JobStore for StaleReadStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.insert(job).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.load(id).await
    }

    async fn update(
        &self,
        job: &Job,
        expected: JobStatus,
        expected_attempt: i32,
    ) -> Result<(), StoreError> {
        self.inner.update(job, expected, expected_attempt).await
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        if status == JobStatus::Processing {
            return Ok(self.stale_processing.lock().unwrap().clone());
        }
        self.inner.find_by_status(status).await
    }

    async fn find_recent_by_subject(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobAudit>, StoreError> {
        self.inner.find_recent_by_subject(subject_id, since).await
    }

    async fn audit_scope(&self, scope_id: &str) -> Result<Vec<JobAudit>, StoreError> {
        self.inner.audit_scope(scope_id).await
    }

    async fn repair_status(&self, id: Uuid, status: JobStatus) -> Result<bool, StoreError> {
        self.inner.repair_status(id, status).await
    }

    async fn count_by_status(&self) -> Result<StatusBreakdown, StoreError> {
        self.inner.count_by_status().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub store: Arc<MemoryJobStore>,
    pub events: broadcast::Receiver<RoomEvent>,
}

impl Harness {
    pub fn new(config: SchedulerConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        Self::with_timeout(config, backend, Duration::from_secs(30))
    }

    /// Must be called from within a Tokio runtime.
    pub fn with_timeout(
        config: SchedulerConfig,
        backend: Arc<dyn InferenceBackend>,
        timeout: Duration,
    ) -> Self {
        Self::over_store(Arc::new(MemoryJobStore::new()), config, backend, timeout)
    }

    pub fn over_store(
        store: Arc<MemoryJobStore>,
        config: SchedulerConfig,
        backend: Arc<dyn InferenceBackend>,
        timeout: Duration,
    ) -> Self {
        let broadcast = Arc::new(BroadcastNotifier::default());
        let events = broadcast.subscribe();
        let (notifier, _task) = NotifierHandle::spawn(broadcast);
        let scheduler = Scheduler::new(
            config,
            store.clone(),
            InferenceInvoker::new(backend, timeout),
            notifier,
        );
        Self {
            scheduler,
            store,
            events,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.scheduler.clone(), ReconcilerConfig::default())
    }

    pub async fn submit(&self, subject_id: &str, priority: i32) -> Uuid {
        self.scheduler
            .submit(request(subject_id, priority))
            .await
            .expect("submit failed")
    }

    pub async fn job(&self, id: Uuid) -> Job {
        self.store
            .load(id)
            .await
            .expect("load failed")
            .expect("job missing")
    }

    /// Poll the store until the job reaches `status` (with timeout).
    pub async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = self.job(id).await;
            if job.status == status {
                return job;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    /// Next published event (with timeout).
    pub async fn next_event(&mut self) -> RoomEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("no event published")
            .expect("event channel closed")
    }
}

pub fn config(max_concurrent: usize, max_retries: i32) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        max_retries,
        store_retry_attempts: 1,
        store_retry_backoff: Duration::from_millis(10),
    }
}

pub fn request(subject_id: &str, priority: i32) -> SubmitRequest {
    SubmitRequest::new(subject_id, SegmentationPayload::default(), priority)
        .with_owner(OwnerContext::new("p-1", "u-1"))
}

/// A job as it would look persisted, for seeding the store directly.
pub fn seeded_job(subject_id: &str, status: JobStatus, attempt: i32) -> Job {
    let mut job = Job::new(request(subject_id, 0));
    job.status = status;
    job.attempt = attempt;
    job
}

/// Poll `condition` until it holds (with timeout).
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5 seconds");
}
