use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::Job;

/// Sort key: priority descending, then oldest submission, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    submitted_at: DateTime<Utc>,
    seq: u64,
}

/// In-memory ordered set of jobs waiting for a free slot.
///
/// Not synchronized; the scheduler owns it behind its state lock.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, Job>,
    index: HashMap<Uuid, QueueKey>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Returns false (and changes nothing) if a job with the same
    /// id is already queued.
    pub fn enqueue(&mut self, job: Job) -> bool {
        if self.index.contains_key(&job.id) {
            return false;
        }
        let key = QueueKey {
            priority: Reverse(job.priority),
            submitted_at: job.submitted_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(job.id, key);
        self.entries.insert(key, job);
        true
    }

    /// Take the highest-priority, oldest job.
    pub fn dequeue_next(&mut self) -> Option<Job> {
        let (_, job) = self.entries.pop_first()?;
        self.index.remove(&job.id);
        Some(job)
    }

    /// Remove a job that has not been dequeued yet.
    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered copy of the queued jobs, next-to-dispatch first.
    pub fn peek_all(&self) -> Vec<Job> {
        self.entries.values().cloned().collect()
    }

    /// Ordered ids of the queued jobs, next-to-dispatch first.
    pub fn ids_in_order(&self) -> Vec<Uuid> {
        self.entries.values().map(|job| job.id).collect()
    }
}
