//! Status-event publishing.
//!
//! The scheduler never talks to a [`Notifier`] directly. It hands events to a
//! [`NotifierHandle`], which queues them on an unbounded channel drained by a
//! single background task. Publishing is therefore fire-and-forget, keeps
//! per-job event order, and a failing sink only produces a warning.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::models::event::JobEvent;
use crate::models::job::Job;

const CHANNEL_PREFIX: &str = "segmentation";

/// Room-based publish/subscribe sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, room: &str, event: &JobEvent) -> Result<(), NotifyError>;
}

/// Publishes events as JSON on the Redis channel `segmentation:{room}`.
pub struct RedisNotifier {
    client: redis::Client,
}

impl RedisNotifier {
    pub fn new(redis_url: &str) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url).map_err(NotifyError::Redis)?;
        Ok(Self { client })
    }

    pub fn channel(room: &str) -> String {
        format!("{CHANNEL_PREFIX}:{room}")
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), NotifyError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(NotifyError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(NotifyError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(&self, room: &str, event: &JobEvent) -> Result<(), NotifyError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(NotifyError::Redis)?;
        let payload = serde_json::to_string(event).map_err(NotifyError::Serialize)?;
        conn.publish::<_, _, ()>(Self::channel(room), payload)
            .await
            .map_err(NotifyError::Redis)?;
        Ok(())
    }
}

/// An event together with the room it is addressed to.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room: String,
    pub event: JobEvent,
}

const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out sink backed by a `tokio::sync::broadcast` channel.
///
/// Slow receivers observe `RecvError::Lagged` once the buffer fills.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<RoomEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, room: &str, event: &JobEvent) -> Result<(), NotifyError> {
        // A send error only means nobody is listening.
        let _ = self.sender.send(RoomEvent {
            room: room.to_string(),
            event: event.clone(),
        });
        Ok(())
    }
}

/// Cheap, cloneable front of the notification pipeline.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl NotifierHandle {
    /// Start the forwarding task for `notifier`. The task ends once every
    /// handle has been dropped and the backlog is drained.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RoomEvent>();
        let task = tokio::spawn(async move {
            while let Some(RoomEvent { room, event }) = rx.recv().await {
                if let Err(e) = notifier.publish(&room, &event).await {
                    tracing::warn!(
                        job_id = %event.job_id,
                        room = %room,
                        status = %event.status,
                        error = %e,
                        "Failed to publish job event"
                    );
                }
            }
            tracing::info!("Notification channel closed, forwarder shutting down");
        });
        (Self { tx }, task)
    }

    /// A handle whose events go nowhere.
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Queue a status event for the job as it was just persisted.
    pub fn notify(&self, job: &Job) {
        let _ = self.tx.send(RoomEvent {
            room: job.room(),
            event: JobEvent::from_job(job),
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Notification sink unavailable: {0}")]
    Unavailable(String),
}
