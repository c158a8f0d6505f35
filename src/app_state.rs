use std::sync::Arc;

use crate::db::JobStore;
use crate::services::notifier::RedisNotifier;
use crate::services::scheduler::Scheduler;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub scheduler: Scheduler,
    pub redis: Arc<RedisNotifier>,
}

impl AppState {
    pub fn new(scheduler: Scheduler, redis: Arc<RedisNotifier>) -> Self {
        Self {
            store: Arc::clone(scheduler.store()),
            scheduler,
            redis,
        }
    }
}
