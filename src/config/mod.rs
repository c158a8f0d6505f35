use std::time::Duration;

use serde::Deserialize;

use crate::services::reconciler::ReconcilerConfig;
use crate::services::scheduler::SchedulerConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the `reconcile` tool.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for status events
    pub redis_url: String,

    /// Base URL of the segmentation inference service
    pub inference_url: String,

    /// Bearer token for the inference service, if it requires one
    #[serde(default)]
    pub inference_api_token: Option<String>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Look-back window for recent-submission verification
    #[serde(default = "default_consistency_window_secs")]
    pub consistency_window_secs: u64,

    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    /// How long shutdown waits for running jobs. Defaults to a little over
    /// the inference timeout.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_retries() -> i32 {
    3
}

fn default_inference_timeout_secs() -> u64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_consistency_window_secs() -> u64 {
    3600
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_shutdown_grace_secs() -> u64 {
    330
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            max_retries: self.max_retries,
            store_retry_attempts: self.store_retry_attempts,
            ..SchedulerConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            recent_window: Duration::from_secs(self.consistency_window_secs),
        }
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
