use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::job::{Job, SegmentationPayload};

/// The external ML backend. Returns a reference to the stored result
/// (mask/polygon object key) on success.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn segment(
        &self,
        subject_id: &str,
        payload: &SegmentationPayload,
    ) -> Result<String, InferenceError>;
}

/// Client for the segmentation service's HTTP endpoint.
pub struct HttpInferenceBackend {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    subject_id: &'a str,
    payload: &'a SegmentationPayload,
}

#[derive(Deserialize)]
struct SegmentResponse {
    result_ref: String,
}

impl HttpInferenceBackend {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceBackend {
    /// POST the subject and parameters to `{base_url}/segment`.
    async fn segment(
        &self,
        subject_id: &str,
        payload: &SegmentationPayload,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/segment", self.base_url);

        let mut request = self
            .http
            .post(&url)
            .json(&SegmentRequest {
                subject_id,
                payload,
            });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(InferenceError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Backend(format!("{status}: {body}")));
        }

        let parsed: SegmentResponse = response.json().await.map_err(InferenceError::Http)?;
        Ok(parsed.result_ref)
    }
}

/// Result of one execution attempt as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceOutcome {
    Success { result_ref: String },
    Failure { error_detail: String },
}

/// Runs one job against the backend under a per-job timeout.
///
/// Every backend error, timeout, or panic is folded into
/// [`InferenceOutcome::Failure`]; nothing escapes as an error.
#[derive(Clone)]
pub struct InferenceInvoker {
    backend: Arc<dyn InferenceBackend>,
    timeout: Duration,
}

impl InferenceInvoker {
    pub fn new(backend: Arc<dyn InferenceBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub async fn execute(&self, job: &Job) -> InferenceOutcome {
        let backend = Arc::clone(&self.backend);
        let subject_id = job.subject_id.clone();
        let payload = job.payload.clone();

        let start = Instant::now();
        // Run on its own task so a panicking backend cannot take the caller down.
        let mut handle =
            tokio::spawn(async move { backend.segment(&subject_id, &payload).await });

        let result = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(InferenceError::Panicked(join_err.to_string())),
            Err(_) => {
                handle.abort();
                Err(InferenceError::Timeout(self.timeout))
            }
        };
        let elapsed = start.elapsed();
        metrics::histogram!("segmentation_inference_seconds").record(elapsed.as_secs_f64());

        match result {
            Ok(result_ref) => {
                tracing::debug!(
                    job_id = %job.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Inference succeeded"
                );
                InferenceOutcome::Success { result_ref }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Inference attempt failed"
                );
                InferenceOutcome::Failure {
                    error_detail: e.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference backend error: {0}")]
    Backend(String),

    #[error("Processing timeout exceeded ({0:?})")]
    Timeout(Duration),

    #[error("Inference task panicked: {0}")]
    Panicked(String),
}
