use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Lowest priority a caller may request.
pub const PRIORITY_MIN: i32 = -1000;

/// Highest priority a caller may request.
pub const PRIORITY_MAX: i32 = 1000;

/// Status of a segmentation job. Persisted as its snake_case text form.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses have no outgoing transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Identifiers used for access control and notification routing.
/// Opaque to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContext {
    pub project_id: Option<String>,
    pub requester_id: Option<String>,
}

impl OwnerContext {
    pub fn new(project_id: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            requester_id: Some(requester_id.into()),
        }
    }

    /// Room that status events for `subject_id` are published to.
    pub fn room(&self, subject_id: &str) -> String {
        match &self.project_id {
            Some(project) => format!("project:{project}"),
            None => format!("subject:{subject_id}"),
        }
    }
}

/// Inference parameters, tagged by the model that consumes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SegmentationPayload {
    /// ResUNet spheroid segmentation.
    ResUnet {
        /// Mask probability cut-off.
        #[garde(range(min = 0.0, max = 1.0))]
        threshold: f64,

        /// Polygons smaller than this (in pixels) are dropped.
        #[garde(range(min = 1))]
        min_area: u32,

        #[garde(range(min = 1, max = 10_000))]
        max_polygons: Option<u32>,
    },

    /// Classic intensity thresholding, used as a fast fallback.
    Threshold {
        /// Full 8-bit intensity range.
        #[garde(skip)]
        level: u8,

        #[garde(skip)]
        invert: bool,
    },
}

impl Default for SegmentationPayload {
    fn default() -> Self {
        SegmentationPayload::ResUnet {
            threshold: 0.5,
            min_area: 10,
            max_polygons: None,
        }
    }
}

/// A segmentation request as accepted from callers.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 255), custom(not_blank))]
    pub subject_id: String,

    #[garde(dive)]
    pub payload: SegmentationPayload,

    #[garde(range(min = PRIORITY_MIN, max = PRIORITY_MAX))]
    #[serde(default)]
    pub priority: i32,

    #[garde(skip)]
    #[serde(default)]
    pub owner: OwnerContext,
}

impl SubmitRequest {
    pub fn new(subject_id: impl Into<String>, payload: SegmentationPayload, priority: i32) -> Self {
        Self {
            subject_id: subject_id.into(),
            payload,
            priority,
            owner: OwnerContext::default(),
        }
    }

    pub fn with_owner(mut self, owner: OwnerContext) -> Self {
        self.owner = owner;
        self
    }
}

fn not_blank(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must not be blank"));
    }
    Ok(())
}

/// One segmentation job and its tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub subject_id: String,
    pub owner: OwnerContext,
    pub priority: i32,
    pub status: JobStatus,
    pub payload: SegmentationPayload,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub error_detail: Option<String>,
    pub attempt: i32,
}

impl Job {
    /// Create a freshly queued job. The request is assumed to be validated.
    pub fn new(request: SubmitRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: request.subject_id,
            owner: request.owner,
            priority: request.priority,
            status: JobStatus::Queued,
            payload: request.payload,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_ref: None,
            error_detail: None,
            attempt: 0,
        }
    }

    pub fn room(&self) -> String {
        self.owner.room(&self.subject_id)
    }
}
