use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::store::{JobAudit, StoreError};
use crate::models::job::{Job, JobStatus, OwnerContext, SegmentationPayload};

const JOB_COLUMNS: &str = "id, subject_id, project_id, requester_id, priority, status, payload, \
     submitted_at, started_at, finished_at, result_ref, error_detail, attempt";

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let raw_status: Option<String> = row.try_get("status")?;
    let status = raw_status
        .as_deref()
        .and_then(|s| s.parse::<JobStatus>().ok())
        .ok_or(StoreError::InvalidStatus {
            job_id: id,
            status: raw_status.clone(),
        })?;
    let payload: Json<SegmentationPayload> = row.try_get("payload")?;

    Ok(Job {
        id,
        subject_id: row.try_get("subject_id")?,
        owner: OwnerContext {
            project_id: row.try_get("project_id")?,
            requester_id: row.try_get("requester_id")?,
        },
        priority: row.try_get("priority")?,
        status,
        payload: payload.0,
        submitted_at: row.try_get("submitted_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        result_ref: row.try_get("result_ref")?,
        error_detail: row.try_get("error_detail")?,
        attempt: row.try_get("attempt")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<JobAudit, StoreError> {
    Ok(JobAudit {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        raw_status: row.try_get("status")?,
        attempt: row.try_get("attempt")?,
        submitted_at: row.try_get("submitted_at")?,
        finished_at: row.try_get("finished_at")?,
        has_result: row.try_get("has_result")?,
        has_error: row.try_get("has_error")?,
    })
}

/// Insert a new segmentation job
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO segmentation_jobs
            (id, subject_id, project_id, requester_id, priority, status, payload,
             submitted_at, started_at, finished_at, result_ref, error_detail, attempt)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(job.id)
    .bind(&job.subject_id)
    .bind(job.owner.project_id.as_deref())
    .bind(job.owner.requester_id.as_deref())
    .bind(job.priority)
    .bind(job.status.as_ref())
    .bind(Json(&job.payload))
    .bind(job.submitted_at)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.result_ref.as_deref())
    .bind(job.error_detail.as_deref())
    .bind(job.attempt)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM segmentation_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Write the mutable fields of a job, guarded by its expected current status
/// and attempt. Returns the number of rows touched (0 or 1).
pub async fn update_job_if_status(
    pool: &PgPool,
    job: &Job,
    expected: JobStatus,
    expected_attempt: i32,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE segmentation_jobs
        SET status = $1,
            started_at = $2,
            finished_at = $3,
            result_ref = $4,
            error_detail = $5,
            attempt = $6
        WHERE id = $7 AND status = $8 AND attempt = $9
        "#,
    )
    .bind(job.status.as_ref())
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.result_ref.as_deref())
    .bind(job.error_detail.as_deref())
    .bind(job.attempt)
    .bind(job.id)
    .bind(expected.as_ref())
    .bind(expected_attempt)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Check whether a job row exists at all
pub async fn job_exists(pool: &PgPool, job_id: Uuid) -> Result<bool, StoreError> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM segmentation_jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

/// Get jobs in a given status, oldest first
pub async fn get_jobs_by_status(pool: &PgPool, status: JobStatus) -> Result<Vec<Job>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM segmentation_jobs WHERE status = $1 ORDER BY submitted_at ASC"
    ))
    .bind(status.as_ref())
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Jobs for a subject submitted at or after `since`
pub async fn get_recent_for_subject(
    pool: &PgPool,
    subject_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<JobAudit>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, subject_id, status, attempt, submitted_at, finished_at,
               result_ref IS NOT NULL AS has_result,
               error_detail IS NOT NULL AS has_error
        FROM segmentation_jobs
        WHERE subject_id = $1 AND submitted_at >= $2
        ORDER BY submitted_at ASC
        "#,
    )
    .bind(subject_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.iter().map(audit_from_row).collect()
}

/// All jobs of a project scope
pub async fn get_scope_audit(pool: &PgPool, scope_id: &str) -> Result<Vec<JobAudit>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, subject_id, status, attempt, submitted_at, finished_at,
               result_ref IS NOT NULL AS has_result,
               error_detail IS NOT NULL AS has_error
        FROM segmentation_jobs
        WHERE project_id = $1
        ORDER BY submitted_at ASC
        "#,
    )
    .bind(scope_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(audit_from_row).collect()
}

/// Force a status onto a row whose status is NULL or not a known value
pub async fn repair_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE segmentation_jobs
        SET status = $1
        WHERE id = $2
          AND (status IS NULL
               OR status NOT IN ('queued', 'processing', 'completed', 'failed', 'cancelled'))
        "#,
    )
    .bind(status.as_ref())
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Row counts grouped by raw status text
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(Option<String>, i64)>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT status, COUNT(*) AS total
        FROM segmentation_jobs
        GROUP BY status
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| -> Result<(Option<String>, i64), StoreError> {
            Ok((r.try_get("status")?, r.try_get("total")?))
        })
        .collect()
}
