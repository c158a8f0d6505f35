//! Scheduler behaviour against the in-memory store.
//!
//! Run with: cargo test --test scheduler_test

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use segmentation_queue::{
    db::JobStore,
    models::job::{JobStatus, OwnerContext, SegmentationPayload, SubmitRequest},
    services::scheduler::SchedulerError,
};
use uuid::Uuid;

#[tokio::test]
async fn test_submitted_jobs_run_to_completion() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(4, 3), backend.clone());

    let mut ids = Vec::new();
    for subject in ["img-1", "img-2", "img-3"] {
        ids.push(h.submit(subject, 0).await);
    }
    wait_until(|| backend.started().len() == 3).await;
    assert_eq!(h.scheduler.status().processing_count, 3);

    for subject in ["img-1", "img-2", "img-3"] {
        backend.release(subject);
    }
    for (id, subject) in ids.iter().zip(["img-1", "img-2", "img-3"]) {
        let job = h.wait_for_status(*id, JobStatus::Completed).await;
        assert_eq!(job.result_ref, Some(format!("masks/{subject}.json")));
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
        assert!(job.error_detail.is_none());
    }
    wait_until(|| h.scheduler.status().processing_count == 0).await;
}

#[tokio::test]
async fn test_two_slots_fill_in_submission_order() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(2, 3), backend.clone());

    let img1 = h.submit("img-1", 0).await;
    let img2 = h.submit("img-2", 0).await;
    let img3 = h.submit("img-3", 0).await;

    let snapshot = h.scheduler.status();
    assert_eq!(snapshot.processing_count, 2);
    assert_eq!(snapshot.running_job_ids, vec![img1, img2]);
    assert_eq!(snapshot.queued_job_ids_in_order, vec![img3]);
    assert_eq!(snapshot.queue_length, 1);
}

#[tokio::test]
async fn test_queue_orders_by_priority_while_slots_are_busy() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(2, 3), backend.clone());

    let img1 = h.submit("img-1", 0).await;
    let img2 = h.submit("img-2", 0).await;
    let low = h.submit("img-low", 1).await;
    let high = h.submit("img-high", 10).await;
    let medium = h.submit("img-medium", 5).await;

    let snapshot = h.scheduler.status();
    assert_eq!(snapshot.running_job_ids, vec![img1, img2]);
    assert_eq!(snapshot.queued_job_ids_in_order, vec![high, medium, low]);

    // The next free slot goes to the highest priority.
    backend.release("img-1");
    wait_until(|| backend.started().len() == 3).await;
    assert_eq!(backend.started()[2], "img-high");
    assert_eq!(h.scheduler.status().queued_job_ids_in_order, vec![medium, low]);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());

    h.submit("img-block", 0).await;
    wait_until(|| backend.started().len() == 1).await;

    let low = h.submit("img-low", -10).await;
    let high = h.submit("img-high", 10).await;
    let medium = h.submit("img-medium", 0).await;
    assert_eq!(
        h.scheduler.status().queued_job_ids_in_order,
        vec![high, medium, low]
    );

    for subject in ["img-block", "img-low", "img-high", "img-medium"] {
        backend.release(subject);
    }
    h.wait_for_status(low, JobStatus::Completed).await;
    assert_eq!(
        backend.started(),
        vec!["img-block", "img-high", "img-medium", "img-low"]
    );
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());

    h.submit("img-block", 5).await;
    wait_until(|| backend.started().len() == 1).await;
    let a = h.submit("img-a", 5).await;
    let b = h.submit("img-b", 5).await;
    let c = h.submit("img-c", 5).await;
    assert_eq!(h.scheduler.status().queued_job_ids_in_order, vec![a, b, c]);

    for subject in ["img-block", "img-a", "img-b", "img-c"] {
        backend.release(subject);
    }
    h.wait_for_status(c, JobStatus::Completed).await;
    assert_eq!(
        backend.started(),
        vec!["img-block", "img-a", "img-b", "img-c"]
    );
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(2, 3), backend.clone());

    let subjects = ["img-1", "img-2", "img-3", "img-4", "img-5"];
    let mut ids = Vec::new();
    for subject in subjects {
        ids.push(h.submit(subject, 0).await);
    }
    wait_until(|| backend.started().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = h.scheduler.status();
    assert_eq!(snapshot.processing_count, 2);
    assert_eq!(snapshot.queue_length, 3);
    assert_eq!(snapshot.max_concurrent, 2);
    assert_eq!(backend.started().len(), 2);

    for subject in subjects {
        backend.release(subject);
    }
    for id in ids {
        h.wait_for_status(id, JobStatus::Completed).await;
    }
    assert_eq!(backend.peak(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_respect_limit() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(3, 3), backend.clone());

    let subjects: Vec<String> = (0..12).map(|i| format!("img-{i}")).collect();
    let submissions = subjects.iter().map(|s| h.scheduler.submit(request(s, 0)));
    let ids: Vec<Uuid> = futures::future::join_all(submissions)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    wait_until(|| backend.started().len() == 3).await;
    for subject in &subjects {
        backend.release(subject);
    }
    for id in ids {
        h.wait_for_status(id, JobStatus::Completed).await;
    }
    assert_eq!(backend.peak(), 3);
    assert_eq!(h.store.count_by_status().await.unwrap().completed, 12);
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());

    let running = h.submit("img-1", 0).await;
    wait_until(|| backend.started().len() == 1).await;
    let queued = h.submit("img-2", 0).await;

    assert!(h.scheduler.cancel(queued).await.unwrap());
    // Idempotent: a second cancel reports nothing to do.
    assert!(!h.scheduler.cancel(queued).await.unwrap());

    let job = h.job(queued).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.finished_at.is_some());
    assert!(job.started_at.is_none());
    assert_eq!(h.scheduler.status().queue_length, 0);

    h.wait_for_status(running, JobStatus::Processing).await;
    assert!(!h.scheduler.cancel(running).await.unwrap());
    assert!(!h.scheduler.cancel(Uuid::new_v4()).await.unwrap());

    backend.release("img-1");
    h.wait_for_status(running, JobStatus::Completed).await;
    backend.release("img-2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.started(), vec!["img-1"]);
    assert_eq!(h.job(queued).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_failures_are_retried_then_succeed() {
    let backend = Arc::new(ScriptedBackend::failing(2));
    let h = Harness::new(config(1, 3), backend.clone());

    let id = h.submit("img-1", 0).await;
    let job = h.wait_for_status(id, JobStatus::Completed).await;
    assert_eq!(job.attempt, 2);
    assert_eq!(backend.calls(), 3);
    assert!(job.error_detail.is_none());
}

#[tokio::test]
async fn test_failure_after_max_retries() {
    let backend = Arc::new(ScriptedBackend::always_failing());
    let h = Harness::new(config(1, 2), backend.clone());

    let id = h.submit("img-1", 0).await;
    let job = h.wait_for_status(id, JobStatus::Failed).await;
    assert_eq!(job.attempt, 2);
    assert_eq!(backend.calls(), 3);
    let detail = job.error_detail.expect("error detail recorded");
    assert!(
        detail.starts_with("Segmentation failed after 3 attempts"),
        "unexpected detail: {detail}"
    );
    assert!(job.result_ref.is_none());
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let mut h = Harness::with_timeout(
        config(1, 1),
        Arc::new(HangingBackend),
        Duration::from_millis(50),
    );

    let id = h.submit("img-1", 0).await;
    let job = h.wait_for_status(id, JobStatus::Failed).await;
    assert_eq!(job.attempt, 1);
    assert!(job
        .error_detail
        .unwrap()
        .contains("Processing timeout exceeded"));

    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(h.next_event().await.event.status);
    }
    assert_eq!(
        statuses,
        vec![
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Failed,
        ]
    );
}

#[tokio::test]
async fn test_events_follow_transitions_in_order() {
    let backend = Arc::new(GatedBackend::default());
    let mut h = Harness::new(config(1, 3), backend.clone());

    let id = h
        .scheduler
        .submit(
            request("img-1", 0).with_owner(OwnerContext {
                project_id: None,
                requester_id: Some("u-1".into()),
            }),
        )
        .await
        .unwrap();
    let queued = h.next_event().await;
    assert_eq!(queued.room, "subject:img-1");
    assert_eq!(queued.event.job_id, id);
    assert_eq!(queued.event.status, JobStatus::Queued);

    let processing = h.next_event().await;
    assert_eq!(processing.event.status, JobStatus::Processing);

    backend.release("img-1");
    let completed = h.next_event().await;
    assert_eq!(completed.event.status, JobStatus::Completed);
    assert_eq!(completed.event.result_ref.as_deref(), Some("masks/img-1.json"));

    let project = h.submit("img-2", 0).await;
    let event = h.next_event().await;
    assert_eq!(event.event.job_id, project);
    assert_eq!(event.room, "project:p-1");
}

#[tokio::test]
async fn test_store_failure_rejects_submission() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());
    h.store.set_fail_writes(true);

    let result = h.scheduler.submit(request("img-1", 0)).await;
    assert!(matches!(result, Err(SchedulerError::Store(_))));

    let snapshot = h.scheduler.status();
    assert_eq!(snapshot.queue_length, 0);
    assert_eq!(snapshot.processing_count, 0);
    assert_eq!(h.store.count_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_store_failure_keeps_job_queued_on_cancel() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());

    let running = h.submit("img-1", 0).await;
    h.wait_for_status(running, JobStatus::Processing).await;
    let queued = h.submit("img-2", 0).await;

    h.store.set_fail_writes(true);
    let result = h.scheduler.cancel(queued).await;
    assert!(matches!(result, Err(SchedulerError::Store(_))));
    assert_eq!(h.scheduler.status().queued_job_ids_in_order, vec![queued]);
    assert_eq!(h.job(queued).await.status, JobStatus::Queued);

    h.store.set_fail_writes(false);
    assert!(h.scheduler.cancel(queued).await.unwrap());
    assert_eq!(h.job(queued).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let h = Harness::new(config(1, 3), Arc::new(GatedBackend::default()));

    let too_urgent = h.scheduler.submit(request("img-1", 5000)).await;
    assert!(matches!(too_urgent, Err(SchedulerError::Validation(_))));

    let blank = h.scheduler.submit(request("   ", 0)).await;
    assert!(matches!(blank, Err(SchedulerError::Validation(_))));

    let bad_payload = h
        .scheduler
        .submit(SubmitRequest::new(
            "img-1",
            SegmentationPayload::ResUnet {
                threshold: 1.5,
                min_area: 10,
                max_polygons: None,
            },
            0,
        ))
        .await;
    assert!(matches!(bad_payload, Err(SchedulerError::Validation(_))));

    assert_eq!(h.store.count_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_batch_is_validated_up_front() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());
    let owner = OwnerContext::new("p-1", "u-1");

    let rejected = h
        .scheduler
        .submit_batch(
            &["img-1", ""],
            SegmentationPayload::default(),
            0,
            owner.clone(),
        )
        .await;
    assert!(matches!(rejected, Err(SchedulerError::Validation(_))));
    assert_eq!(h.store.count_by_status().await.unwrap().total(), 0);

    let ids = h
        .scheduler
        .submit_batch(
            &["img-1", "img-2", "img-3"],
            SegmentationPayload::default(),
            3,
            owner,
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    for id in &ids {
        assert_eq!(h.job(*id).await.priority, 3);
    }
}

#[tokio::test]
async fn test_shutdown_drains_running_jobs() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());

    let running = h.submit("img-1", 0).await;
    let waiting = h.submit("img-2", 0).await;
    wait_until(|| backend.started().len() == 1).await;

    backend.release("img-1");
    backend.release("img-2");
    assert!(h.scheduler.shutdown(Duration::from_secs(2)).await);

    assert_eq!(h.job(running).await.status, JobStatus::Completed);
    // Stays queued in the store for the next start.
    assert_eq!(h.job(waiting).await.status, JobStatus::Queued);
    assert_eq!(backend.started(), vec!["img-1"]);

    let late = h.scheduler.submit(request("img-3", 0)).await;
    assert!(matches!(late, Err(SchedulerError::ShuttingDown)));
}

#[tokio::test]
async fn test_shutdown_gives_up_after_grace() {
    let backend = Arc::new(GatedBackend::default());
    let h = Harness::new(config(1, 3), backend.clone());

    h.submit("img-1", 0).await;
    wait_until(|| backend.started().len() == 1).await;

    assert!(!h.scheduler.shutdown(Duration::from_millis(50)).await);
    assert_eq!(h.scheduler.status().processing_count, 1);
}

#[tokio::test]
async fn test_failed_start_write_is_retried_without_reconciler() {
    let backend = Arc::new(ScriptedBackend::failing(0));
    let h = Harness::new(config(1, 3), backend.clone());

    let id = h.submit("img-1", 0).await;
    // The dispatched task has not run yet, so its `processing` write fails.
    h.store.set_fail_writes(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.job(id).await.status, JobStatus::Queued);
    assert_eq!(backend.calls(), 0);

    h.store.set_fail_writes(false);
    let job = h.wait_for_status(id, JobStatus::Completed).await;
    assert_eq!(job.attempt, 0);
    assert_eq!(backend.calls(), 1);
}
