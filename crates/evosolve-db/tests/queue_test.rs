//! Integration tests for the delayed task queue.

use chrono::{Duration, Utc};
use serde_json::json;

use evosolve_db::models::TaskKind;
use evosolve_db::queries::queue;
use evosolve_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn enqueue_and_claim_due_task() {
    let (pool, db_name) = create_test_db().await;

    let payload = json!({"jobId": "job-1", "checkAttempt": 0});
    let id = queue::enqueue(&pool, TaskKind::Orchestrate, &payload, None, Utc::now(), 5)
        .await
        .expect("enqueue should succeed")
        .expect("fresh enqueue should insert");

    let claimed = queue::claim_due(&pool, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].kind, TaskKind::Orchestrate);
    assert_eq!(claimed[0].payload.0["jobId"], "job-1");

    // A claimed task is invisible to a second dispatcher.
    let second = queue::claim_due(&pool, 10).await.unwrap();
    assert!(second.is_empty());

    queue::mark_completed(&pool, id).await.unwrap();
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn future_tasks_are_not_due() {
    let (pool, db_name) = create_test_db().await;

    let payload = json!({"jobId": "job-2", "checkAttempt": 1});
    queue::enqueue(
        &pool,
        TaskKind::Orchestrate,
        &payload,
        None,
        Utc::now() + Duration::minutes(5),
        5,
    )
    .await
    .unwrap();

    let claimed = queue::claim_due(&pool, 10).await.unwrap();
    assert!(claimed.is_empty(), "future-scheduled task must not be claimable");
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn idempotency_key_deduplicates() {
    let (pool, db_name) = create_test_db().await;

    let payload = json!({"jobId": "job-3", "type": "variator", "generation": 1});
    let first = queue::enqueue(
        &pool,
        TaskKind::Worker,
        &payload,
        Some("job-3_gen1_variator_a0"),
        Utc::now(),
        5,
    )
    .await
    .unwrap();
    assert!(first.is_some());

    let second = queue::enqueue(
        &pool,
        TaskKind::Worker,
        &payload,
        Some("job-3_gen1_variator_a0"),
        Utc::now(),
        5,
    )
    .await
    .unwrap();
    assert!(second.is_none(), "duplicate key should be ignored");
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 1);

    // A different attempt key is a distinct task.
    let third = queue::enqueue(
        &pool,
        TaskKind::Worker,
        &payload,
        Some("job-3_gen1_variator_a1"),
        Utc::now(),
        5,
    )
    .await
    .unwrap();
    assert!(third.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_delivery_is_rescheduled_with_attempt_count() {
    let (pool, db_name) = create_test_db().await;

    let payload = json!({"jobId": "job-4", "checkAttempt": 0});
    let id = queue::enqueue(&pool, TaskKind::Orchestrate, &payload, None, Utc::now(), 3)
        .await
        .unwrap()
        .unwrap();

    let claimed = queue::claim_due(&pool, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let attempt = queue::mark_failed_retry(&pool, id, "connection refused", Utc::now())
        .await
        .unwrap();
    assert_eq!(attempt, 1);

    // Released and due again: claimable by the next poll.
    let reclaimed = queue::claim_due(&pool, 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempt, 1);
    assert_eq!(reclaimed[0].last_error.as_deref(), Some("connection refused"));

    queue::mark_exhausted(&pool, id, "gave up").await.unwrap();
    let task = queue::get_task(&pool, id).await.unwrap().unwrap();
    assert!(task.completed_at.is_some());
    assert_eq!(task.last_error.as_deref(), Some("gave up"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
