use super::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use time::macros::datetime;

use crate::quota::LimitType;

const NOW: OffsetDateTime = datetime!(2024-05-10 12:00 UTC);

fn limits(daily: u64, monthly: u64) -> QuotaLimits {
    QuotaLimits { daily, monthly }
}

fn log_entry(id: &str, user_id: &str, created_at_ms: i64) -> UsageLogEntry {
    UsageLogEntry {
        id: id.to_string(),
        request_id: id.to_string(),
        user_id: user_id.to_string(),
        workflow_id: "wf-1".to_string(),
        run_id: Some(format!("run-{id}")),
        tokens_used: 42,
        elapsed_ms: 1500,
        status: AuditStatus::Success,
        error_message: None,
        request_snapshot: json!({"inputs": {"q": "hello"}}),
        response_snapshot: json!({"data": {"outputs": {"x": 1}}}),
        created_at_ms,
    }
}

#[tokio::test]
async fn sqlite_store_concurrent_increments_respect_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::new(dir.path().join("flowgate.sqlite")));
    store.init().await.expect("init");
    let subject = QuotaSubject::for_workflow("u1", "wf-1");
    let granted = Arc::new(AtomicU64::new(0));

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let subject = subject.clone();
        let granted = granted.clone();
        tasks.push(tokio::spawn(async move {
            if store
                .increment_usage(&subject, limits(5, 300), 10, NOW)
                .await
                .expect("increment")
            {
                granted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    assert_eq!(granted.load(Ordering::SeqCst), 5);
    let daily = store
        .quota_counter(&subject, QuotaPeriod::Daily)
        .await
        .expect("counter")
        .expect("provisioned");
    assert_eq!(daily.used, 5);
    assert_eq!(daily.tokens_used, 50);
    let monthly = store
        .quota_counter(&subject, QuotaPeriod::Monthly)
        .await
        .expect("counter")
        .expect("provisioned");
    assert_eq!(monthly.used, 5);
}

#[tokio::test]
async fn sqlite_store_reservations_enforce_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("flowgate.sqlite"));
    store.init().await.expect("init");
    let subject = QuotaSubject::for_workflow("u1", "wf-1");

    let status = store
        .reserve_usage_slot("r1", &subject, limits(1, 10), NOW)
        .await
        .expect("reserve r1");
    assert!(status.can_use);

    let status = store
        .reserve_usage_slot("r2", &subject, limits(1, 10), NOW)
        .await
        .expect("reserve r2");
    assert!(!status.can_use);
    assert_eq!(status.limit_type, Some(LimitType::Daily));

    assert!(
        store
            .release_usage_reservation("r1", NOW)
            .await
            .expect("release r1")
    );
    assert!(
        !store
            .release_usage_reservation("r1", NOW)
            .await
            .expect("release r1 again")
    );

    store
        .reserve_usage_slot("r3", &subject, limits(1, 10), NOW)
        .await
        .expect("reserve r3");
    assert!(
        store
            .commit_usage_reservation("r3", 42, NOW)
            .await
            .expect("commit r3")
    );

    let snapshot = store
        .snapshot_usage(&subject, limits(1, 10), NOW)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.daily_used, 1);
    assert_eq!(snapshot.remaining_today, 0);
    assert_eq!(snapshot.monthly_used, 1);
    assert_eq!(snapshot.remaining_month, 9);
    assert_eq!(snapshot.last_reset, datetime!(2024-05-10 00:00 UTC));
}

#[tokio::test]
async fn sqlite_store_reaps_expired_reservations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("flowgate.sqlite"))
        .with_reservation_ttl(Duration::from_secs(30));
    store.init().await.expect("init");
    let subject = QuotaSubject::for_workflow("u1", "wf-1");

    store
        .reserve_usage_slot("r1", &subject, limits(1, 10), NOW)
        .await
        .expect("reserve r1");

    let later = NOW + time::Duration::seconds(31);
    let status = store
        .check_usage(&subject, limits(1, 10), later)
        .await
        .expect("check");
    assert!(status.can_use);
    assert!(
        !store
            .commit_usage_reservation("r1", 0, later)
            .await
            .expect("commit reaped")
    );
}

#[tokio::test]
async fn sqlite_store_resets_expired_windows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("flowgate.sqlite"));
    store.init().await.expect("init");
    let subject = QuotaSubject::for_workflow("u1", "wf-1");

    store
        .set_quota_counter(&subject, QuotaPeriod::Daily, 10, 10, NOW)
        .await
        .expect("seed");
    let status = store
        .check_usage(&subject, limits(10, 300), NOW)
        .await
        .expect("check");
    assert!(!status.can_use);
    assert_eq!(status.daily_remaining, 0);

    let next_day = datetime!(2024-05-11 08:00 UTC);
    let status = store
        .check_usage(&subject, limits(10, 300), next_day)
        .await
        .expect("check next day");
    assert!(status.can_use);
    assert_eq!(status.daily_remaining, 10);

    let daily = store
        .quota_counter(&subject, QuotaPeriod::Daily)
        .await
        .expect("counter")
        .expect("provisioned");
    assert_eq!(daily.reset_at(), datetime!(2024-05-12 00:00 UTC));
}

#[tokio::test]
async fn sqlite_store_appends_and_lists_usage_logs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("flowgate.sqlite"));
    store.init().await.expect("init");

    store
        .append_usage_log(&log_entry("req-1", "u1", 100))
        .await
        .expect("append req-1");
    store
        .append_usage_log(&log_entry("req-2", "u2", 200))
        .await
        .expect("append req-2");

    let err = store.append_usage_log(&log_entry("req-1", "u1", 300)).await;
    assert!(matches!(err, Err(SqliteStoreError::Duplicate(id)) if id == "req-1"));

    let logs = store
        .list_usage_logs(&AuditQuery::default())
        .await
        .expect("list");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].id, "req-2");
    assert_eq!(logs[1], log_entry("req-1", "u1", 100));

    let logs = store
        .list_usage_logs(&AuditQuery {
            user_id: Some("u1".to_string()),
            ..AuditQuery::default()
        })
        .await
        .expect("list u1");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].tokens_used, 42);
}

#[tokio::test]
async fn sqlite_store_audit_sink_maps_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("flowgate.sqlite"));
    store.init().await.expect("init");

    AuditSink::append(&store, log_entry("req-1", "u1", 1))
        .await
        .expect("append");
    let err = AuditSink::append(&store, log_entry("req-1", "u1", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Duplicate(_)));
}
