use super::*;

use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use time::macros::datetime;

use crate::audit::MemoryAuditLog;
use crate::clock::ManualClock;
use crate::quota::{LimitType, MemoryQuotaStore, QuotaLimits, QuotaPeriod, QuotaPolicy};
use crate::workflow::{RunData, RunStatus, WorkflowEventKind};

const NOW: OffsetDateTime = datetime!(2024-05-10 12:00 UTC);

#[derive(Clone)]
enum Script {
    Finish(RunStatus, u64),
    Fail(WorkflowError),
    Panic,
    Hang,
}

struct ScriptedExecutor {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn play(&self, workflow_id: &str) -> Result<WorkflowResult, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.clone() {
            Script::Finish(status, tokens) => Ok(run_result(workflow_id, status, tokens)),
            Script::Fail(err) => Err(err),
            Script::Panic => panic!("executor exploded"),
            Script::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

fn run_data(status: RunStatus, tokens: u64) -> RunData {
    RunData {
        id: "run-1".to_string(),
        workflow_id: None,
        status,
        outputs: Some(json!({"x": 1})),
        error: (status == RunStatus::Failed).then(|| "node 3 failed".to_string()),
        elapsed_time: Some(0.25),
        total_tokens: Some(tokens),
        total_steps: Some(2),
        created_at: None,
        finished_at: None,
    }
}

fn run_result(workflow_id: &str, status: RunStatus, tokens: u64) -> WorkflowResult {
    WorkflowResult::from_run_data(
        workflow_id,
        Some("run-1".to_string()),
        Some("task-1".to_string()),
        run_data(status, tokens),
        json!({"upstream": true}),
    )
}

#[async_trait]
impl WorkflowExecutor for ScriptedExecutor {
    async fn run(
        &self,
        workflow_id: &str,
        _request: &WorkflowRunRequest,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.play(workflow_id).await
    }

    async fn run_status(
        &self,
        workflow_id: &str,
        _run_id: &str,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.play(workflow_id).await
    }

    async fn run_streaming(
        &self,
        workflow_id: &str,
        _request: &WorkflowRunRequest,
        on_event: &mut (dyn FnMut(WorkflowEvent) + Send),
    ) -> Result<WorkflowResult, WorkflowError> {
        for name in ["workflow_started", "node_started", "node_finished"] {
            on_event(WorkflowEvent::parse(&json!({"event": name, "data": {}}).to_string())?);
        }
        let result = self.play(workflow_id).await?;
        on_event(WorkflowEvent {
            kind: WorkflowEventKind::WorkflowFinished(Box::new(run_data(
                result.run_status,
                result.usage.tokens,
            ))),
            task_id: None,
            workflow_run_id: Some(result.run_id.clone()),
            payload: json!({"event": "workflow_finished"}),
        });
        Ok(result)
    }
}

struct Harness {
    orchestrator: Orchestrator,
    executor: Arc<ScriptedExecutor>,
    store: Arc<MemoryQuotaStore>,
    audit: Arc<MemoryAuditLog>,
}

fn harness(script: Script) -> Harness {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryQuotaStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let executor = ScriptedExecutor::new(script);
    let gate = QuotaGate::new(store.clone(), QuotaPolicy::default()).with_clock(clock.clone());
    let auth = StaticTokenAuthenticator::new().with_user("alice", "tok-alice");
    let orchestrator = Orchestrator::new(Arc::new(auth), gate, audit.clone(), executor.clone())
        .with_clock(clock);
    Harness {
        orchestrator,
        executor,
        store,
        audit,
    }
}

fn body() -> Value {
    json!({"inputs": {"q": "hello"}})
}

fn subject() -> QuotaSubject {
    QuotaSubject::for_workflow("alice", "wf-1")
}

impl Harness {
    async fn daily_used(&self) -> u64 {
        self.store
            .counter(&subject(), QuotaPeriod::Daily)
            .expect("counter")
            .map(|counter| counter.used)
            .unwrap_or(0)
    }

    async fn daily_reserved(&self) -> u64 {
        self.store
            .counter(&subject(), QuotaPeriod::Daily)
            .expect("counter")
            .map(|counter| counter.reserved)
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn success_logs_once_and_consumes_one_unit() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 42));

    let outcome = h
        .orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .expect("outcome");

    assert_eq!(outcome.result.status, ResultStatus::Success);
    assert_eq!(outcome.remaining_today, 9);
    assert_eq!(outcome.remaining_month, 299);
    assert_eq!(h.daily_used().await, 1);
    assert_eq!(h.daily_reserved().await, 0);

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Success);
    assert_eq!(entries[0].tokens_used, 42);
    assert_eq!(entries[0].id, outcome.request_id);
    assert_eq!(entries[0].run_id.as_deref(), Some("run-1"));
    assert_eq!(entries[0].request_snapshot["inputs"]["q"], "hello");
    assert_eq!(entries[0].response_snapshot["upstream"], true);
    assert_eq!(entries[0].created_at_ms, crate::clock::unix_millis(NOW));
}

#[tokio::test]
async fn unauthenticated_requests_are_not_logged() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 1));

    for credential in [None, Some("tok-mallory")] {
        let err = h
            .orchestrator
            .execute(credential, "wf-1", &body(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::Unauthorized);
    }
    assert!(h.audit.entries().is_empty());
    assert_eq!(h.executor.calls(), 0);
}

#[tokio::test]
async fn validation_failures_are_logged_without_quota() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 1));

    for (workflow_id, body) in [
        ("wf-1", json!({"inputs": "nope"})),
        ("wf-1", json!({"inputs": {}, "response_mode": "sometimes"})),
        ("wf-1", json!([1, 2])),
        ("../admin", body()),
    ] {
        let err = h
            .orchestrator
            .execute(Some("tok-alice"), workflow_id, &body, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)), "{err:?}");
    }

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|entry| entry.status == AuditStatus::Failed));
    assert!(entries.iter().all(|entry| entry.tokens_used == 0));
    assert_eq!(h.executor.calls(), 0);
    assert_eq!(h.daily_used().await, 0);
}

#[tokio::test]
async fn exhausted_quota_blocks_before_upstream() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 1));
    h.store
        .set_counter(&subject(), QuotaPeriod::Daily, 10, 10, NOW)
        .expect("seed");

    let err = h
        .orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrchestratorError::QuotaExceeded {
            limit_type: LimitType::Daily,
            remaining_today: 0,
            remaining_month: 300,
        }
    );
    assert_eq!(h.executor.calls(), 0);
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failed);
    assert_eq!(entries[0].tokens_used, 0);
    assert_eq!(entries[0].response_snapshot["limitType"], "daily");
}

#[tokio::test]
async fn upstream_errors_release_quota_and_log_once() {
    let h = harness(Script::Fail(WorkflowError::from_status_body(
        503,
        r#"{"code":"overloaded","message":"try later"}"#.to_string(),
    )));

    let err = h
        .orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Upstream(WorkflowError::Http { status: 503, .. })));
    assert_eq!(h.daily_used().await, 0);
    assert_eq!(h.daily_reserved().await, 0);
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failed);
    assert_eq!(entries[0].response_snapshot["body"], r#"{"code":"overloaded","message":"try later"}"#);
}

#[tokio::test]
async fn workflow_level_failure_is_a_result_without_quota() {
    let h = harness(Script::Finish(RunStatus::Failed, 7));

    let outcome = h
        .orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .expect("outcome");

    assert_eq!(outcome.result.status, ResultStatus::Error);
    assert_eq!(outcome.remaining_today, 10);
    assert_eq!(h.daily_used().await, 0);
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failed);
    assert_eq!(entries[0].error_message.as_deref(), Some("node 3 failed"));
    assert_eq!(entries[0].tokens_used, 7);
}

#[tokio::test]
async fn pending_result_is_logged_without_consuming_quota() {
    let h = harness(Script::Finish(RunStatus::Running, 0));

    let outcome = h
        .orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .expect("outcome");

    assert_eq!(outcome.result.status, ResultStatus::Pending);
    assert_eq!(h.daily_used().await, 0);
    assert_eq!(h.audit.entries()[0].status, AuditStatus::Success);
}

#[tokio::test]
async fn panics_are_contained_and_logged() {
    let h = harness(Script::Panic);

    let err = h
        .orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(&err, OrchestratorError::Internal(message) if message.contains("executor exploded")));
    assert_eq!(err.public_message(), "internal error");
    assert_eq!(h.daily_reserved().await, 0);
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failed);
    assert!(
        entries[0]
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("executor exploded"))
    );
}

#[tokio::test]
async fn cancellation_aborts_and_logs_failed() {
    let h = harness(Script::Hang);
    let cancel = CancellationToken::new();

    let orchestrator = h.orchestrator.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .execute(Some("tok-alice"), "wf-1", &body(), token)
            .await
    });

    while h.executor.calls() == 0 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let err = task.await.expect("join").unwrap_err();
    assert_eq!(err, OrchestratorError::Upstream(WorkflowError::Cancelled));
    assert_eq!(h.daily_used().await, 0);
    assert_eq!(h.daily_reserved().await, 0);
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failed);
}

#[tokio::test]
async fn streaming_forwards_events_in_order() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 42));
    let admission = h
        .orchestrator
        .admit(
            Some("tok-alice"),
            "wf-1",
            &json!({"inputs": {}, "response_mode": "streaming"}),
        )
        .await
        .expect("admission");
    assert_eq!(admission.response_mode(), ResponseMode::Streaming);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_streaming(admission, tx, CancellationToken::new())
        .await
        .expect("outcome");

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name().to_string());
    }
    assert_eq!(
        names,
        vec!["workflow_started", "node_started", "node_finished", "workflow_finished"]
    );
    assert_eq!(outcome.result.usage.tokens, 42);
    assert_eq!(h.daily_used().await, 1);
    assert_eq!(h.audit.entries().len(), 1);
}

#[tokio::test]
async fn polling_never_consumes_quota() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 5));

    let outcome = h
        .orchestrator
        .poll(Some("tok-alice"), "wf-1", Some("run-1"), CancellationToken::new())
        .await
        .expect("outcome");
    assert_eq!(outcome.result.status, ResultStatus::Success);
    assert_eq!(outcome.remaining_today, 10);
    assert_eq!(h.daily_used().await, 0);

    let err = h
        .orchestrator
        .poll(Some("tok-alice"), "wf-1", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, AuditStatus::Success);
    assert_eq!(entries[1].status, AuditStatus::Failed);
}

#[tokio::test]
async fn polling_requires_remaining_quota() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 5));
    h.store
        .set_counter(&subject(), QuotaPeriod::Monthly, 300, 300, NOW)
        .expect("seed");

    let err = h
        .orchestrator
        .poll(Some("tok-alice"), "wf-1", Some("run-1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::QuotaExceeded {
            limit_type: LimitType::Monthly,
            ..
        }
    ));
    assert_eq!(h.executor.calls(), 0);
    assert_eq!(h.audit.entries().len(), 1);
}

#[tokio::test]
async fn allow_list_rejects_unknown_workflows() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 1));
    let orchestrator = h
        .orchestrator
        .clone()
        .with_workflow_allow_list(vec!["summarize".to_string()]);

    let err = orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::WorkflowNotFound("wf-1".to_string()));
    assert_eq!(h.audit.entries().len(), 1);
}

#[tokio::test]
async fn snapshot_reports_both_windows() {
    let h = harness(Script::Finish(RunStatus::Succeeded, 1));
    h.orchestrator
        .execute(Some("tok-alice"), "wf-1", &body(), CancellationToken::new())
        .await
        .expect("outcome");

    let snapshot = h
        .orchestrator
        .quota_snapshot(Some("tok-alice"), "wf-1")
        .await
        .expect("snapshot");
    assert_eq!(snapshot.daily_used, 1);
    assert_eq!(snapshot.daily_limit, 10);
    assert_eq!(snapshot.monthly_used, 1);
    assert_eq!(snapshot.monthly_limit, 300);
    assert_eq!(snapshot.remaining_today, 9);
    assert_eq!(snapshot.remaining_month, 299);
    assert_eq!(snapshot.last_reset, datetime!(2024-05-10 00:00 UTC));

    assert_eq!(
        h.orchestrator.quota_snapshot(None, "wf-1").await.unwrap_err(),
        OrchestratorError::Unauthorized
    );
}

#[test]
fn workflow_id_rules() {
    assert!(is_valid_workflow_id("summarize-v2.1_beta"));
    assert!(!is_valid_workflow_id(""));
    assert!(!is_valid_workflow_id(".."));
    assert!(!is_valid_workflow_id("a/b"));
    assert!(!is_valid_workflow_id(&"x".repeat(129)));
}

#[tokio::test]
async fn success_after_reservation_expiry_still_consumes_quota() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(
        MemoryQuotaStore::new().with_reservation_ttl(std::time::Duration::from_secs(60)),
    );
    let audit = Arc::new(MemoryAuditLog::new());
    let executor = ScriptedExecutor::new(Script::Finish(RunStatus::Succeeded, 7));
    let policy = QuotaPolicy::new(QuotaLimits {
        daily: 1,
        monthly: 300,
    });
    let gate = QuotaGate::new(store.clone(), policy).with_clock(clock.clone());
    let auth = StaticTokenAuthenticator::new().with_user("alice", "tok-alice");
    let orchestrator = Orchestrator::new(Arc::new(auth), gate, audit.clone(), executor.clone())
        .with_clock(clock.clone());

    let mut successes = 0;
    let mut rejections = 0;
    for _ in 0..3 {
        match orchestrator.admit(Some("tok-alice"), "wf-1", &body()).await {
            Ok(admission) => {
                clock.advance(time::Duration::seconds(61));
                orchestrator
                    .run(admission, CancellationToken::new())
                    .await
                    .expect("outcome");
                successes += 1;
            }
            Err(OrchestratorError::QuotaExceeded { limit_type, .. }) => {
                assert_eq!(limit_type, LimitType::Daily);
                rejections += 1;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(rejections, 2);
    assert_eq!(executor.calls(), 1);
    let daily = store
        .counter(&subject(), QuotaPeriod::Daily)
        .expect("counter")
        .expect("provisioned");
    assert_eq!(daily.used, 1);
    assert_eq!(daily.reserved, 0);
    assert_eq!(daily.tokens_used, 7);
    assert_eq!(audit.entries().len(), 3);
}
