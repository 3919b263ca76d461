//! Request sequencing: authenticate, validate, reserve quota, execute with
//! retry, record one usage entry, settle the reservation.
//!
//! The orchestrator keeps no per-request state between calls. Everything that
//! must be coordinated across requests lives in the quota store.

pub mod auth;
pub mod error;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audit::{AuditSink, AuditStatus, UsageLogEntry};
use crate::clock::{Clock, SystemClock};
use crate::quota::{QuotaCheck, QuotaGate, QuotaPermit, QuotaSnapshot, QuotaSubject};
use crate::workflow::{
    ResponseMode, ResultStatus, WorkflowError, WorkflowEvent, WorkflowExecutor, WorkflowResult,
    WorkflowRunRequest,
};

pub use auth::{Authenticator, Principal, StaticTokenAuthenticator};
pub use error::OrchestratorError;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const MAX_WORKFLOW_ID_LEN: usize = 128;

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("flowgate-{ts_ms}-{}-{seq}", std::process::id())
}

/// Workflow ids end up in upstream URL paths.
pub fn is_valid_workflow_id(workflow_id: &str) -> bool {
    !workflow_id.is_empty()
        && workflow_id.len() <= MAX_WORKFLOW_ID_LEN
        && workflow_id != "."
        && workflow_id != ".."
        && workflow_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
}

/// Validated body of an execute request.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteRequest {
    pub inputs: Map<String, Value>,
    pub response_mode: ResponseMode,
}

impl ExecuteRequest {
    /// Accepts `{ "inputs": {..}, "response_mode"?: "blocking" | "streaming" }`.
    /// Other fields are ignored.
    pub fn from_body(body: &Value) -> Result<Self, OrchestratorError> {
        let Some(body) = body.as_object() else {
            return Err(OrchestratorError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        };
        let inputs = match body.get("inputs") {
            Some(Value::Object(inputs)) => inputs.clone(),
            Some(_) => {
                return Err(OrchestratorError::Validation(
                    "`inputs` must be an object".to_string(),
                ));
            }
            None => {
                return Err(OrchestratorError::Validation(
                    "`inputs` is required".to_string(),
                ));
            }
        };
        let response_mode = match body.get("response_mode") {
            None | Some(Value::Null) => ResponseMode::Blocking,
            Some(Value::String(mode)) if mode == "blocking" => ResponseMode::Blocking,
            Some(Value::String(mode)) if mode == "streaming" => ResponseMode::Streaming,
            Some(other) => {
                return Err(OrchestratorError::Validation(format!(
                    "`response_mode` must be \"blocking\" or \"streaming\", got {other}"
                )));
            }
        };
        Ok(Self {
            inputs,
            response_mode,
        })
    }
}

/// An authenticated, validated request holding one reserved unit of quota.
/// Pass it to [`Orchestrator::run`] or [`Orchestrator::run_streaming`].
pub struct Admission {
    request_id: String,
    principal: Principal,
    workflow_id: String,
    request: WorkflowRunRequest,
    request_snapshot: Value,
    quota: QuotaCheck,
    permit: QuotaPermit,
    started: Instant,
    span: tracing::Span,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("request_id", &self.request_id)
            .field("user_id", &self.principal.user_id)
            .field("workflow_id", &self.workflow_id)
            .field("response_mode", &self.request.response_mode)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl Admission {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn user_id(&self) -> &str {
        &self.principal.user_id
    }

    pub fn response_mode(&self) -> ResponseMode {
        self.request.response_mode
    }

    pub fn quota(&self) -> QuotaCheck {
        self.quota
    }
}

/// What the caller gets back for a run that reached the upstream and produced
/// a result (including workflow-level failures).
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOutcome {
    pub request_id: String,
    pub result: WorkflowResult,
    pub remaining_today: u64,
    pub remaining_month: u64,
}

enum Execution {
    Completed(WorkflowResult),
    Failed(WorkflowError),
    Panicked(String),
}

#[derive(Clone)]
pub struct Orchestrator {
    authenticator: Arc<dyn Authenticator>,
    quota: QuotaGate,
    audit: Arc<dyn AuditSink>,
    executor: Arc<dyn WorkflowExecutor>,
    clock: Arc<dyn Clock>,
    workflows: Option<Arc<HashSet<String>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("quota", &self.quota)
            .field("workflows", &self.workflows)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        quota: QuotaGate,
        audit: Arc<dyn AuditSink>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> Self {
        Self {
            authenticator,
            quota,
            audit,
            executor,
            clock: Arc::new(SystemClock),
            workflows: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Restricts execution to the listed workflow ids; others answer "not found".
    pub fn with_workflow_allow_list(mut self, workflows: impl IntoIterator<Item = String>) -> Self {
        self.workflows = Some(Arc::new(workflows.into_iter().collect()));
        self
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    async fn authenticate(&self, credential: Option<&str>) -> Result<Principal, OrchestratorError> {
        let Some(credential) = credential else {
            return Err(OrchestratorError::Unauthorized);
        };
        self.authenticator
            .authenticate(credential)
            .await
            .ok_or(OrchestratorError::Unauthorized)
    }

    fn check_workflow(&self, workflow_id: &str) -> Result<(), OrchestratorError> {
        if !is_valid_workflow_id(workflow_id) {
            return Err(OrchestratorError::Validation(format!(
                "invalid workflow id: {workflow_id:?}"
            )));
        }
        if let Some(workflows) = &self.workflows {
            if !workflows.contains(workflow_id) {
                return Err(OrchestratorError::WorkflowNotFound(workflow_id.to_string()));
            }
        }
        Ok(())
    }

    fn request_span(request_id: &str, workflow_id: &str, user_id: &str) -> tracing::Span {
        tracing::info_span!(
            "workflow_request",
            request_id = %request_id,
            workflow_id = %workflow_id,
            user_id = %user_id,
            status = tracing::field::Empty,
        )
    }

    /// Authenticates, validates and reserves quota. Every rejection after
    /// authentication is recorded as a failed usage entry.
    pub async fn admit(
        &self,
        credential: Option<&str>,
        workflow_id: &str,
        body: &Value,
    ) -> Result<Admission, OrchestratorError> {
        let started = Instant::now();
        let principal = self.authenticate(credential).await?;
        let request_id = generate_request_id();
        let span = Self::request_span(&request_id, workflow_id, &principal.user_id);

        async {
            let parsed = self
                .check_workflow(workflow_id)
                .and_then(|()| ExecuteRequest::from_body(body));
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.record_rejection(&request_id, &principal, workflow_id, body.clone(), &err, started)
                        .await;
                    return Err(err);
                }
            };

            let request = WorkflowRunRequest {
                inputs: parsed.inputs,
                response_mode: parsed.response_mode,
                user: principal.user_id.clone(),
            };
            let request_snapshot = json!({
                "workflow_id": workflow_id,
                "inputs": request.inputs,
                "response_mode": request.response_mode,
                "user": request.user,
            });

            let subject = QuotaSubject::for_workflow(principal.user_id.clone(), workflow_id);
            let (check, permit) = self.quota.admit(&request_id, &subject).await;
            let Some(permit) = permit else {
                let err = quota_rejection(check);
                self.record_rejection(&request_id, &principal, workflow_id, request_snapshot, &err, started)
                    .await;
                return Err(err);
            };
            tracing::debug!(
                remaining_today = check.daily_remaining,
                remaining_month = check.monthly_remaining,
                "request admitted"
            );

            Ok(Admission {
                request_id: request_id.clone(),
                principal: principal.clone(),
                workflow_id: workflow_id.to_string(),
                request,
                request_snapshot,
                quota: check,
                permit,
                started,
                span: tracing::Span::current(),
            })
        }
        .instrument(span)
        .await
    }

    /// Blocking execution with retry.
    pub async fn run(
        &self,
        admission: Admission,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let span = admission.span.clone();
        async move {
            let executor = self.executor.clone();
            let execution = guarded(
                executor.run(&admission.workflow_id, &admission.request),
                &cancel,
            )
            .await;
            self.settle(admission, execution).await
        }
        .instrument(span)
        .await
    }

    /// Streaming execution. Upstream events are forwarded to `events` in
    /// arrival order; a closed receiver does not stop the run.
    pub async fn run_streaming(
        &self,
        admission: Admission,
        events: mpsc::UnboundedSender<WorkflowEvent>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let span = admission.span.clone();
        async move {
            let executor = self.executor.clone();
            let mut forward = move |event: WorkflowEvent| {
                let _ = events.send(event);
            };
            let execution = guarded(
                executor.run_streaming(&admission.workflow_id, &admission.request, &mut forward),
                &cancel,
            )
            .await;
            self.settle(admission, execution).await
        }
        .instrument(span)
        .await
    }

    /// `admit` followed by a run in the requested mode. Streamed events are
    /// discarded; only the final result is returned.
    pub async fn execute(
        &self,
        credential: Option<&str>,
        workflow_id: &str,
        body: &Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let admission = self.admit(credential, workflow_id, body).await?;
        match admission.response_mode() {
            ResponseMode::Blocking => self.run(admission, cancel).await,
            ResponseMode::Streaming => {
                let (events, _) = mpsc::unbounded_channel();
                self.run_streaming(admission, events, cancel).await
            }
        }
    }

    /// Fetches the state of an earlier run. Requires remaining quota but never
    /// consumes any.
    pub async fn poll(
        &self,
        credential: Option<&str>,
        workflow_id: &str,
        run_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let started = Instant::now();
        let principal = self.authenticate(credential).await?;
        let request_id = generate_request_id();
        let span = Self::request_span(&request_id, workflow_id, &principal.user_id);

        async {
            let request_snapshot = json!({
                "workflow_id": workflow_id,
                "run_id": run_id,
                "poll": true,
            });
            let run_id = match self.check_workflow(workflow_id).and_then(|()| {
                run_id
                    .map(str::trim)
                    .filter(|run_id| !run_id.is_empty())
                    .ok_or_else(|| OrchestratorError::Validation("`runId` is required".to_string()))
            }) {
                Ok(run_id) => run_id,
                Err(err) => {
                    self.record_rejection(&request_id, &principal, workflow_id, request_snapshot, &err, started)
                        .await;
                    return Err(err);
                }
            };

            let subject = QuotaSubject::for_workflow(principal.user_id.clone(), workflow_id);
            let check = self.quota.check(&subject).await;
            if !check.allowed {
                let err = quota_rejection(check);
                self.record_rejection(&request_id, &principal, workflow_id, request_snapshot, &err, started)
                    .await;
                return Err(err);
            }

            let execution = guarded(self.executor.run_status(workflow_id, run_id), &cancel).await;
            let (entry, outcome) = match execution {
                Execution::Completed(result) => {
                    let status = match result.status {
                        ResultStatus::Error => AuditStatus::Failed,
                        ResultStatus::Success | ResultStatus::Pending => AuditStatus::Success,
                    };
                    let entry = self.entry(
                        &request_id,
                        &principal,
                        workflow_id,
                        Some(result.run_id.clone()),
                        result.usage.tokens,
                        status,
                        result.error.clone(),
                        request_snapshot,
                        result.raw.clone(),
                        started,
                    );
                    let outcome = ExecutionOutcome {
                        request_id: request_id.clone(),
                        result,
                        remaining_today: check.daily_remaining,
                        remaining_month: check.monthly_remaining,
                    };
                    (entry, Ok(outcome))
                }
                Execution::Failed(err) => {
                    let entry = self.entry(
                        &request_id,
                        &principal,
                        workflow_id,
                        Some(run_id.to_string()),
                        0,
                        AuditStatus::Failed,
                        Some(err.to_string()),
                        request_snapshot,
                        err.snapshot(),
                        started,
                    );
                    (entry, Err(OrchestratorError::Upstream(err)))
                }
                Execution::Panicked(message) => {
                    tracing::error!(panic = %message, "workflow poll panicked");
                    let entry = self.entry(
                        &request_id,
                        &principal,
                        workflow_id,
                        Some(run_id.to_string()),
                        0,
                        AuditStatus::Failed,
                        Some(message.clone()),
                        request_snapshot,
                        Value::Null,
                        started,
                    );
                    (entry, Err(OrchestratorError::Internal(message)))
                }
            };
            self.record(entry).await;
            outcome
        }
        .instrument(span)
        .await
    }

    pub async fn quota_snapshot(
        &self,
        credential: Option<&str>,
        workflow_id: &str,
    ) -> Result<QuotaSnapshot, OrchestratorError> {
        let principal = self.authenticate(credential).await?;
        if !is_valid_workflow_id(workflow_id) {
            return Err(OrchestratorError::Validation(format!(
                "invalid workflow id: {workflow_id:?}"
            )));
        }
        let subject = QuotaSubject::for_workflow(principal.user_id, workflow_id);
        self.quota.snapshot(&subject).await.map_err(|err| {
            tracing::warn!(subject = %subject, error = %err, "quota snapshot failed");
            OrchestratorError::QuotaUnavailable
        })
    }

    /// Counts a successful run. A reservation that expired while the run was in
    /// flight is replaced by a plain increment.
    async fn commit_usage(&self, permit: QuotaPermit, tokens_used: u64) {
        let subject = permit.subject().clone();
        let reservation_id = permit.reservation_id().to_string();
        if permit.commit(tokens_used).await {
            return;
        }
        if !self.quota.increment(&subject, tokens_used).await {
            tracing::error!(
                reservation_id = %reservation_id,
                subject = %subject,
                tokens_used,
                "successful run could not be counted against quota"
            );
        }
    }

    /// Records the usage entry and settles the reservation for a finished run.
    async fn settle(
        &self,
        admission: Admission,
        execution: Execution,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let Admission {
            request_id,
            principal,
            workflow_id,
            request_snapshot,
            quota,
            permit,
            started,
            span,
            ..
        } = admission;

        match execution {
            Execution::Completed(result) => {
                let (status, remaining_today, remaining_month) = match result.status {
                    ResultStatus::Success => {
                        self.commit_usage(permit, result.usage.tokens).await;
                        (
                            AuditStatus::Success,
                            quota.daily_remaining.saturating_sub(1),
                            quota.monthly_remaining.saturating_sub(1),
                        )
                    }
                    ResultStatus::Pending => {
                        permit.release().await;
                        (AuditStatus::Success, quota.daily_remaining, quota.monthly_remaining)
                    }
                    ResultStatus::Error => {
                        permit.release().await;
                        (AuditStatus::Failed, quota.daily_remaining, quota.monthly_remaining)
                    }
                };
                span.record("status", status.as_str());
                tracing::info!(
                    run_id = %result.run_id,
                    result_status = ?result.status,
                    tokens = result.usage.tokens,
                    "workflow run finished"
                );
                let entry = self.entry(
                    &request_id,
                    &principal,
                    &workflow_id,
                    Some(result.run_id.clone()),
                    result.usage.tokens,
                    status,
                    result.error.clone(),
                    request_snapshot,
                    result.raw.clone(),
                    started,
                );
                self.record(entry).await;
                Ok(ExecutionOutcome {
                    request_id,
                    result,
                    remaining_today,
                    remaining_month,
                })
            }
            Execution::Failed(err) => {
                permit.release().await;
                span.record("status", AuditStatus::Failed.as_str());
                tracing::warn!(error = %err, kind = err.kind(), "workflow run failed");
                let entry = self.entry(
                    &request_id,
                    &principal,
                    &workflow_id,
                    None,
                    0,
                    AuditStatus::Failed,
                    Some(err.to_string()),
                    request_snapshot,
                    err.snapshot(),
                    started,
                );
                self.record(entry).await;
                Err(OrchestratorError::Upstream(err))
            }
            Execution::Panicked(message) => {
                permit.release().await;
                span.record("status", AuditStatus::Failed.as_str());
                tracing::error!(panic = %message, "workflow run panicked");
                let entry = self.entry(
                    &request_id,
                    &principal,
                    &workflow_id,
                    None,
                    0,
                    AuditStatus::Failed,
                    Some(message.clone()),
                    request_snapshot,
                    Value::Null,
                    started,
                );
                self.record(entry).await;
                Err(OrchestratorError::Internal(message))
            }
        }
    }

    async fn record_rejection(
        &self,
        request_id: &str,
        principal: &Principal,
        workflow_id: &str,
        request_snapshot: Value,
        err: &OrchestratorError,
        started: Instant,
    ) {
        tracing::Span::current().record("status", AuditStatus::Failed.as_str());
        tracing::info!(code = err.code(), "request rejected");
        let response_snapshot = match err {
            OrchestratorError::QuotaExceeded {
                limit_type,
                remaining_today,
                remaining_month,
            } => json!({
                "code": err.code(),
                "limitType": limit_type,
                "remainingToday": remaining_today,
                "remainingMonth": remaining_month,
            }),
            other => json!({ "code": other.code() }),
        };
        let entry = self.entry(
            request_id,
            principal,
            workflow_id,
            None,
            0,
            AuditStatus::Failed,
            Some(err.to_string()),
            request_snapshot,
            response_snapshot,
            started,
        );
        self.record(entry).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        request_id: &str,
        principal: &Principal,
        workflow_id: &str,
        run_id: Option<String>,
        tokens_used: u64,
        status: AuditStatus,
        error_message: Option<String>,
        request_snapshot: Value,
        response_snapshot: Value,
        started: Instant,
    ) -> UsageLogEntry {
        UsageLogEntry {
            id: request_id.to_string(),
            request_id: request_id.to_string(),
            user_id: principal.user_id.clone(),
            workflow_id: workflow_id.to_string(),
            run_id,
            tokens_used,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            status,
            error_message,
            request_snapshot,
            response_snapshot,
            created_at_ms: self.clock.now_millis(),
        }
    }

    async fn record(&self, entry: UsageLogEntry) {
        let request_id = entry.request_id.clone();
        if let Err(err) = self.audit.append(entry).await {
            tracing::error!(request_id = %request_id, error = %err, "failed to write usage log entry");
        }
    }
}

fn quota_rejection(check: QuotaCheck) -> OrchestratorError {
    match check.limit_type {
        Some(limit_type) => OrchestratorError::QuotaExceeded {
            limit_type,
            remaining_today: check.daily_remaining,
            remaining_month: check.monthly_remaining,
        },
        None => OrchestratorError::QuotaUnavailable,
    }
}

/// Runs an upstream call, converting caller cancellation and panics into
/// outcomes instead of letting them escape.
async fn guarded<F>(call: F, cancel: &CancellationToken) -> Execution
where
    F: Future<Output = Result<WorkflowResult, WorkflowError>> + Send,
{
    let call = AssertUnwindSafe(call).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Execution::Failed(WorkflowError::Cancelled),
        outcome = call => match outcome {
            Ok(Ok(result)) => Execution::Completed(result),
            Ok(Err(err)) => Execution::Failed(err),
            Err(payload) => Execution::Panicked(panic_message(payload.as_ref())),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: unknown payload".to_string()
    }
}

#[cfg(test)]
mod tests;
