use std::convert::Infallible;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{FlowgateHttpState, error_body, error_reply, extract_credential, with_request_id};
use crate::orchestrator::{ExecutionOutcome, OrchestratorError};
use crate::quota::QuotaSnapshot;
use crate::workflow::{ResponseMode, ResultStatus, WorkflowEvent};

#[derive(Debug, Serialize)]
struct RunEnvelope {
    id: String,
    status: ResultStatus,
    data: RunEnvelopeData,
    usage: RunEnvelopeUsage,
}

#[derive(Debug, Serialize)]
struct RunEnvelopeData {
    outputs: Value,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunEnvelopeUsage {
    tokens: u64,
    /// Seconds.
    time: f64,
    remaining_today: u64,
    remaining_month: u64,
}

impl From<&ExecutionOutcome> for RunEnvelope {
    fn from(outcome: &ExecutionOutcome) -> Self {
        let result = &outcome.result;
        Self {
            id: result.run_id.clone(),
            status: result.status,
            data: RunEnvelopeData {
                outputs: result.outputs.clone(),
                error: result.error.clone(),
            },
            usage: RunEnvelopeUsage {
                tokens: result.usage.tokens,
                time: result.usage.elapsed_ms as f64 / 1000.0,
                remaining_today: outcome.remaining_today,
                remaining_month: outcome.remaining_month,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    daily_used: u64,
    daily_limit: u64,
    monthly_used: u64,
    monthly_limit: u64,
    remaining_today: u64,
    remaining_month: u64,
    last_reset: String,
}

impl From<QuotaSnapshot> for SnapshotResponse {
    fn from(snapshot: QuotaSnapshot) -> Self {
        Self {
            last_reset: snapshot.last_reset_rfc3339(),
            daily_used: snapshot.daily_used,
            daily_limit: snapshot.daily_limit,
            monthly_used: snapshot.monthly_used,
            monthly_limit: snapshot.monthly_limit,
            remaining_today: snapshot.remaining_today,
            remaining_month: snapshot.remaining_month,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct PollQuery {
    #[serde(default, rename = "runId")]
    run_id: Option<String>,
}

type RunTask = JoinHandle<Result<ExecutionOutcome, OrchestratorError>>;

/// Awaits a spawned run. A panic that escaped the orchestrator's own guard
/// still becomes an internal error rather than a dropped connection.
async fn join_run(task: RunTask) -> Result<ExecutionOutcome, OrchestratorError> {
    match task.await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "workflow task did not complete");
            Err(OrchestratorError::Internal(err.to_string()))
        }
    }
}

fn outcome_reply(outcome: Result<ExecutionOutcome, OrchestratorError>) -> Response {
    match outcome {
        Ok(outcome) => {
            let response = Json(RunEnvelope::from(&outcome)).into_response();
            with_request_id(response, &outcome.request_id)
        }
        Err(err) => error_reply(&err),
    }
}

pub(super) async fn execute_workflow(
    State(state): State<FlowgateHttpState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let credential = extract_credential(&headers);
    // Unparseable bodies go through the orchestrator so the rejection is recorded.
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let orchestrator = state.orchestrator.clone();
    let admission = match orchestrator
        .admit(credential.as_deref(), &workflow_id, &body)
        .await
    {
        Ok(admission) => admission,
        Err(err) => return error_reply(&err),
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    match admission.response_mode() {
        ResponseMode::Blocking => {
            let task = tokio::spawn(async move { orchestrator.run(admission, cancel).await });
            let outcome = join_run(task).await;
            let _ = guard.disarm();
            outcome_reply(outcome)
        }
        ResponseMode::Streaming => {
            let request_id = admission.request_id().to_string();
            let (events_tx, events) = mpsc::unbounded_channel();
            let task = tokio::spawn(async move {
                orchestrator
                    .run_streaming(admission, events_tx, cancel)
                    .await
            });
            let relay = EventRelay {
                events,
                task: Some(task),
                _guard: guard,
            };
            let response = Sse::new(relay.into_stream())
                .keep_alive(KeepAlive::default())
                .into_response();
            with_request_id(response, &request_id)
        }
    }
}

pub(super) async fn poll_workflow(
    State(state): State<FlowgateHttpState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
) -> Response {
    let credential = extract_credential(&headers);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .poll(
                credential.as_deref(),
                &workflow_id,
                query.run_id.as_deref(),
                cancel,
            )
            .await
    });
    let outcome = join_run(task).await;
    let _ = guard.disarm();
    outcome_reply(outcome)
}

pub(super) async fn quota_snapshot(
    State(state): State<FlowgateHttpState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let credential = extract_credential(&headers);
    match state
        .orchestrator
        .quota_snapshot(credential.as_deref(), &workflow_id)
        .await
    {
        Ok(snapshot) => Json(SnapshotResponse::from(snapshot)).into_response(),
        Err(err) => error_reply(&err),
    }
}

/// Relays upstream events as SSE until the run task finishes, then emits
/// one `result` or `error` event. Dropping the relay cancels the run.
struct EventRelay {
    events: mpsc::UnboundedReceiver<WorkflowEvent>,
    task: Option<RunTask>,
    _guard: DropGuard,
}

impl EventRelay {
    fn into_stream(self) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send {
        stream::unfold(self, |mut relay| async move {
            if let Some(event) = relay.events.recv().await {
                return Some((Ok(relay_event(&event)), relay));
            }
            let task = relay.task.take()?;
            let last = match join_run(task).await {
                Ok(outcome) => json_event("result", &RunEnvelope::from(&outcome)),
                Err(err) => json_event("error", &error_body(&err)),
            };
            Some((Ok(last), relay))
        })
    }
}

fn relay_event(event: &WorkflowEvent) -> Event {
    let name = event.name();
    let name = if name.is_empty() || name.contains(['\n', '\r']) {
        "message"
    } else {
        name
    };
    Event::default()
        .event(name)
        .data(event.payload.to_string())
}

fn json_event(name: &str, body: &impl Serialize) -> Event {
    let data = serde_json::to_string(body).unwrap_or_else(|_| "null".to_string());
    Event::default().event(name).data(data)
}
