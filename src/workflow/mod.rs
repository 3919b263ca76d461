//! Upstream workflow execution: request/result types, the HTTP client, retry
//! policy and the streamed event protocol.

pub mod client;
pub mod error;
pub mod retry;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use client::{WorkflowClient, WorkflowClientConfig};
pub use error::WorkflowError;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper, retry_with_backoff};
pub use stream::{StreamCollector, WorkflowEvent, WorkflowEventKind, WorkflowEventStream};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Blocking,
    Streaming,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub response_mode: ResponseMode,
    pub user: String,
}

impl WorkflowRunRequest {
    pub fn new(user: impl Into<String>, inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            response_mode: ResponseMode::Blocking,
            user: user.into(),
        }
    }
}

/// Run status as reported by the upstream API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Stopped,
}

/// Normalized status handed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Success,
    Error,
}

impl From<RunStatus> for ResultStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => ResultStatus::Pending,
            RunStatus::Succeeded => ResultStatus::Success,
            RunStatus::Failed | RunStatus::Stopped => ResultStatus::Error,
        }
    }
}

/// The `data` object of upstream run responses and `workflow_finished` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    pub id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds, as reported upstream. Runs still in progress may send `null`.
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct RunResponse {
    pub workflow_run_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub data: RunData,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub tokens: u64,
    pub elapsed_ms: u64,
    pub total_steps: u32,
}

/// One upstream run, normalized at the client boundary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub task_id: Option<String>,
    pub workflow_id: String,
    pub status: ResultStatus,
    pub run_status: RunStatus,
    pub outputs: Value,
    pub error: Option<String>,
    pub usage: RunUsage,
    /// Upstream payload this result was built from. Only ever persisted to the audit log.
    #[serde(skip)]
    pub raw: Value,
}

impl WorkflowResult {
    pub(crate) fn from_run_data(
        workflow_id: &str,
        run_id: Option<String>,
        task_id: Option<String>,
        data: RunData,
        raw: Value,
    ) -> Self {
        let elapsed_time = data.elapsed_time.unwrap_or_default();
        let elapsed_ms = if elapsed_time.is_finite() && elapsed_time > 0.0 {
            (elapsed_time * 1000.0).round() as u64
        } else {
            0
        };
        Self {
            run_id: run_id.unwrap_or_else(|| data.id.clone()),
            task_id,
            workflow_id: data
                .workflow_id
                .clone()
                .unwrap_or_else(|| workflow_id.to_string()),
            status: data.status.into(),
            run_status: data.status,
            outputs: data.outputs.unwrap_or_else(|| Value::Object(Map::new())),
            error: data.error.filter(|error| !error.is_empty()),
            usage: RunUsage {
                tokens: data.total_tokens.unwrap_or_default(),
                elapsed_ms,
                total_steps: data.total_steps.unwrap_or_default(),
            },
            raw,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// The seam the orchestrator executes through. [`WorkflowClient`] is the
/// production implementation; retries happen behind it.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn run(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
    ) -> Result<WorkflowResult, WorkflowError>;

    async fn run_status(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowResult, WorkflowError>;

    async fn run_streaming(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
        on_event: &mut (dyn FnMut(WorkflowEvent) + Send),
    ) -> Result<WorkflowResult, WorkflowError>;
}
