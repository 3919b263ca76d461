use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;

use super::stream::workflow_events;
use super::{
    ResponseMode, RetryPolicy, RunData, RunResponse, Sleeper, StreamCollector, TokioSleeper,
    WorkflowError, WorkflowEvent, WorkflowEventStream, WorkflowExecutor, WorkflowResult,
    WorkflowRunRequest, retry_with_backoff,
};
use crate::utils::http::{MAX_ERROR_BODY_BYTES, join_url, response_text_truncated};
use crate::utils::sse::{SseLimits, sse_frames_from_response};

#[derive(Clone)]
pub struct WorkflowClientConfig {
    /// Versioned API root, e.g. `https://workflows.example.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub poll_timeout: Duration,
    /// Bound on a whole streamed run, from request to terminal event.
    pub stream_timeout: Duration,
    pub sse_limits: SseLimits,
}

impl WorkflowClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(300),
            sse_limits: SseLimits::default(),
        }
    }
}

impl fmt::Debug for WorkflowClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("poll_timeout", &self.poll_timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("sse_limits", &self.sse_limits)
            .finish()
    }
}

#[derive(Clone)]
pub struct WorkflowClient {
    http: reqwest::Client,
    config: WorkflowClientConfig,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for WorkflowClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowClient")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl WorkflowClient {
    pub fn new(config: WorkflowClientConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_http_client(http, config))
    }

    pub fn with_http_client(http: reqwest::Client, config: WorkflowClientConfig) -> Self {
        Self {
            http,
            config,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &WorkflowClientConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn run_url(&self, workflow_id: &str) -> String {
        join_url(&self.config.base_url, &format!("workflows/{workflow_id}/run"))
    }

    fn run_status_url(&self, workflow_id: &str, run_id: &str) -> String {
        join_url(
            &self.config.base_url,
            &format!("workflows/{workflow_id}/runs/{run_id}"),
        )
    }

    /// One blocking run, no retries.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
    ) -> Result<WorkflowResult, WorkflowError> {
        let mut body = request.clone();
        body.response_mode = ResponseMode::Blocking;

        tracing::debug!(workflow_id, user = %body.user, "executing workflow");
        let response = self
            .http
            .post(self.run_url(workflow_id))
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(WorkflowError::from_reqwest)?;

        let raw = read_json(response).await?;
        let parsed: RunResponse = serde_json::from_value(raw.clone()).map_err(|err| {
            WorkflowError::InvalidResponse(format!("unexpected run response shape: {err}"))
        })?;
        Ok(WorkflowResult::from_run_data(
            workflow_id,
            Some(parsed.workflow_run_id),
            parsed.task_id,
            parsed.data,
            raw,
        ))
    }

    /// Current state of a run started earlier. Accepts both the bare run object
    /// and one wrapped in `data`.
    pub async fn get_workflow_run(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowResult, WorkflowError> {
        tracing::debug!(workflow_id, run_id, "polling workflow run");
        let response = self
            .http
            .get(self.run_status_url(workflow_id, run_id))
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.poll_timeout)
            .send()
            .await
            .map_err(WorkflowError::from_reqwest)?;

        let raw = read_json(response).await?;
        let data = match raw.get("data") {
            Some(data) if data.is_object() => data.clone(),
            _ => raw.clone(),
        };
        let data: RunData = serde_json::from_value(data).map_err(|err| {
            WorkflowError::InvalidResponse(format!("unexpected run status shape: {err}"))
        })?;
        Ok(WorkflowResult::from_run_data(
            workflow_id,
            Some(run_id.to_string()),
            None,
            data,
            raw,
        ))
    }

    pub async fn execute_workflow_with_retry(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
        policy: &RetryPolicy,
    ) -> Result<WorkflowResult, WorkflowError> {
        retry_with_backoff(policy, self.sleeper.as_ref(), |_| {
            self.execute_workflow(workflow_id, request)
        })
        .await
    }

    /// Opens a streamed run. Non-2xx answers fail here, before any event is read.
    pub async fn stream_workflow(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
    ) -> Result<WorkflowEventStream, WorkflowError> {
        let mut body = request.clone();
        body.response_mode = ResponseMode::Streaming;

        tracing::debug!(workflow_id, user = %body.user, "opening workflow event stream");
        let response = self
            .http
            .post(self.run_url(workflow_id))
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(WorkflowError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(WorkflowError::from_status_body(status.as_u16(), text));
        }
        Ok(workflow_events(sse_frames_from_response(
            response,
            self.config.sse_limits,
        )))
    }

    /// Streams a run to completion, handing each event to `on_event` as it
    /// arrives. Opening the stream is retried under the client's policy; once
    /// events have been delivered the run is never restarted.
    pub async fn execute_workflow_streaming<F>(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
        mut on_event: F,
    ) -> Result<WorkflowResult, WorkflowError>
    where
        F: FnMut(WorkflowEvent) + Send,
    {
        let consume = async {
            let mut events = retry_with_backoff(&self.retry, self.sleeper.as_ref(), |_| {
                self.stream_workflow(workflow_id, request)
            })
            .await?;

            let mut collector = StreamCollector::new(workflow_id);
            while let Some(event) = events.next().await {
                let event = event?;
                collector.observe(&event);
                on_event(event);
            }
            collector.finish()
        };

        match tokio::time::timeout(self.config.stream_timeout, consume).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Timeout),
        }
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, WorkflowError> {
    let status = response.status();
    if !status.is_success() {
        let text = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
        return Err(WorkflowError::from_status_body(status.as_u16(), text));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(WorkflowError::from_reqwest)?;
    serde_json::from_slice(&bytes)
        .map_err(|err| WorkflowError::InvalidResponse(format!("response is not json: {err}")))
}

#[async_trait]
impl WorkflowExecutor for WorkflowClient {
    async fn run(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.execute_workflow_with_retry(workflow_id, request, &self.retry)
            .await
    }

    async fn run_status(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowResult, WorkflowError> {
        retry_with_backoff(&self.retry, self.sleeper.as_ref(), |_| {
            self.get_workflow_run(workflow_id, run_id)
        })
        .await
    }

    async fn run_streaming(
        &self,
        workflow_id: &str,
        request: &WorkflowRunRequest,
        on_event: &mut (dyn FnMut(WorkflowEvent) + Send),
    ) -> Result<WorkflowResult, WorkflowError> {
        self.execute_workflow_streaming(workflow_id, request, on_event)
            .await
    }
}
