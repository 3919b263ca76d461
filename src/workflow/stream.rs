use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use super::{RunData, WorkflowError, WorkflowResult};
use crate::Result as CrateResult;
use crate::utils::sse::SseFrame;

pub type WorkflowEventStream = BoxStream<'static, Result<WorkflowEvent, WorkflowError>>;

#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowEventKind {
    WorkflowStarted,
    NodeStarted,
    NodeFinished,
    WorkflowFinished(Box<RunData>),
    Error {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
    /// Any event name without special meaning here; relayed as-is.
    Other(String),
}

/// One decoded upstream event. `payload` is the frame's JSON exactly as received.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowEvent {
    pub kind: WorkflowEventKind,
    pub task_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub payload: Value,
}

impl WorkflowEvent {
    pub fn name(&self) -> &str {
        match &self.kind {
            WorkflowEventKind::WorkflowStarted => "workflow_started",
            WorkflowEventKind::NodeStarted => "node_started",
            WorkflowEventKind::NodeFinished => "node_finished",
            WorkflowEventKind::WorkflowFinished(_) => "workflow_finished",
            WorkflowEventKind::Error { .. } => "error",
            WorkflowEventKind::Other(name) => name,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            WorkflowEventKind::WorkflowFinished(_) | WorkflowEventKind::Error { .. }
        )
    }

    pub fn parse(data: &str) -> Result<Self, WorkflowError> {
        let payload: Value = serde_json::from_str(data)
            .map_err(|err| WorkflowError::Stream(format!("malformed event frame: {err}")))?;
        let name = payload
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkflowError::Stream("event frame has no `event` field".to_string()))?
            .to_string();
        let task_id = string_field(&payload, "task_id");
        let workflow_run_id = string_field(&payload, "workflow_run_id");

        let kind = match name.as_str() {
            "workflow_started" => WorkflowEventKind::WorkflowStarted,
            "node_started" => WorkflowEventKind::NodeStarted,
            "node_finished" => WorkflowEventKind::NodeFinished,
            "workflow_finished" => {
                let data = payload.get("data").cloned().ok_or_else(|| {
                    WorkflowError::Stream("workflow_finished event has no data".to_string())
                })?;
                let data = finished_data(data, workflow_run_id.as_deref());
                let data: RunData = serde_json::from_value(data).map_err(|err| {
                    WorkflowError::Stream(format!("malformed workflow_finished data: {err}"))
                })?;
                WorkflowEventKind::WorkflowFinished(Box::new(data))
            }
            "error" => WorkflowEventKind::Error {
                status: payload
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|status| u16::try_from(status).ok()),
                code: string_field(&payload, "code"),
                message: string_field(&payload, "message")
                    .unwrap_or_else(|| "workflow stream reported an error".to_string()),
            },
            _ => WorkflowEventKind::Other(name),
        };

        Ok(Self {
            kind,
            task_id,
            workflow_run_id,
            payload,
        })
    }
}

/// `workflow_finished` is terminal on its own: a missing `status` means the run
/// succeeded and a missing `id` falls back to the frame's `workflow_run_id`.
fn finished_data(mut data: Value, workflow_run_id: Option<&str>) -> Value {
    if let Value::Object(fields) = &mut data {
        if fields.get("status").is_none_or(Value::is_null) {
            fields.insert("status".to_string(), Value::from("succeeded"));
        }
        if fields.get("id").is_none_or(Value::is_null) {
            fields.insert(
                "id".to_string(),
                Value::from(workflow_run_id.unwrap_or_default()),
            );
        }
    }
    data
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Turns decoded SSE frames into workflow events. The stream stops after the
/// first terminal event, and ends with a `Stream` error if the frames run out
/// before one arrives.
pub(crate) fn workflow_events(
    frames: BoxStream<'static, CrateResult<SseFrame>>,
) -> WorkflowEventStream {
    Box::pin(stream::unfold(
        (frames, false),
        |(mut frames, done)| async move {
            if done {
                return None;
            }
            let item = match frames.next().await {
                Some(Ok(frame)) => WorkflowEvent::parse(&frame.data),
                Some(Err(err)) => Err(WorkflowError::Stream(err.to_string())),
                None => Err(WorkflowError::Stream(
                    "event stream ended before a terminal event".to_string(),
                )),
            };
            let done = match &item {
                Ok(event) => event.is_terminal(),
                Err(_) => true,
            };
            Some((item, (frames, done)))
        },
    ))
}

/// Accumulates what the events of one run say about it and produces the final
/// result from the terminal event.
#[derive(Debug)]
pub struct StreamCollector {
    workflow_id: String,
    task_id: Option<String>,
    run_id: Option<String>,
    events_seen: usize,
    terminal: Option<Result<WorkflowResult, WorkflowError>>,
}

impl StreamCollector {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: None,
            run_id: None,
            events_seen: 0,
            terminal: None,
        }
    }

    pub fn events_seen(&self) -> usize {
        self.events_seen
    }

    pub fn observe(&mut self, event: &WorkflowEvent) {
        self.events_seen += 1;
        if self.task_id.is_none() {
            self.task_id = event.task_id.clone();
        }
        if self.run_id.is_none() {
            self.run_id = event.workflow_run_id.clone();
        }
        if self.terminal.is_some() {
            return;
        }

        match &event.kind {
            WorkflowEventKind::WorkflowFinished(data) => {
                self.terminal = Some(Ok(WorkflowResult::from_run_data(
                    &self.workflow_id,
                    self.run_id.clone(),
                    self.task_id.clone(),
                    data.as_ref().clone(),
                    event.payload.clone(),
                )));
            }
            WorkflowEventKind::Error {
                status,
                code,
                message,
            } => {
                self.terminal = Some(Err(WorkflowError::Http {
                    code: code.clone().unwrap_or_else(|| "workflow_error".to_string()),
                    status: status.unwrap_or(500),
                    message: message.clone(),
                    body: event.payload.to_string(),
                }));
            }
            _ => {}
        }
    }

    pub fn finish(self) -> Result<WorkflowResult, WorkflowError> {
        self.terminal.unwrap_or_else(|| {
            Err(WorkflowError::Stream(format!(
                "event stream ended after {} events without a terminal event",
                self.events_seen
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ResultStatus, RunStatus};
    use serde_json::json;

    fn frame(value: Value) -> CrateResult<SseFrame> {
        Ok(SseFrame {
            event: None,
            data: value.to_string(),
        })
    }

    async fn collect(frames: Vec<CrateResult<SseFrame>>) -> (Vec<String>, Result<WorkflowResult, WorkflowError>) {
        let mut events = workflow_events(Box::pin(stream::iter(frames)));
        let mut collector = StreamCollector::new("wf-1");
        let mut names = Vec::new();
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    collector.observe(&event);
                    names.push(event.name().to_string());
                }
                Err(err) => return (names, Err(err)),
            }
        }
        (names, collector.finish())
    }

    #[tokio::test]
    async fn accumulates_terminal_workflow_finished() {
        let (names, result) = collect(vec![
            frame(json!({"event": "workflow_started", "task_id": "t-1", "workflow_run_id": "r-1", "data": {}})),
            frame(json!({"event": "node_started", "task_id": "t-1", "workflow_run_id": "r-1", "data": {"node_id": "n1"}})),
            frame(json!({"event": "node_finished", "task_id": "t-1", "workflow_run_id": "r-1", "data": {"node_id": "n1"}})),
            frame(json!({
                "event": "workflow_finished",
                "task_id": "t-1",
                "workflow_run_id": "r-1",
                "data": {
                    "id": "r-1",
                    "status": "succeeded",
                    "outputs": {"x": 1},
                    "total_tokens": 42,
                    "elapsed_time": 0.5
                }
            })),
        ])
        .await;

        assert_eq!(
            names,
            vec!["workflow_started", "node_started", "node_finished", "workflow_finished"]
        );
        let result = result.expect("result");
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.outputs["x"], 1);
        assert_eq!(result.usage.tokens, 42);
        assert_eq!(result.usage.elapsed_ms, 500);
        assert_eq!(result.run_id, "r-1");
        assert_eq!(result.task_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn minimal_workflow_finished_counts_as_success() {
        let event = WorkflowEvent::parse(
            r#"{"event":"workflow_finished","data":{"outputs":{"x":1},"total_tokens":42}}"#,
        )
        .expect("event");
        assert!(event.is_terminal());

        let mut collector = StreamCollector::new("wf-1");
        collector.observe(&event);
        let result = collector.finish().expect("result");
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.outputs["x"], 1);
        assert_eq!(result.usage.tokens, 42);
        assert_eq!(result.run_id, "");
    }

    #[test]
    fn workflow_finished_takes_run_id_from_the_frame() {
        let event = WorkflowEvent::parse(
            r#"{"event":"workflow_finished","workflow_run_id":"r-9","data":{"status":"failed","error":"boom"}}"#,
        )
        .expect("event");
        match event.kind {
            WorkflowEventKind::WorkflowFinished(data) => {
                assert_eq!(data.id, "r-9");
                assert_eq!(data.status, RunStatus::Failed);
            }
            other => panic!("unexpected event kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_terminal_event_is_a_stream_error() {
        let (names, result) = collect(vec![
            frame(json!({"event": "workflow_started", "data": {}})),
            frame(json!({"event": "node_started", "data": {}})),
        ])
        .await;

        assert_eq!(names.len(), 2);
        assert!(matches!(result, Err(WorkflowError::Stream(_))));
    }

    #[tokio::test]
    async fn error_event_terminates_with_http_error() {
        let (_, result) = collect(vec![
            frame(json!({"event": "workflow_started", "data": {}})),
            frame(json!({"event": "error", "status": 400, "code": "invalid_param", "message": "bad input"})),
            frame(json!({"event": "node_started", "data": {}})),
        ])
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unknown_events_pass_through() {
        let (names, result) = collect(vec![
            frame(json!({"event": "text_chunk", "data": {"text": "hi"}})),
            frame(json!({"event": "workflow_finished", "data": {"id": "r", "status": "stopped"}})),
        ])
        .await;

        assert_eq!(names, vec!["text_chunk", "workflow_finished"]);
        assert_eq!(result.expect("result").status, ResultStatus::Error);
    }

    #[tokio::test]
    async fn malformed_frame_stops_the_stream() {
        let (_, result) = collect(vec![Ok(SseFrame {
            event: None,
            data: "{not json".to_string(),
        })])
        .await;

        assert!(matches!(result, Err(WorkflowError::Stream(message)) if message.contains("malformed")));
    }
}
