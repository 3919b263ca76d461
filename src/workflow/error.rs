use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Upstream failure taxonomy. Every variant is distinguishable so callers can
/// choose a logging and response policy per kind.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream network error: {0}")]
    Network(String),
    #[error("upstream http error ({status}) {code}: {message}")]
    Http {
        code: String,
        status: u16,
        message: String,
        body: String,
    },
    #[error("upstream event stream error: {0}")]
    Stream(String),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl WorkflowError {
    /// Transport faults and upstream 5xx are worth another attempt; 4xx are caller errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Timeout | WorkflowError::Network(_) => true,
            WorkflowError::Http { status, .. } => *status >= 500,
            WorkflowError::Stream(_)
            | WorkflowError::InvalidResponse(_)
            | WorkflowError::Cancelled => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Timeout => "timeout",
            WorkflowError::Network(_) => "network_error",
            WorkflowError::Http { .. } => "http_error",
            WorkflowError::Stream(_) => "stream_error",
            WorkflowError::InvalidResponse(_) => "invalid_response",
            WorkflowError::Cancelled => "cancelled",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            WorkflowError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Everything known about the failure, including the raw upstream body.
    pub fn snapshot(&self) -> Value {
        match self {
            WorkflowError::Http {
                code,
                status,
                message,
                body,
            } => json!({
                "kind": self.kind(),
                "status": status,
                "code": code,
                "message": message,
                "body": body,
            }),
            other => json!({
                "kind": other.kind(),
                "message": other.to_string(),
            }),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WorkflowError::Timeout
        } else {
            WorkflowError::Network(err.to_string())
        }
    }

    /// Builds an `Http` error from a non-2xx response body, reading `code` and
    /// `message` from the upstream JSON error shape when present.
    pub(crate) fn from_status_body(status: u16, body: String) -> Self {
        let parsed: UpstreamErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = parsed
            .message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| {
                reqwest::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|status| status.canonical_reason())
                    .unwrap_or("upstream error")
                    .to_string()
            });
        WorkflowError::Http {
            code: parsed
                .code
                .filter(|code| !code.trim().is_empty())
                .unwrap_or_else(|| format!("http_{status}")),
            status,
            message,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(WorkflowError::Timeout.is_retryable());
        assert!(WorkflowError::Network("reset".into()).is_retryable());
        assert!(WorkflowError::from_status_body(503, String::new()).is_retryable());
        assert!(!WorkflowError::from_status_body(400, String::new()).is_retryable());
        assert!(!WorkflowError::from_status_body(429, String::new()).is_retryable());
        assert!(!WorkflowError::Stream("eof".into()).is_retryable());
        assert!(!WorkflowError::Cancelled.is_retryable());
    }

    #[test]
    fn http_error_reads_upstream_code_and_message() {
        let err = WorkflowError::from_status_body(
            400,
            r#"{"code":"invalid_param","message":"inputs.x is required","status":400}"#.to_string(),
        );
        let WorkflowError::Http {
            code,
            status,
            message,
            ..
        } = err
        else {
            panic!("expected http error");
        };
        assert_eq!(code, "invalid_param");
        assert_eq!(status, 400);
        assert_eq!(message, "inputs.x is required");
    }

    #[test]
    fn http_error_falls_back_for_non_json_bodies() {
        let err = WorkflowError::from_status_body(502, "<html>bad gateway</html>".to_string());
        assert_eq!(err.status(), Some(502));
        let snapshot = err.snapshot();
        assert_eq!(snapshot["code"], "http_502");
        assert_eq!(snapshot["message"], "Bad Gateway");
        assert_eq!(snapshot["body"], "<html>bad gateway</html>");
    }
}
