use thiserror::Error;

use crate::quota::LimitType;
use crate::workflow::WorkflowError;

/// Why a request did not produce a workflow result.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("missing or invalid credential")]
    Unauthorized,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("{} quota exceeded", limit_type.as_str())]
    QuotaExceeded {
        limit_type: LimitType,
        remaining_today: u64,
        remaining_month: u64,
    },
    #[error("quota service unavailable")]
    QuotaUnavailable,
    #[error(transparent)]
    Upstream(WorkflowError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Unauthorized => "unauthorized",
            OrchestratorError::Validation(_) => "invalid_request",
            OrchestratorError::WorkflowNotFound(_) => "workflow_not_found",
            OrchestratorError::QuotaExceeded { .. } => "quota_exceeded",
            OrchestratorError::QuotaUnavailable => "quota_unavailable",
            OrchestratorError::Upstream(err) => match err {
                WorkflowError::Timeout => "upstream_timeout",
                WorkflowError::Network(_) => "upstream_network_error",
                WorkflowError::Http { .. } => "upstream_http_error",
                WorkflowError::Stream(_) => "upstream_stream_error",
                WorkflowError::InvalidResponse(_) => "upstream_invalid_response",
                WorkflowError::Cancelled => "cancelled",
            },
            OrchestratorError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show a caller. Upstream bodies never appear here.
    pub fn public_message(&self) -> String {
        match self {
            OrchestratorError::Upstream(err) => match err {
                WorkflowError::Timeout => "the workflow service did not respond in time".to_string(),
                WorkflowError::Network(_) => "the workflow service could not be reached".to_string(),
                WorkflowError::Http { status, .. } if (400..500).contains(status) => {
                    "the workflow service rejected the request".to_string()
                }
                WorkflowError::Http { .. } => "the workflow service failed".to_string(),
                WorkflowError::Stream(_) => "the workflow event stream was interrupted".to_string(),
                WorkflowError::InvalidResponse(_) => {
                    "the workflow service returned an unreadable response".to_string()
                }
                WorkflowError::Cancelled => "the request was cancelled".to_string(),
            },
            OrchestratorError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<WorkflowError> for OrchestratorError {
    fn from(err: WorkflowError) -> Self {
        OrchestratorError::Upstream(err)
    }
}
