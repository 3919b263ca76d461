//! axum surface over [`Orchestrator`].
//!
//! Every execution runs in its own task holding a cancellation token; the
//! token fires when the client goes away, so upstream work stops and the
//! usage entry is still written.

mod admin;
mod workflows;

use axum::Json;
use axum::Router;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;

use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::quota::LimitType;
use crate::workflow::WorkflowError;

/// Header carrying the caller's flowgate token when `Authorization` is not used.
pub const CREDENTIAL_HEADER: &str = "x-flowgate-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct FlowgateHttpState {
    orchestrator: Orchestrator,
    admin_token: Option<String>,
}

impl std::fmt::Debug for FlowgateHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowgateHttpState")
            .field("orchestrator", &self.orchestrator)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FlowgateHttpState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            admin_token: None,
        }
    }

    /// Enables `/admin/usage`, guarded by this token.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuotaExceededResponse {
    error: ErrorDetail,
    limit_type: LimitType,
    remaining_today: u64,
    remaining_month: u64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: FlowgateHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route(
            "/api/workflows/:workflow_id",
            get(workflows::poll_workflow)
                .post(workflows::execute_workflow)
                .put(workflows::quota_snapshot),
        );

    if state.admin_token.is_some() {
        router = router.route("/admin/usage", get(admin::list_usage));
    }

    router.with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.to_string(),
            },
        }),
    )
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Unauthorized => StatusCode::UNAUTHORIZED,
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::QuotaUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Upstream(WorkflowError::Http { status, .. })
            if (400..500).contains(status) =>
        {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::Upstream(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body shared by HTTP error replies and SSE `error` events.
fn error_body(err: &OrchestratorError) -> serde_json::Value {
    let error = ErrorDetail {
        code: err.code(),
        message: err.public_message(),
    };
    let body = match err {
        OrchestratorError::QuotaExceeded {
            limit_type,
            remaining_today,
            remaining_month,
        } => serde_json::to_value(QuotaExceededResponse {
            error,
            limit_type: *limit_type,
            remaining_today: *remaining_today,
            remaining_month: *remaining_month,
        }),
        _ => serde_json::to_value(ErrorResponse { error }),
    };
    body.unwrap_or(serde_json::Value::Null)
}

fn error_reply(err: &OrchestratorError) -> Response {
    (status_for(err), Json(error_body(err))).into_response()
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn extract_credential(headers: &HeaderMap) -> Option<String> {
    extract_bearer(headers).or_else(|| extract_header(headers, CREDENTIAL_HEADER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_client_errors_map_to_bad_request() {
        let err = OrchestratorError::Upstream(WorkflowError::from_status_body(
            422,
            r#"{"code":"invalid_param","message":"bad input"}"#.to_string(),
        ));
        assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);

        let err = OrchestratorError::Upstream(WorkflowError::from_status_body(
            503,
            String::new(),
        ));
        assert_eq!(status_for(&err), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&OrchestratorError::Upstream(WorkflowError::Timeout)),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn quota_error_body_carries_remaining_counts() {
        let body = error_body(&OrchestratorError::QuotaExceeded {
            limit_type: LimitType::Daily,
            remaining_today: 0,
            remaining_month: 290,
        });
        assert_eq!(body["error"]["code"], "quota_exceeded");
        assert_eq!(body["limitType"], "daily");
        assert_eq!(body["remainingToday"], 0);
        assert_eq!(body["remainingMonth"], 290);
    }

    #[test]
    fn credentials_prefer_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(CREDENTIAL_HEADER, HeaderValue::from_static(" key-1 "));
        assert_eq!(extract_credential(&headers).as_deref(), Some("key-1"));

        headers.insert("authorization", HeaderValue::from_static("Bearer tok-2"));
        assert_eq!(extract_credential(&headers).as_deref(), Some("tok-2"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_credential(&headers).as_deref(), Some("key-1"));
    }
}
