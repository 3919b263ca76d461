use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};

use super::{
    ADMIN_TOKEN_HEADER, ErrorResponse, FlowgateHttpState, error_response, extract_bearer,
    extract_header,
};
use crate::audit::{AuditQuery, UsageLogEntry};

fn ensure_admin(
    state: &FlowgateHttpState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };

    let provided = extract_header(headers, ADMIN_TOKEN_HEADER)
        .or_else(|| extract_bearer(headers))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }

    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

pub(super) async fn list_usage(
    State(state): State<FlowgateHttpState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<UsageLogEntry>>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;

    let entries = state
        .orchestrator
        .audit()
        .list(&query)
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "listing usage entries failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "usage log unavailable",
            )
        })?;
    Ok(Json(entries))
}
