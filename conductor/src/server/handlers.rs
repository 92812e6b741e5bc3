//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use control_api::{
    ErrorResponse, ExecutionControlResponse, HealthResponse, PlanListResponse, PlanSummary,
    VersionResponse,
};

use crate::errors::ConductorError;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error mapped onto a status code and JSON body
pub struct ApiError(StatusCode, String);

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        let status = match &err {
            ConductorError::NotFound(_) => StatusCode::NOT_FOUND,
            ConductorError::WorkflowError(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {}", err);
        }
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fwconductor".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Plans handler
pub async fn plans_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<PlanListResponse>, ApiError> {
    let plans: Vec<PlanSummary> = state
        .store
        .list_plans()
        .await?
        .into_iter()
        .map(|plan| PlanSummary {
            device_count: plan.device_ids.len(),
            id: plan.id,
            name: plan.name,
            kind: plan.kind.as_str().to_string(),
            status: plan.status.as_str().to_string(),
            group: plan.group.name,
            next_execution_date: Some(plan.next_execution_date),
        })
        .collect();

    let total = plans.len();
    Ok(Json(PlanListResponse { plans, total }))
}

/// Execution handler, including the step log
pub async fn execution_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let execution = state
        .engine
        .get_execution(&id)
        .await?
        .ok_or_else(|| ConductorError::NotFound(format!("execution {}", id)))?;
    Ok(Json(execution))
}

/// Cancel handler
pub async fn cancel_execution_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionControlResponse>, ApiError> {
    let execution = state.engine.cancel(&id).await?;
    Ok(Json(ExecutionControlResponse {
        success: true,
        execution_id: execution.id,
        status: execution.status.as_str().to_string(),
        message: Some("Execution cancelled".to_string()),
    }))
}
