//! Client-facing job endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use kombo_core::{Job, JobRequest};
use serde_json::json;

use super::{ApiError, AppState};
use crate::dispatch::DispatchProgress;

/// `POST /jobs`: creates a `pending` job and starts dispatching it.
///
/// Responds 201 with the job as stored. Dispatch continues in the background;
/// poll `/jobs/{id}/progress` to follow it.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    if request.client_id.trim().is_empty() {
        return Err(ApiError::BadRequest("clientId must not be empty".to_string()));
    }
    if request.radius_km.is_some_and(|r| !r.is_finite() || r <= 0.0) {
        return Err(ApiError::BadRequest(
            "radiusKm must be a positive number".to_string(),
        ));
    }

    let handle = state.jobs.submit(request).await?;
    Ok((StatusCode::CREATED, Json(handle.job)))
}

/// `GET /jobs/{id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.job(&job_id).await?))
}

/// `GET /jobs/{id}/progress`
pub async fn get_job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<DispatchProgress>, ApiError> {
    Ok(Json(state.jobs.progress(&job_id).await?))
}

/// `POST /jobs/{id}/cancel`: stops the dispatch and leaves the job `pending`.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cancelled = state.jobs.cancel(&job_id).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}
