//! Provider-facing endpoints: presence, the pending offer, accept and decline.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kombo_core::PresenceRecord;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{ApiError, AppState};
use crate::dispatch::AcceptOutcome;

/// Body of `PUT /providers/{id}/presence`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

/// `PUT /providers/{id}/presence`: writes presence and opens the provider's
/// offer inbox unless it went explicitly offline.
pub async fn put_presence(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(update): Json<PresenceUpdate>,
) -> Result<Json<PresenceRecord>, ApiError> {
    let record = PresenceRecord {
        user_id: provider_id.clone(),
        online: update.online,
        lat: update.lat,
        lng: update.lng,
        updated_at: state.clock.now(),
    };
    state.presence.upsert_presence(record.clone()).await?;

    let online = !record.is_explicitly_offline();
    state.acceptance.set_online(&provider_id, online);
    if online && state.acceptance.open_inbox(&provider_id).await? {
        info!(provider_id, "offer inbox opened");
    }
    Ok(Json(record))
}

/// `GET /providers/{id}/offer`: the live offer with its countdown, or 204.
pub async fn get_offer(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> Response {
    match state.acceptance.pending_offer(&provider_id) {
        Some(view) => Json(view).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// `POST /providers/{id}/offers/{job_id}/accept`
///
/// 202 once the accept is on its way; whether it wins is decided by the
/// dispatcher and visible on the job.
pub async fn accept_offer(
    State(state): State<AppState>,
    Path((provider_id, job_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let outcome = state.acceptance.accept_job(&job_id, &provider_id).await?;
    let status = match outcome {
        AcceptOutcome::Submitted => "submitted",
        AcceptOutcome::AlreadySubmitted => "already_submitted",
    };
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": status }))))
}

/// `POST /providers/{id}/offers/{job_id}/decline`
pub async fn decline_offer(
    State(state): State<AppState>,
    Path((provider_id, job_id)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let cleared = state.acceptance.decline_job(&job_id, &provider_id);
    Json(json!({ "cleared": cleared }))
}
