//! Runtime dispatch configuration.

use axum::extract::State;
use axum::Json;
use kombo_core::DispatchConfig;

use super::AppState;

/// `GET /admin/dispatch-config`
pub async fn get_dispatch_config(State(state): State<AppState>) -> Json<DispatchConfig> {
    Json(state.jobs.dispatch_config())
}

/// `PUT /admin/dispatch-config`: replaces the parameters used by jobs
/// submitted from now on. Out-of-range values fall back to defaults; the
/// response is the config actually applied.
pub async fn put_dispatch_config(
    State(state): State<AppState>,
    Json(config): Json<DispatchConfig>,
) -> Json<DispatchConfig> {
    state.jobs.set_dispatch_config(config);
    Json(state.jobs.dispatch_config())
}
