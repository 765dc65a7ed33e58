//! HTTP handler definitions.
//!
//! Defines `AppState` (the shared state carried through axum extractors),
//! the JSON error type, and re-exports every handler for the router.

pub mod admin;
pub mod health;
pub mod jobs;
pub mod providers;

pub use admin::{get_dispatch_config, put_dispatch_config};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use jobs::{cancel_job, create_job, get_job, get_job_progress};
pub use providers::{accept_offer, decline_offer, get_offer, put_presence};

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kombo_core::{ClockSource, DispatchConfig};
use serde_json::json;
use tracing::error;

use super::ShutdownController;
use crate::dispatch::{
    AcceptanceHandler, CandidateRanker, DispatchError, TierResolver, WaveDispatcher,
};
use crate::service::{JobService, JobServiceError};
use crate::traits::{Backends, PresenceStore};

/// Shared application state passed to all handlers via `State` extraction.
///
/// Holds `Arc` references so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub acceptance: Arc<AcceptanceHandler>,
    pub presence: Arc<dyn PresenceStore>,
    pub clock: Arc<dyn ClockSource>,
    pub shutdown: Arc<ShutdownController>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Wires the dispatch pipeline over `backends`.
    #[must_use]
    pub fn new(
        backends: Backends,
        clock: Arc<dyn ClockSource>,
        dispatch: DispatchConfig,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        let resolver = TierResolver::new(backends.ledger, Arc::clone(&clock));
        let ranker = CandidateRanker::new(
            Arc::clone(&backends.presence),
            backends.directory,
            resolver,
        );
        let dispatcher = WaveDispatcher::new(
            Arc::clone(&backends.jobs),
            Arc::clone(&backends.channel),
            Arc::clone(&clock),
        );
        let jobs = JobService::new(
            backends.jobs,
            Arc::new(ranker),
            Arc::new(dispatcher),
            Arc::clone(&clock),
            dispatch,
            Arc::clone(&shutdown),
        );
        let acceptance = AcceptanceHandler::new(backends.channel, Arc::clone(&clock));

        Self {
            jobs: Arc::new(jobs),
            acceptance: Arc::new(acceptance),
            presence: backends.presence,
            clock,
            shutdown,
            start_time: Instant::now(),
        }
    }
}

/// Error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Service(JobServiceError),
    Internal(anyhow::Error),
}

impl From<JobServiceError> for ApiError {
    fn from(e: JobServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Service(JobServiceError::UnknownJob(id)) => {
                (StatusCode::NOT_FOUND, format!("job {id} not found"))
            }
            Self::Service(JobServiceError::Draining) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "server is shutting down".to_string(),
            ),
            Self::Service(JobServiceError::Dispatch(e @ DispatchError::InsertJob { .. })) => {
                error!(error = ?e, "job insert failed");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            Self::Service(e) => {
                error!(error = ?e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            Self::Internal(e) => {
                error!(error = ?e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
