//! Network module with deferred startup lifecycle.
//!
//! `new()` takes the wired application state, `start()` binds the TCP
//! listener, and `serve()` accepts requests until shutdown, then drains the
//! running dispatches.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    accept_offer, cancel_job, create_job, decline_offer, get_dispatch_config, get_job,
    get_job_progress, get_offer, health_handler, liveness_handler, put_dispatch_config,
    put_presence, readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Assembles the axum router with all routes and middleware.
///
/// Routes:
/// - `GET /health`, `GET /health/live`, `GET /health/ready`
/// - `POST /jobs`, `GET /jobs/{id}`, `GET /jobs/{id}/progress`,
///   `POST /jobs/{id}/cancel`
/// - `PUT /providers/{id}/presence`, `GET /providers/{id}/offer`,
///   `POST /providers/{id}/offers/{job_id}/accept`,
///   `POST /providers/{id}/offers/{job_id}/decline`
/// - `GET|PUT /admin/dispatch-config`
pub fn build_router(state: AppState, config: &NetworkConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/progress", get(get_job_progress))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/providers/{id}/presence", put(put_presence))
        .route("/providers/{id}/offer", get(get_offer))
        .route("/providers/{id}/offers/{job_id}/accept", post(accept_offer))
        .route("/providers/{id}/offers/{job_id}/decline", post(decline_offer))
        .route(
            "/admin/dispatch-config",
            get(get_dispatch_config).put(put_dispatch_config),
        )
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(build_http_layers(config))
        .with_state(state)
}

/// Manages the HTTP server lifecycle.
///
/// 1. `new()` -- takes the shared state; nothing is bound yet
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- handles requests until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
    drain_timeout: Duration,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, state: AppState, drain_timeout: Duration) -> Self {
        Self {
            config,
            listener: None,
            state,
            drain_timeout,
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound port, which differs from the configured one when
    /// port 0 asks for an OS-assigned port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves requests until `shutdown` resolves.
    ///
    /// After the signal:
    /// 1. Health state transitions to Draining and new jobs are refused
    /// 2. In-flight HTTP requests complete
    /// 3. Running dispatches are cancelled and awaited up to the drain timeout
    /// 4. Provider inboxes close and health transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let state = self.state;
        let router = build_router(state.clone(), &self.config);

        let controller = Arc::clone(&state.shutdown);
        let signal = async move {
            shutdown.await;
            info!("shutdown signal received");
            controller.trigger_shutdown();
        };

        state.shutdown.set_ready();
        info!("Serving HTTP connections");

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        let drained = state.jobs.shutdown(self.drain_timeout).await;
        state.acceptance.close_all_inboxes();
        if drained {
            info!("All dispatches drained successfully");
        } else {
            warn!(
                remaining = state.shutdown.active_dispatches(),
                "Drain timeout expired with dispatches still running"
            );
        }
        Ok(())
    }
}
