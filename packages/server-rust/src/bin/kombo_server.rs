//! `kombo-server`: runs the dispatch engine over in-memory backends behind
//! the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kombo_core::{DispatchConfig, SystemClock};
use kombo_server::network::{AppState, NetworkConfig, NetworkModule, ShutdownController};
use kombo_server::service::{load_dispatch_overrides, ServerConfig};
use kombo_server::storage::InMemoryBackends;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kombo-server", version, about = "Wave-based job dispatch server")]
struct Args {
    #[arg(long, env = "KOMBO_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "KOMBO_PORT", default_value_t = 8080)]
    port: u16,

    /// Node identifier used in logs. Random when unset.
    #[arg(long, env = "KOMBO_NODE_ID")]
    node_id: Option<String>,

    /// JSON parameter blob; individual flags below override its keys.
    #[arg(long, env = "KOMBO_DISPATCH_CONFIG")]
    dispatch_config: Option<PathBuf>,

    #[arg(long, env = "KOMBO_RADIUS_KM")]
    radius_km: Option<f64>,

    #[arg(long, env = "KOMBO_WAVE_TIMEOUT_SEC")]
    wave_timeout_sec: Option<f64>,

    #[arg(long, env = "KOMBO_WAIT_BETWEEN_WAVES_SEC")]
    wait_between_waves_sec: Option<f64>,

    #[arg(long, env = "KOMBO_MAX_WAVES")]
    max_waves: Option<usize>,

    #[arg(long, env = "KOMBO_SKIP_EMPTY_WAVES")]
    skip_empty_waves: Option<bool>,

    /// Seconds to wait for running dispatches on shutdown.
    #[arg(long, env = "KOMBO_DRAIN_TIMEOUT_SEC", default_value_t = 30)]
    drain_timeout_sec: u64,

    /// Allowed CORS origins, comma separated.
    #[arg(long, env = "KOMBO_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Serve Prometheus metrics on this port. Disabled when unset.
    #[arg(long, env = "KOMBO_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "KOMBO_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut dispatch = match &self.dispatch_config {
            Some(path) => load_dispatch_overrides(path)?,
            None => DispatchConfig::default(),
        };
        if let Some(radius) = self.radius_km {
            dispatch.search_radius_km = radius;
        }
        if let Some(timeout) = self.wave_timeout_sec {
            dispatch.wave_timeout_sec = timeout;
        }
        if let Some(wait) = self.wait_between_waves_sec {
            dispatch.wait_between_waves_sec = wait;
        }
        if let Some(max) = self.max_waves {
            dispatch.max_waves = max;
        }
        if let Some(skip) = self.skip_empty_waves {
            dispatch.skip_empty_waves = skip;
        }

        Ok(ServerConfig {
            node_id: self
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            dispatch: dispatch.sanitized(),
            drain_timeout: Duration::from_secs(self.drain_timeout_sec),
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn run(args: Args, config: ServerConfig) -> anyhow::Result<()> {
    info!(dispatch = ?config.dispatch, "starting kombo-server");

    if let Some(port) = args.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("installing prometheus exporter")?;
        info!(port, "metrics exporter listening");
    }

    let backends = InMemoryBackends::new();
    let state = AppState::new(
        backends.backends(),
        Arc::new(SystemClock),
        config.dispatch.clone(),
        Arc::new(ShutdownController::new()),
    );

    let network = NetworkConfig {
        host: args.host,
        port: args.port,
        cors_origins: args.cors_origins,
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(network, state, config.drain_timeout);
    let port = module.start().await?;
    info!(port, "listening");

    module.serve(shutdown_signal()).await?;
    info!("kombo-server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.server_config().context("loading configuration")?;
    let span = tracing::info_span!("node", node_id = %config.node_id);
    run(args, config).instrument(span).await
}
