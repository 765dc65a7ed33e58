use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use kombo_core::DispatchConfig;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique identifier for this server node.
    pub node_id: String,
    /// Dispatch parameters applied to newly submitted jobs.
    pub dispatch: DispatchConfig,
    /// How long shutdown waits for active dispatches after cancelling them.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            dispatch: DispatchConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Loads an operator parameter blob (`{"radiusKm": 8, "maxWaves": 3, ...}`).
///
/// Missing keys keep their defaults; the result is sanitized.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid JSON.
pub fn load_dispatch_overrides(path: &Path) -> anyhow::Result<DispatchConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading dispatch config {}", path.display()))?;
    let config: DispatchConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing dispatch config {}", path.display()))?;
    Ok(config.sanitized())
}
