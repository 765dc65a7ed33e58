//! Operator-tunable dispatch parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tier::BoostTier;

/// Parameters of one wave-based dispatch.
///
/// Deserializes from the operator parameter blob (`radiusKm`,
/// `waveTimeoutSec`, `waitBetweenWavesSec`, `maxWaves`, `skipEmptyWaves`);
/// missing keys take their defaults. Always pass values through
/// [`DispatchConfig::sanitized`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    #[serde(rename = "radiusKm")]
    pub search_radius_km: f64,
    pub wave_timeout_sec: f64,
    pub wait_between_waves_sec: f64,
    pub max_waves: usize,
    /// Skip the timeout and pause for tiers without candidates.
    pub skip_empty_waves: bool,
}

impl DispatchConfig {
    pub const DEFAULT_RADIUS_KM: f64 = 5.0;
    pub const DEFAULT_WAVE_TIMEOUT_SEC: f64 = 10.0;
    pub const DEFAULT_WAIT_BETWEEN_WAVES_SEC: f64 = 3.0;
    pub const DEFAULT_MAX_WAVES: usize = 6;
    /// Upper bound for the wave timeout and the pause between waves.
    pub const MAX_TIMING_SEC: f64 = 3600.0;

    /// Replaces every non-finite or non-positive value with its default and
    /// clamps both timings to [`Self::MAX_TIMING_SEC`].
    #[must_use]
    pub fn sanitized(&self) -> Self {
        Self {
            search_radius_km: positive_or(self.search_radius_km, Self::DEFAULT_RADIUS_KM),
            wave_timeout_sec: timing_or(self.wave_timeout_sec, Self::DEFAULT_WAVE_TIMEOUT_SEC),
            wait_between_waves_sec: timing_or(
                self.wait_between_waves_sec,
                Self::DEFAULT_WAIT_BETWEEN_WAVES_SEC,
            ),
            max_waves: if self.max_waves == 0 {
                Self::DEFAULT_MAX_WAVES
            } else {
                self.max_waves
            },
            skip_empty_waves: self.skip_empty_waves,
        }
    }

    /// Number of waves actually run: one per tier at most.
    #[must_use]
    pub fn wave_count(&self) -> usize {
        self.max_waves.min(BoostTier::COUNT)
    }

    /// Radius for a job, falling back to the configured default.
    #[must_use]
    pub fn radius_for(&self, requested: Option<f64>) -> f64 {
        requested
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or_else(|| positive_or(self.search_radius_km, Self::DEFAULT_RADIUS_KM))
    }

    #[must_use]
    pub fn wave_timeout(&self) -> Duration {
        Duration::from_secs_f64(timing_or(
            self.wave_timeout_sec,
            Self::DEFAULT_WAVE_TIMEOUT_SEC,
        ))
    }

    #[must_use]
    pub fn wait_between_waves(&self) -> Duration {
        Duration::from_secs_f64(timing_or(
            self.wait_between_waves_sec,
            Self::DEFAULT_WAIT_BETWEEN_WAVES_SEC,
        ))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: Self::DEFAULT_RADIUS_KM,
            wave_timeout_sec: Self::DEFAULT_WAVE_TIMEOUT_SEC,
            wait_between_waves_sec: Self::DEFAULT_WAIT_BETWEEN_WAVES_SEC,
            max_waves: Self::DEFAULT_MAX_WAVES,
            skip_empty_waves: false,
        }
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

fn timing_or(value: f64, fallback: f64) -> f64 {
    positive_or(value, fallback).min(DispatchConfig::MAX_TIMING_SEC)
}
