//! Paid-visibility boost tiers and purchase-record interpretation.
//!
//! A provider's tier is never stored. It is derived from the most recent
//! purchase in the transaction log whose reference looks like
//! `boost:<tier>:<anything>`, and is only in force while
//! `purchased_at + duration(tier)` lies in the future.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::HOUR_MS;

/// Reference prefix that marks a transaction as a boost purchase.
pub const BOOST_REFERENCE_PREFIX: &str = "boost:";

static BOOST_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^boost:(start|lite|pro|max|elite):").expect("boost reference pattern is valid")
});

// ---------------------------------------------------------------------------
// BoostTier
// ---------------------------------------------------------------------------

/// Priority tier of a provider, highest priority first.
///
/// The declaration order is the dispatch order: `Elite` is wave 0 and `None`
/// is the last wave. `Ord` follows the declaration order, so sorting a list of
/// tiers ascending yields dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoostTier {
    Elite,
    Max,
    Pro,
    Lite,
    Start,
    None,
}

impl BoostTier {
    /// All tiers in dispatch order.
    pub const ALL: [BoostTier; 6] = [
        BoostTier::Elite,
        BoostTier::Max,
        BoostTier::Pro,
        BoostTier::Lite,
        BoostTier::Start,
        BoostTier::None,
    ];

    /// Number of tiers, and therefore the maximum number of waves.
    pub const COUNT: usize = Self::ALL.len();

    /// Zero-based dispatch rank (`Elite` = 0 … `None` = 5).
    #[must_use]
    pub fn rank(self) -> usize {
        match self {
            Self::Elite => 0,
            Self::Max => 1,
            Self::Pro => 2,
            Self::Lite => 3,
            Self::Start => 4,
            Self::None => 5,
        }
    }

    /// Tier opened by wave `rank`, if any.
    #[must_use]
    pub fn from_rank(rank: usize) -> Option<Self> {
        Self::ALL.get(rank).copied()
    }

    /// How long a purchase of this tier stays in force.
    #[must_use]
    pub fn duration_hours(self) -> u64 {
        match self {
            Self::Start => 24,
            Self::Lite => 72,
            Self::Pro => 7 * 24,
            Self::Max => 15 * 24,
            Self::Elite => 30 * 24,
            Self::None => 0,
        }
    }

    /// Validity window in milliseconds.
    #[must_use]
    pub fn duration_ms(self) -> u64 {
        self.duration_hours() * HOUR_MS
    }

    /// Wire name of the tier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elite => "elite",
            Self::Max => "max",
            Self::Pro => "pro",
            Self::Lite => "lite",
            Self::Start => "start",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BoostTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown boost tier: {0:?}")]
pub struct ParseTierError(pub String);

impl FromStr for BoostTier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| ParseTierError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// TierPurchase
// ---------------------------------------------------------------------------

/// A boost purchase row from the transaction log.
///
/// This is the deserialization boundary for tiers: the free-form `reference`
/// is only turned into a [`BoostTier`] by [`TierPurchase::tier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPurchase {
    pub provider_id: String,
    /// Transaction reference, e.g. `boost:pro:2024-05-01`.
    pub reference: String,
    /// Purchase time, millis since epoch.
    pub purchased_at: u64,
}

impl TierPurchase {
    /// Parses the purchased tier out of the reference.
    ///
    /// Returns `None` for references that are not boost purchases or name a
    /// tier that cannot be bought (`none`).
    #[must_use]
    pub fn tier(&self) -> Option<BoostTier> {
        BOOST_REFERENCE
            .captures(&self.reference)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Instant at which the purchase stops being in force.
    #[must_use]
    pub fn expires_at(&self) -> Option<u64> {
        self.tier()
            .map(|tier| self.purchased_at.saturating_add(tier.duration_ms()))
    }

    /// Tier this purchase grants at `now_ms`, or `None` once expired.
    #[must_use]
    pub fn active_tier(&self, now_ms: u64) -> BoostTier {
        match (self.tier(), self.expires_at()) {
            (Some(tier), Some(expiry)) if now_ms < expiry => tier,
            _ => BoostTier::None,
        }
    }
}
