//! Resolves a provider's active boost tier from the purchase ledger.

use std::sync::Arc;

use kombo_core::{BoostTier, ClockSource};
use tracing::{debug, warn};

use crate::traits::PurchaseLedger;

/// Reads the latest boost purchase and checks its validity window.
///
/// Fails open: any ledger error yields [`BoostTier::None`], so a broken
/// ledger demotes providers instead of excluding them.
pub struct TierResolver {
    ledger: Arc<dyn PurchaseLedger>,
    clock: Arc<dyn ClockSource>,
}

impl TierResolver {
    #[must_use]
    pub fn new(ledger: Arc<dyn PurchaseLedger>, clock: Arc<dyn ClockSource>) -> Self {
        Self { ledger, clock }
    }

    /// Tier in force for `provider_id` right now.
    pub async fn resolve_tier(&self, provider_id: &str) -> BoostTier {
        let purchase = match self.ledger.latest_tier_purchase(provider_id).await {
            Ok(Some(purchase)) => purchase,
            Ok(None) => return BoostTier::None,
            Err(e) => {
                warn!(provider_id, error = %e, "tier lookup failed, treating provider as untiered");
                return BoostTier::None;
            }
        };

        let now = self.clock.now();
        let tier = purchase.active_tier(now);
        if tier == BoostTier::None {
            debug!(
                provider_id,
                reference = %purchase.reference,
                purchased_at = purchase.purchased_at,
                "latest boost purchase is unrecognized or expired"
            );
        }
        tier
    }
}
