//! Builds the ordered candidate list for a job.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use kombo_core::{haversine_km, Job, PresenceRecord, ProviderCandidate};
use tracing::{debug, warn};

use super::tier_resolver::TierResolver;
use crate::traits::{PresenceStore, ProviderDirectory};

/// Ranks every eligible provider by tier, then by distance to the job origin.
///
/// The pool is the union of listed providers and providers with a presence
/// record. Only an explicit `online = false` excludes a provider; missing
/// coordinates count as distance 0. The search radius never excludes anyone.
pub struct CandidateRanker {
    presence: Arc<dyn PresenceStore>,
    directory: Arc<dyn ProviderDirectory>,
    tiers: TierResolver,
}

impl CandidateRanker {
    #[must_use]
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        directory: Arc<dyn ProviderDirectory>,
        tiers: TierResolver,
    ) -> Self {
        Self {
            presence,
            directory,
            tiers,
        }
    }

    /// Ordered candidates for `job`; never fails.
    pub async fn rank_candidates(&self, job: &Job) -> Vec<ProviderCandidate> {
        let records = match self.presence.query_presence().await {
            Ok(records) => records,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "presence query failed, ranking without positions");
                Vec::new()
            }
        };
        let listed = match self.directory.list_provider_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "provider directory unavailable, using presence only");
                Vec::new()
            }
        };

        let pool = candidate_pool(records, listed);
        let origin = job.origin.coordinates;

        let mut candidates = Vec::with_capacity(pool.len());
        for (user_id, presence) in pool {
            if presence.as_ref().is_some_and(PresenceRecord::is_explicitly_offline) {
                debug!(provider_id = %user_id, "skipping offline provider");
                continue;
            }
            let tier = self.tiers.resolve_tier(&user_id).await;
            let distance_km = match (origin, presence.as_ref().and_then(PresenceRecord::coordinates)) {
                (Some(from), Some(to)) => haversine_km(from, to),
                _ => 0.0,
            };
            candidates.push(ProviderCandidate {
                user_id,
                tier,
                distance_km,
            });
        }

        sort_candidates(&mut candidates);
        debug!(job_id = %job.id, candidates = candidates.len(), "ranked candidates");
        candidates
    }
}

/// Merges listed providers with presence records, keyed by provider id.
fn candidate_pool(
    records: Vec<PresenceRecord>,
    listed: Vec<String>,
) -> BTreeMap<String, Option<PresenceRecord>> {
    let mut pool: BTreeMap<String, Option<PresenceRecord>> =
        listed.into_iter().map(|id| (id, None)).collect();
    for record in records {
        pool.insert(record.user_id.clone(), Some(record));
    }
    pool
}

/// Sorts by tier rank ascending, then distance ascending.
pub fn sort_candidates(candidates: &mut [ProviderCandidate]) {
    candidates.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| a.distance_km.total_cmp(&b.distance_km))
    });
}

/// Groups ranked candidates into one wave per tier, in dispatch order.
///
/// A provider id appearing more than once keeps only its first (best ranked)
/// occurrence, so it is invited in exactly one wave.
#[must_use]
pub fn partition_waves(candidates: &[ProviderCandidate], wave_count: usize) -> Vec<Vec<String>> {
    let mut waves = vec![Vec::new(); wave_count];
    let mut seen = HashSet::new();
    for candidate in candidates {
        if !seen.insert(candidate.user_id.as_str()) {
            continue;
        }
        if let Some(wave) = waves.get_mut(candidate.tier.rank()) {
            wave.push(candidate.user_id.clone());
        }
    }
    waves
}
