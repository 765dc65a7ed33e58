//! In-memory implementations of the storage traits backed by [`DashMap`].
//!
//! Suitable for development, tests, and single-node deployments where the
//! job table fits in memory.

use std::collections::BTreeSet;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kombo_core::tier::BOOST_REFERENCE_PREFIX;
use kombo_core::{Job, JobPatch, JobStatus, PresenceRecord, TierPurchase};
use parking_lot::RwLock;

use crate::traits::{JobStore, PresenceStore, ProviderDirectory, PurchaseLedger};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Job table keyed by job id.
///
/// `conditional_update_job` holds the shard write lock across the status
/// check and the write, so concurrent claims on the same job serialize.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => bail!("job {} already exists", job.id),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|r| r.clone()))
    }

    async fn conditional_update_job(
        &self,
        id: &str,
        expected: JobStatus,
        patch: &JobPatch,
    ) -> anyhow::Result<bool> {
        let mut job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        if job.status != expected {
            return Ok(false);
        }
        job.apply(patch)?;
        Ok(true)
    }

    async fn update_job(&self, id: &str, patch: &JobPatch) -> anyhow::Result<()> {
        let mut job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        job.apply(patch)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Purchases
// ---------------------------------------------------------------------------

/// Transaction log of purchases, keyed by provider.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    purchases: DashMap<String, Vec<TierPurchase>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a purchase row. Any reference is accepted; only rows starting
    /// with `boost:` are considered by tier lookups.
    pub fn record_purchase(&self, purchase: TierPurchase) {
        self.purchases
            .entry(purchase.provider_id.clone())
            .or_default()
            .push(purchase);
    }
}

fn is_boost_reference(reference: &str) -> bool {
    reference
        .get(..BOOST_REFERENCE_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(BOOST_REFERENCE_PREFIX))
}

#[async_trait]
impl PurchaseLedger for MemoryLedger {
    async fn latest_tier_purchase(
        &self,
        provider_id: &str,
    ) -> anyhow::Result<Option<TierPurchase>> {
        Ok(self.purchases.get(provider_id).and_then(|rows| {
            rows.iter()
                .filter(|p| is_boost_reference(&p.reference))
                .max_by_key(|p| p.purchased_at)
                .cloned()
        }))
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Presence records keyed by provider id.
#[derive(Debug, Default)]
pub struct MemoryPresence {
    records: DashMap<String, PresenceRecord>,
}

impl MemoryPresence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn query_presence(&self) -> anyhow::Result<Vec<PresenceRecord>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> anyhow::Result<()> {
        self.records.insert(record.user_id.clone(), record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Set of providers holding a service listing.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    providers: RwLock<BTreeSet<String>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, provider_id: impl Into<String>) {
        self.providers.write().insert(provider_id.into());
    }

    pub fn delist(&self, provider_id: &str) -> bool {
        self.providers.write().remove(provider_id)
    }
}

#[async_trait]
impl ProviderDirectory for MemoryDirectory {
    async fn list_provider_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.providers.read().iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kombo_core::{JobRequest, Place};

    use super::*;

    fn job(id: &str) -> Job {
        Job::new(
            id.to_string(),
            JobRequest {
                client_id: "c1".to_string(),
                origin: Place::named("Luanda"),
                destination: Place::named("Viana"),
                radius_km: None,
            },
            5.0,
            1,
        )
    }

    fn assign(provider_id: &str) -> JobPatch {
        JobPatch::Assign {
            provider_id: provider_id.to_string(),
            assigned_at: 10,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = MemoryJobStore::new();
        store.insert_job(&job("1")).await.unwrap();
        assert!(store.insert_job(&job("1")).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn conditional_update_only_from_expected_status() {
        let store = MemoryJobStore::new();
        store.insert_job(&job("1")).await.unwrap();

        assert!(store
            .conditional_update_job("1", JobStatus::Pending, &assign("p1"))
            .await
            .unwrap());
        assert!(!store
            .conditional_update_job("1", JobStatus::Pending, &assign("p2"))
            .await
            .unwrap());

        let stored = store.get_job("1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Assigned);
        assert_eq!(stored.assigned_provider_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn conditional_update_unknown_job_errors() {
        let store = MemoryJobStore::new();
        assert!(store
            .conditional_update_job("nope", JobStatus::Pending, &assign("p1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn update_rejects_terminal_job() {
        let store = MemoryJobStore::new();
        store.insert_job(&job("1")).await.unwrap();
        store
            .update_job("1", &JobPatch::NoService { finished_at: 5 })
            .await
            .unwrap();
        assert!(store.update_job("1", &assign("p1")).await.is_err());
        let stored = store.get_job("1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::NoService);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert_job(&job("1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .conditional_update_job("1", JobStatus::Pending, &assign(&format!("p{i}")))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn ledger_returns_latest_boost_purchase() {
        let ledger = MemoryLedger::new();
        for (reference, at) in [
            ("boost:lite:a", 100),
            ("topup:500", 900),
            ("BOOST:pro:b", 300),
            ("boost:max:c", 200),
        ] {
            ledger.record_purchase(TierPurchase {
                provider_id: "p1".to_string(),
                reference: reference.to_string(),
                purchased_at: at,
            });
        }

        let latest = ledger.latest_tier_purchase("p1").await.unwrap().unwrap();
        assert_eq!(latest.reference, "BOOST:pro:b");
        assert!(ledger.latest_tier_purchase("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn presence_upsert_replaces() {
        let presence = MemoryPresence::new();
        let mut record = PresenceRecord {
            user_id: "p1".to_string(),
            online: Some(true),
            lat: None,
            lng: None,
            updated_at: 1,
        };
        presence.upsert_presence(record.clone()).await.unwrap();
        record.online = Some(false);
        presence.upsert_presence(record).await.unwrap();

        let all = presence.query_presence().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_explicitly_offline());
    }

    #[tokio::test]
    async fn directory_lists_sorted_ids() {
        let directory = MemoryDirectory::new();
        directory.list("b");
        directory.list("a");
        directory.list("b");
        assert_eq!(directory.list_provider_ids().await.unwrap(), vec!["a", "b"]);
        assert!(directory.delist("a"));
        assert!(!directory.delist("a"));
    }
}
