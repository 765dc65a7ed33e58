use std::sync::Arc;

use async_trait::async_trait;
use kombo_core::{
    Job, JobPatch, JobStatus, NotificationEvent, PresenceRecord, TierPurchase, Topic,
};

use crate::notify::Subscription;

/// Transactional row store holding job records.
///
/// Implementations: in-memory (`MemoryJobStore`), `PostgreSQL` (external).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job. Fails if the id already exists.
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()>;

    /// Load a job by id.
    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>>;

    /// Apply `patch` only if the job's current status equals `expected`,
    /// as one atomic check-and-set.
    ///
    /// Returns `Ok(false)` when the condition did not hold (lost race); that
    /// is not an error.
    async fn conditional_update_job(
        &self,
        id: &str,
        expected: JobStatus,
        patch: &JobPatch,
    ) -> anyhow::Result<bool>;

    /// Apply `patch` without a status condition.
    async fn update_job(&self, id: &str, patch: &JobPatch) -> anyhow::Result<()>;
}

/// Read access to the transaction log's boost purchases.
#[async_trait]
pub trait PurchaseLedger: Send + Sync {
    /// Most recent purchase whose reference starts with `boost:`
    /// (case-insensitive), ordered by purchase date descending.
    async fn latest_tier_purchase(&self, provider_id: &str)
        -> anyhow::Result<Option<TierPurchase>>;
}

/// Provider presence (online flag and last known coordinates).
///
/// Owned by providers; the dispatch core only reads it.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Load every presence record.
    async fn query_presence(&self) -> anyhow::Result<Vec<PresenceRecord>>;

    /// Insert or replace the record for `record.user_id`.
    ///
    /// The provider's own write path, not used by dispatch.
    async fn upsert_presence(&self, record: PresenceRecord) -> anyhow::Result<()>;
}

/// Providers that hold a service listing, whether or not they report presence.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn list_provider_ids(&self) -> anyhow::Result<Vec<String>>;
}

/// At-least-once broadcast channel with per-user and per-job topics.
///
/// Delivery is fire-and-forget and unordered across subscribers; consumers
/// must tolerate duplicates and late messages.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Broadcast `event` to every current subscriber of `topic` listening for
    /// `event.name()`.
    async fn publish(&self, topic: &Topic, event: &NotificationEvent) -> anyhow::Result<()>;

    /// Listen for `event_name` on `topic`. Dropping the returned
    /// [`Subscription`] unsubscribes.
    async fn subscribe(&self, topic: &Topic, event_name: &'static str)
        -> anyhow::Result<Subscription>;
}

/// The external collaborators one server instance runs against.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub ledger: Arc<dyn PurchaseLedger>,
    pub presence: Arc<dyn PresenceStore>,
    pub directory: Arc<dyn ProviderDirectory>,
    pub channel: Arc<dyn NotificationChannel>,
}
