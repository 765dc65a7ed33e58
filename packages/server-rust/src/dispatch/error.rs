//! Failures that abort a dispatch.
//!
//! Tier lookups, presence reads and individual notification sends never
//! surface here: they degrade (tier `none`, distance 0, provider skipped).
//! Only failures that leave the job record in doubt abort the dispatch.

/// A dispatch that could not run to completion.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The job row could not be created, so nothing was dispatched.
    #[error("failed to insert job {job_id}")]
    InsertJob {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The accept listener could not be opened; no offers were sent.
    #[error("failed to listen for accepts on job {job_id}")]
    Subscribe {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// All waves ran out but `no_service` could not be written.
    ///
    /// The job is left `pending` and needs operator attention.
    #[error("failed to mark job {job_id} as no_service")]
    TerminalWrite {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Job the failure belongs to.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::InsertJob { job_id, .. }
            | Self::Subscribe { job_id, .. }
            | Self::TerminalWrite { job_id, .. } => job_id,
        }
    }
}
