//! Job record, presence records, and ranked candidates.

use serde::{Deserialize, Serialize};

use crate::geo::Coordinates;
use crate::tier::BoostTier;

// ---------------------------------------------------------------------------
// JobStatus / transitions
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// Only `Pending -> Assigned` and `Pending -> NoService` exist. Both targets
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    NoService,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::NoService => "no_service",
        }
    }
}

/// Rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job {job_id} is already {current:?}; only pending jobs can transition")]
    NotPending { job_id: String, current: JobStatus },
}

/// A state transition applied to a pending job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPatch {
    /// `pending -> assigned`.
    Assign { provider_id: String, assigned_at: u64 },
    /// `pending -> no_service`.
    NoService { finished_at: u64 },
}

impl JobPatch {
    /// Status the job ends up in after the patch.
    #[must_use]
    pub fn target_status(&self) -> JobStatus {
        match self {
            Self::Assign { .. } => JobStatus::Assigned,
            Self::NoService { .. } => JobStatus::NoService,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A named place, optionally geocoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coordinates: Option<Coordinates>,
}

impl Place {
    #[must_use]
    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            coordinates: None,
        }
    }

    #[must_use]
    pub fn at(label: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            label: label.into(),
            coordinates: Some(coordinates),
        }
    }
}

/// Client request that creates a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub client_id: String,
    pub origin: Place,
    pub destination: Place,
    /// Requested search radius; the configured default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub radius_km: Option<f64>,
}

/// Persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub origin: Place,
    pub destination: Place,
    pub search_radius_km: f64,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub assigned_provider_id: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub assigned_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<u64>,
}

impl Job {
    /// Creates a pending job from a client request.
    #[must_use]
    pub fn new(id: String, request: JobRequest, search_radius_km: f64, created_at: u64) -> Self {
        Self {
            id,
            client_id: request.client_id,
            origin: request.origin,
            destination: request.destination,
            search_radius_km,
            status: JobStatus::Pending,
            assigned_provider_id: None,
            created_at,
            assigned_at: None,
            finished_at: None,
        }
    }

    /// Applies a transition in place.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::NotPending`] if the job already left
    /// `pending`; the job is left untouched.
    pub fn apply(&mut self, patch: &JobPatch) -> Result<(), TransitionError> {
        if self.status != JobStatus::Pending {
            return Err(TransitionError::NotPending {
                job_id: self.id.clone(),
                current: self.status,
            });
        }
        match patch {
            JobPatch::Assign {
                provider_id,
                assigned_at,
            } => {
                self.status = JobStatus::Assigned;
                self.assigned_provider_id = Some(provider_id.clone());
                self.assigned_at = Some(*assigned_at);
            }
            JobPatch::NoService { finished_at } => {
                self.status = JobStatus::NoService;
                self.finished_at = Some(*finished_at);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Presence and candidates
// ---------------------------------------------------------------------------

/// Provider presence as written by the provider's client.
///
/// Every field besides `user_id` may be missing in the external store.
/// `online == None` means the provider never toggled explicitly and counts as
/// eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub updated_at: u64,
}

impl PresenceRecord {
    /// Only an explicit `online = false` excludes a provider.
    #[must_use]
    pub fn is_explicitly_offline(&self) -> bool {
        self.online == Some(false)
    }

    /// Last known position, if both components are present and valid.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)).filter(Coordinates::is_valid),
            _ => None,
        }
    }
}

/// Ranked provider for a single dispatch. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCandidate {
    pub user_id: String,
    pub tier: BoostTier,
    pub distance_km: f64,
}
