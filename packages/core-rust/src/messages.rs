//! Notification topics and the events carried on them.
//!
//! Two kinds of topics exist:
//!
//! - `user_notify_<providerId>`: a provider's inbox, carrying `job_wave` offers
//! - `job_<jobId>`: a job's inbox, carrying `accept` responses
//!
//! Events cross the channel as `MsgPack` frames produced by
//! `rmp_serde::to_vec_named()`, so field names survive on the wire and a
//! malformed frame is rejected at decode time instead of deep in the
//! dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tier::BoostTier;
use crate::types::Job;

/// Event name for wave offers sent to providers.
pub const JOB_WAVE_EVENT: &str = "job_wave";
/// Event name for provider acceptances sent to a job.
pub const ACCEPT_EVENT: &str = "accept";

const USER_NOTIFY_PREFIX: &str = "user_notify_";
const JOB_PREFIX: &str = "job_";

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A broadcast topic on the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-provider inbox.
    UserNotify(String),
    /// Per-job inbox.
    Job(String),
}

impl Topic {
    #[must_use]
    pub fn user_notify(provider_id: &str) -> Self {
        Self::UserNotify(provider_id.to_string())
    }

    #[must_use]
    pub fn job(job_id: &str) -> Self {
        Self::Job(job_id.to_string())
    }

    /// Parses a wire topic name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(id) = name.strip_prefix(USER_NOTIFY_PREFIX) {
            (!id.is_empty()).then(|| Self::UserNotify(id.to_string()))
        } else if let Some(id) = name.strip_prefix(JOB_PREFIX) {
            (!id.is_empty()).then(|| Self::Job(id.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserNotify(id) => write!(f, "{USER_NOTIFY_PREFIX}{id}"),
            Self::Job(id) => write!(f, "{JOB_PREFIX}{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Offer broadcast to every candidate of a wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobWavePayload {
    pub job: Job,
    /// How long the offer stays open, in seconds.
    pub timeout_sec: f64,
    /// Zero-based wave index.
    pub wave: usize,
    pub tier: BoostTier,
}

/// A provider's acceptance of an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptPayload {
    pub provider_id: String,
}

// ---------------------------------------------------------------------------
// NotificationEvent
// ---------------------------------------------------------------------------

/// Any event published on the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum NotificationEvent {
    JobWave(JobWavePayload),
    Accept(AcceptPayload),
}

impl NotificationEvent {
    /// Wire event name (`job_wave` or `accept`).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobWave(_) => JOB_WAVE_EVENT,
            Self::Accept(_) => ACCEPT_EVENT,
        }
    }

    /// Encodes the event as a named-field `MsgPack` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes a `MsgPack` frame.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed frames or unknown events.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobRequest, Place};

    #[test]
    fn topic_names() {
        assert_eq!(Topic::user_notify("p1").to_string(), "user_notify_p1");
        assert_eq!(Topic::job("42").to_string(), "job_42");
        assert_eq!(Topic::parse("user_notify_p1"), Some(Topic::user_notify("p1")));
        assert_eq!(Topic::parse("job_42"), Some(Topic::job("42")));
        assert_eq!(Topic::parse("job_"), None);
        assert_eq!(Topic::parse("chat_1"), None);
    }

    #[test]
    fn wave_event_survives_the_wire() {
        let job = Job::new(
            "42".to_string(),
            JobRequest {
                client_id: "c1".to_string(),
                origin: Place::named("Luanda"),
                destination: Place::named("Benguela"),
                radius_km: Some(5.0),
            },
            5.0,
            1_700_000_000_000,
        );
        let event = NotificationEvent::JobWave(JobWavePayload {
            job,
            timeout_sec: 10.0,
            wave: 0,
            tier: BoostTier::Elite,
        });
        assert_eq!(event.name(), "job_wave");

        let bytes = event.encode().unwrap();
        assert_eq!(NotificationEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn malformed_frame_is_rejected() {
        assert!(NotificationEvent::decode(&[0xc1, 0x00]).is_err());

        let wrong_shape = rmp_serde::to_vec_named(&AcceptPayload {
            provider_id: "p1".to_string(),
        })
        .unwrap();
        assert!(NotificationEvent::decode(&wrong_shape).is_err());
    }
}
