//! `Kombo` Core: job model, boost tiers, geometry, dispatch config, and wire events.

pub mod clock;
pub mod config;
pub mod geo;
pub mod messages;
pub mod tier;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use config::DispatchConfig;
pub use geo::{haversine_km, Coordinates};
pub use messages::{AcceptPayload, JobWavePayload, NotificationEvent, Topic};
pub use tier::{BoostTier, ParseTierError, TierPurchase};
pub use types::{
    Job, JobPatch, JobRequest, JobStatus, Place, PresenceRecord, ProviderCandidate,
    TransitionError,
};
