//! Job dispatch: tier resolution, candidate ranking, the wave protocol, and
//! the provider-side acceptance path.

pub mod acceptance;
pub mod dispatcher;
pub mod error;
pub mod ranker;
pub mod tier_resolver;

pub use acceptance::{AcceptOutcome, AcceptanceHandler, IncomingOffer, OfferView};
pub use dispatcher::{DispatchControl, DispatchOutcome, DispatchProgress, WaveDispatcher};
pub use error::DispatchError;
pub use ranker::{partition_waves, sort_candidates, CandidateRanker};
pub use tier_resolver::TierResolver;
