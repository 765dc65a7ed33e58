//! Provider side of a dispatch: offer inbox and accept/decline.
//!
//! Accepting never touches the job record. It emits one `accept` event on the
//! job's topic and leaves the authoritative `pending -> assigned` write to the
//! dispatching task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use kombo_core::clock::HOUR_MS;
use kombo_core::messages::JOB_WAVE_EVENT;
use kombo_core::{
    AcceptPayload, BoostTier, ClockSource, DispatchConfig, Job, JobWavePayload,
    NotificationEvent, Topic,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::traits::NotificationChannel;

/// How long a sent accept blocks a repeat for the same job.
pub const ACCEPT_LOCK_TTL_MS: u64 = HOUR_MS;
const LOCK_SWEEP_INTERVAL_MS: u64 = 60_000;

/// An offer shown to a provider until it expires or is answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingOffer {
    pub job: Job,
    pub wave: usize,
    pub tier: BoostTier,
    pub received_at: u64,
    pub expires_at: u64,
}

/// An offer plus its countdown, as rendered to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferView {
    #[serde(flatten)]
    pub offer: IncomingOffer,
    /// Whole seconds left, rounded up.
    pub remaining_sec: u64,
}

/// Result of an accept attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The `accept` event was published.
    Submitted,
    /// This provider already accepted this job; nothing was sent.
    AlreadySubmitted,
}

/// Per-provider offer state and the accept idempotency lock.
pub struct AcceptanceHandler {
    channel: Arc<dyn NotificationChannel>,
    clock: Arc<dyn ClockSource>,
    /// `(provider_id, job_id)` pairs whose accept has been sent, mapped to
    /// the time their lock expires.
    submitted: DashMap<(String, String), u64>,
    last_sweep: AtomicU64,
    offers: DashMap<String, IncomingOffer>,
    offline: DashSet<String>,
    inboxes: DashMap<String, CancellationToken>,
}

impl AcceptanceHandler {
    #[must_use]
    pub fn new(channel: Arc<dyn NotificationChannel>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            channel,
            clock,
            submitted: DashMap::new(),
            last_sweep: AtomicU64::new(0),
            offers: DashMap::new(),
            offline: DashSet::new(),
            inboxes: DashMap::new(),
        }
    }

    /// Sends `provider_id`'s acceptance of `job_id`, at most once.
    ///
    /// Clears the matching pending offer. The lock lasts
    /// [`ACCEPT_LOCK_TTL_MS`]; a failed publish releases it so the provider
    /// can retry.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the `accept` event could not be published.
    pub async fn accept_job(
        &self,
        job_id: &str,
        provider_id: &str,
    ) -> anyhow::Result<AcceptOutcome> {
        let now = self.clock.now();
        self.release_expired_locks(now);

        let key = (provider_id.to_string(), job_id.to_string());
        let locked_until = now.saturating_add(ACCEPT_LOCK_TTL_MS);
        match self.submitted.entry(key.clone()) {
            Entry::Occupied(lock) if *lock.get() > now => {
                debug!(job_id, provider_id, "accept already submitted");
                return Ok(AcceptOutcome::AlreadySubmitted);
            }
            Entry::Occupied(mut lock) => {
                lock.insert(locked_until);
            }
            Entry::Vacant(slot) => {
                slot.insert(locked_until);
            }
        }
        self.clear_offer(provider_id, job_id);

        let event = NotificationEvent::Accept(AcceptPayload {
            provider_id: provider_id.to_string(),
        });
        if let Err(e) = self.channel.publish(&Topic::job(job_id), &event).await {
            self.submitted.remove(&key);
            return Err(e);
        }
        info!(job_id, provider_id, "accept submitted");
        Ok(AcceptOutcome::Submitted)
    }

    /// Dismisses the offer for `job_id`. Emits nothing; returns whether an
    /// offer was cleared.
    pub fn decline_job(&self, job_id: &str, provider_id: &str) -> bool {
        let cleared = self.clear_offer(provider_id, job_id);
        debug!(job_id, provider_id, cleared, "offer declined");
        cleared
    }

    /// Stores an incoming wave offer as the provider's pending offer.
    ///
    /// Ignored while the provider is offline or once it has accepted the job.
    pub fn receive_offer(&self, provider_id: &str, payload: JobWavePayload) -> bool {
        if !self.is_online(provider_id) {
            debug!(provider_id, job_id = %payload.job.id, "offline, ignoring offer");
            return false;
        }
        let received_at = self.clock.now();
        if self
            .submitted
            .get(&(provider_id.to_string(), payload.job.id.clone()))
            .is_some_and(|until| *until > received_at)
        {
            return false;
        }

        let offer = IncomingOffer {
            expires_at: received_at.saturating_add(timeout_ms(payload.timeout_sec)),
            received_at,
            wave: payload.wave,
            tier: payload.tier,
            job: payload.job,
        };
        debug!(provider_id, job_id = %offer.job.id, wave = offer.wave, "offer received");
        self.offers.insert(provider_id.to_string(), offer);
        true
    }

    /// The provider's live offer with its countdown; expired offers vanish.
    #[must_use]
    pub fn pending_offer(&self, provider_id: &str) -> Option<OfferView> {
        let now = self.clock.now();
        let offer = self.offers.get(provider_id).map(|o| o.clone())?;
        if now >= offer.expires_at {
            self.offers
                .remove_if(provider_id, |_, o| o.expires_at == offer.expires_at);
            return None;
        }
        let remaining_sec = (offer.expires_at - now).div_ceil(1_000);
        Some(OfferView {
            offer,
            remaining_sec,
        })
    }

    /// Toggles whether the provider accepts new offers. Going offline drops
    /// the pending offer.
    pub fn set_online(&self, provider_id: &str, online: bool) {
        if online {
            self.offline.remove(provider_id);
        } else {
            self.offline.insert(provider_id.to_string());
            self.offers.remove(provider_id);
        }
    }

    #[must_use]
    pub fn is_online(&self, provider_id: &str) -> bool {
        !self.offline.contains(provider_id)
    }

    /// Starts feeding `provider_id`'s `job_wave` topic into its inbox.
    ///
    /// Returns `Ok(false)` if the inbox is already open.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the subscription cannot be opened.
    pub async fn open_inbox(self: &Arc<Self>, provider_id: &str) -> anyhow::Result<bool> {
        let token = CancellationToken::new();
        match self.inboxes.entry(provider_id.to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let mut offers = match self
            .channel
            .subscribe(&Topic::user_notify(provider_id), JOB_WAVE_EVENT)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                self.inboxes.remove(provider_id);
                return Err(e);
            }
        };

        let handler = Arc::clone(self);
        let provider = provider_id.to_string();
        let span = tracing::info_span!("inbox", provider_id = %provider);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        event = offers.recv() => match event {
                            Some(NotificationEvent::JobWave(payload)) => {
                                handler.receive_offer(&provider, payload);
                            }
                            Some(_) => {}
                            None => {
                                warn!("offer subscription closed");
                                break;
                            }
                        },
                    }
                }
                if !token.is_cancelled() {
                    handler.inboxes.remove(&provider);
                }
            }
            .instrument(span),
        );
        Ok(true)
    }

    /// Stops the provider's inbox listener. Returns whether one was open.
    pub fn close_inbox(&self, provider_id: &str) -> bool {
        self.inboxes
            .remove(provider_id)
            .map(|(_, token)| token.cancel())
            .is_some()
    }

    /// Stops every inbox listener.
    pub fn close_all_inboxes(&self) {
        self.inboxes.retain(|_, token| {
            token.cancel();
            false
        });
    }

    #[must_use]
    pub fn open_inbox_count(&self) -> usize {
        self.inboxes.len()
    }

    /// Accept locks still in force, expired ones included until the next
    /// sweep.
    #[must_use]
    pub fn accept_lock_count(&self) -> usize {
        self.submitted.len()
    }

    /// Drops expired accept locks, at most once per sweep interval.
    fn release_expired_locks(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now < last.saturating_add(LOCK_SWEEP_INTERVAL_MS)
            || self
                .last_sweep
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            return;
        }
        self.submitted.retain(|_, until| *until > now);
    }

    fn clear_offer(&self, provider_id: &str, job_id: &str) -> bool {
        self.offers
            .remove_if(provider_id, |_, offer| offer.job.id == job_id)
            .is_some()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn timeout_ms(timeout_sec: f64) -> u64 {
    let secs = if timeout_sec.is_finite() && timeout_sec > 0.0 {
        timeout_sec
    } else {
        DispatchConfig::DEFAULT_WAVE_TIMEOUT_SEC
    };
    (secs.min(DispatchConfig::MAX_TIMING_SEC) * 1_000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kombo_core::messages::ACCEPT_EVENT;
    use kombo_core::{JobRequest, ManualClock, Place};

    use super::*;
    use crate::notify::NotificationHub;

    const NOW: u64 = 1_700_000_000_000;

    fn setup() -> (Arc<AcceptanceHandler>, Arc<NotificationHub>, Arc<ManualClock>) {
        let hub = Arc::new(NotificationHub::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let handler = Arc::new(AcceptanceHandler::new(hub.clone(), clock.clone()));
        (handler, hub, clock)
    }

    fn wave(job_id: &str, timeout_sec: f64) -> JobWavePayload {
        JobWavePayload {
            job: Job::new(
                job_id.to_string(),
                JobRequest {
                    client_id: "c1".to_string(),
                    origin: Place::named("Luanda"),
                    destination: Place::named("Benguela"),
                    radius_km: None,
                },
                5.0,
                NOW,
            ),
            timeout_sec,
            wave: 0,
            tier: BoostTier::Elite,
        }
    }

    #[tokio::test]
    async fn accept_is_sent_once() {
        let (handler, hub, _) = setup();
        let mut job_topic = hub.subscribe(&Topic::job("j1"), ACCEPT_EVENT).await.unwrap();

        assert_eq!(
            handler.accept_job("j1", "p1").await.unwrap(),
            AcceptOutcome::Submitted
        );
        assert_eq!(
            handler.accept_job("j1", "p1").await.unwrap(),
            AcceptOutcome::AlreadySubmitted
        );

        assert_eq!(
            job_topic.recv().await,
            Some(NotificationEvent::Accept(AcceptPayload {
                provider_id: "p1".to_string()
            }))
        );
        let pending = tokio::time::timeout(Duration::from_millis(20), job_topic.recv()).await;
        assert!(pending.is_err(), "second accept must not be published");
    }

    #[tokio::test]
    async fn different_providers_accept_independently() {
        let (handler, _hub, _) = setup();
        assert_eq!(
            handler.accept_job("j1", "p1").await.unwrap(),
            AcceptOutcome::Submitted
        );
        assert_eq!(
            handler.accept_job("j1", "p2").await.unwrap(),
            AcceptOutcome::Submitted
        );
        assert_eq!(
            handler.accept_job("j2", "p1").await.unwrap(),
            AcceptOutcome::Submitted
        );
    }

    #[test]
    fn countdown_rounds_up_and_expires() {
        let (handler, _hub, clock) = setup();
        assert!(handler.receive_offer("p1", wave("j1", 10.0)));

        assert_eq!(handler.pending_offer("p1").unwrap().remaining_sec, 10);
        clock.advance(1_500);
        assert_eq!(handler.pending_offer("p1").unwrap().remaining_sec, 9);
        clock.advance(8_499);
        assert_eq!(handler.pending_offer("p1").unwrap().remaining_sec, 1);
        clock.advance(1);
        assert!(handler.pending_offer("p1").is_none());
    }

    #[test]
    fn offline_provider_ignores_offers() {
        let (handler, _hub, _) = setup();
        handler.set_online("p1", false);
        assert!(!handler.receive_offer("p1", wave("j1", 10.0)));
        assert!(handler.pending_offer("p1").is_none());

        handler.set_online("p1", true);
        assert!(handler.receive_offer("p1", wave("j1", 10.0)));
        handler.set_online("p1", false);
        assert!(handler.pending_offer("p1").is_none());
    }

    #[test]
    fn decline_clears_only_matching_offer() {
        let (handler, _hub, _) = setup();
        handler.receive_offer("p1", wave("j1", 10.0));
        assert!(!handler.decline_job("other", "p1"));
        assert!(handler.pending_offer("p1").is_some());
        assert!(handler.decline_job("j1", "p1"));
        assert!(handler.pending_offer("p1").is_none());
    }

    #[tokio::test]
    async fn accept_clears_offer_and_blocks_redelivery() {
        let (handler, _hub, _) = setup();
        handler.receive_offer("p1", wave("j1", 10.0));
        handler.accept_job("j1", "p1").await.unwrap();
        assert!(handler.pending_offer("p1").is_none());
        assert!(!handler.receive_offer("p1", wave("j1", 10.0)));
    }

    #[test]
    fn invalid_timeout_uses_default() {
        let (handler, _hub, _) = setup();
        handler.receive_offer("p1", wave("j1", f64::NAN));
        assert_eq!(handler.pending_offer("p1").unwrap().remaining_sec, 10);
    }

    #[test]
    fn huge_timeout_is_clamped() {
        let (handler, _hub, _) = setup();
        handler.receive_offer("p1", wave("j1", 1e20));
        assert_eq!(handler.pending_offer("p1").unwrap().remaining_sec, 3_600);
    }

    #[tokio::test]
    async fn accept_locks_expire_and_are_swept() {
        let (handler, _hub, clock) = setup();
        for job_id in ["j1", "j2", "j3"] {
            handler.accept_job(job_id, "p1").await.unwrap();
        }
        assert_eq!(handler.accept_lock_count(), 3);

        clock.advance(ACCEPT_LOCK_TTL_MS - 1);
        assert_eq!(
            handler.accept_job("j1", "p1").await.unwrap(),
            AcceptOutcome::AlreadySubmitted
        );
        assert!(!handler.receive_offer("p1", wave("j1", 10.0)));

        clock.advance(LOCK_SWEEP_INTERVAL_MS);
        assert!(handler.receive_offer("p1", wave("j1", 10.0)));
        assert_eq!(
            handler.accept_job("j2", "p2").await.unwrap(),
            AcceptOutcome::Submitted
        );
        // Only the fresh lock survives the sweep.
        assert_eq!(handler.accept_lock_count(), 1);
        assert_eq!(
            handler.accept_job("j1", "p1").await.unwrap(),
            AcceptOutcome::Submitted
        );
        assert_eq!(handler.accept_lock_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inbox_feeds_offers_from_the_channel() {
        let (handler, hub, _) = setup();
        assert!(handler.open_inbox("p1").await.unwrap());
        assert!(!handler.open_inbox("p1").await.unwrap());
        assert_eq!(hub.subscriber_count(&Topic::user_notify("p1")), 1);

        hub.publish(
            &Topic::user_notify("p1"),
            &NotificationEvent::JobWave(wave("j1", 10.0)),
        )
        .await
        .unwrap();

        let mut view = None;
        for _ in 0..50 {
            view = handler.pending_offer("p1");
            if view.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(view.unwrap().offer.job.id, "j1");

        assert!(handler.close_inbox("p1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.subscriber_count(&Topic::user_notify("p1")), 0);
        assert_eq!(handler.open_inbox_count(), 0);
    }
}
