//! End-to-end dispatch scenarios over the in-memory backends, with tokio's
//! clock paused so wave timing is exact.

use std::sync::Arc;
use std::time::Duration;

use kombo_core::clock::HOUR_MS;
use kombo_core::messages::{ACCEPT_EVENT, JOB_WAVE_EVENT};
use kombo_core::{
    AcceptPayload, Coordinates, DispatchConfig, JobRequest, JobStatus, JobWavePayload, ManualClock,
    NotificationEvent, Place, PresenceRecord, TierPurchase, Topic,
};
use kombo_server::dispatch::{AcceptOutcome, DispatchOutcome, DispatchProgress};
use kombo_server::network::{AppState, ShutdownController};
use kombo_server::notify::Subscription;
use kombo_server::storage::InMemoryBackends;
use kombo_server::{JobStore, NotificationChannel, PresenceStore};

const NOW: u64 = 1_700_000_000_000;
const LUANDA: Coordinates = Coordinates {
    lat: -8.8390,
    lng: 13.2894,
};

struct Harness {
    backends: InMemoryBackends,
    state: AppState,
}

impl Harness {
    fn new(config: DispatchConfig) -> Self {
        let backends = InMemoryBackends::new();
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let state = AppState::new(
            backends.backends(),
            Arc::new(ManualClock::new(NOW)),
            config,
            shutdown,
        );
        Self { backends, state }
    }

    /// Lists a provider with an optional boost bought `age_ms` ago.
    fn provider(&self, id: &str, boost: Option<(&str, u64)>) {
        self.backends.directory.list(id);
        if let Some((tier, age_ms)) = boost {
            self.backends.ledger.record_purchase(TierPurchase {
                provider_id: id.to_string(),
                reference: format!("boost:{tier}:2023-11-14"),
                purchased_at: NOW - age_ms,
            });
        }
    }

    async fn place(&self, id: &str, coordinates: Coordinates) {
        self.backends
            .presence
            .upsert_presence(PresenceRecord {
                user_id: id.to_string(),
                online: Some(true),
                lat: Some(coordinates.lat),
                lng: Some(coordinates.lng),
                updated_at: NOW,
            })
            .await
            .unwrap();
    }

    async fn offers_for(&self, id: &str) -> Subscription {
        self.backends
            .hub
            .subscribe(&Topic::user_notify(id), JOB_WAVE_EVENT)
            .await
            .unwrap()
    }
}

fn request(origin: Place) -> JobRequest {
    JobRequest {
        client_id: "client-1".to_string(),
        origin,
        destination: Place::named("Benguela"),
        radius_km: None,
    }
}

async fn next_offer(sub: &mut Subscription) -> JobWavePayload {
    match sub.recv().await {
        Some(NotificationEvent::JobWave(payload)) => payload,
        other => panic!("expected a job wave, got {other:?}"),
    }
}

/// Roughly `km` north of Luanda.
fn north_of_luanda(km: f64) -> Coordinates {
    Coordinates::new(LUANDA.lat + km / 111.2, LUANDA.lng)
}

#[tokio::test(start_paused = true)]
async fn waves_follow_tier_order() {
    let h = Harness::new(DispatchConfig::default());
    h.provider("lite", Some(("lite", HOUR_MS)));
    h.provider("elite", Some(("elite", HOUR_MS)));
    h.provider("plain", None);
    h.provider("pro", Some(("pro", HOUR_MS)));

    let mut subs = Vec::new();
    for id in ["lite", "elite", "plain", "pro"] {
        subs.push((id, h.offers_for(id).await));
    }

    let handle = h.state.jobs.submit(request(Place::named("Luanda"))).await.unwrap();
    assert_eq!(handle.outcome().await.unwrap(), DispatchOutcome::NoService);

    let mut waves = Vec::new();
    for (id, sub) in &mut subs {
        waves.push((next_offer(sub).await.wave, *id));
    }
    waves.sort_unstable();
    assert_eq!(
        waves,
        vec![(0, "elite"), (2, "pro"), (3, "lite"), (5, "plain")]
    );
}

#[tokio::test(start_paused = true)]
async fn no_accept_ends_in_no_service_after_all_waves() {
    let h = Harness::new(DispatchConfig {
        max_waves: 2,
        ..DispatchConfig::default()
    });
    h.provider("p1", None);

    let started = tokio::time::Instant::now();
    let handle = h.state.jobs.submit(request(Place::named("Luanda"))).await.unwrap();
    let id = handle.id().to_string();
    assert_eq!(handle.outcome().await.unwrap(), DispatchOutcome::NoService);

    // Two waves of 10 s, each followed by a 3 s pause.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(26), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(27), "elapsed {elapsed:?}");

    let job = h.state.jobs.job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::NoService);
    assert!(job.finished_at.is_some());
    assert!(job.assigned_provider_id.is_none());
    assert_eq!(
        h.state.jobs.progress(&id).await.unwrap(),
        DispatchProgress::NoService
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_accepts_assign_exactly_one_provider() {
    let h = Harness::new(DispatchConfig::default());
    let ids: Vec<String> = (0..8).map(|i| format!("p{i}")).collect();
    let mut subs = Vec::new();
    for id in &ids {
        h.provider(id, Some(("elite", HOUR_MS)));
        subs.push(h.offers_for(id).await);
    }

    let handle = h.state.jobs.submit(request(Place::named("Luanda"))).await.unwrap();
    let job_id = handle.id().to_string();
    for sub in &mut subs {
        assert_eq!(next_offer(sub).await.wave, 0);
    }

    let mut accepts = Vec::new();
    for id in &ids {
        let acceptance = Arc::clone(&h.state.acceptance);
        let (job_id, id) = (job_id.clone(), id.clone());
        accepts.push(tokio::spawn(async move {
            acceptance.accept_job(&job_id, &id).await
        }));
    }
    for accept in accepts {
        assert_eq!(accept.await.unwrap().unwrap(), AcceptOutcome::Submitted);
    }

    let DispatchOutcome::Assigned { provider_id } = handle.outcome().await.unwrap() else {
        panic!("expected an assignment");
    };
    assert!(ids.contains(&provider_id));

    let job = h.backends.jobs.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert_eq!(job.assigned_provider_id.as_deref(), Some(provider_id.as_str()));
    assert!(job.assigned_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn expired_boost_is_dispatched_last() {
    let h = Harness::new(DispatchConfig::default());
    h.provider("stale-pro", Some(("pro", 169 * HOUR_MS)));
    h.provider("fresh-start", Some(("start", HOUR_MS)));
    let mut stale = h.offers_for("stale-pro").await;
    let mut fresh = h.offers_for("fresh-start").await;

    let handle = h.state.jobs.submit(request(Place::named("Luanda"))).await.unwrap();
    assert_eq!(handle.outcome().await.unwrap(), DispatchOutcome::NoService);

    assert_eq!(next_offer(&mut fresh).await.wave, 4);
    let offer = next_offer(&mut stale).await;
    assert_eq!(offer.wave, 5);
    assert_eq!(offer.tier, kombo_core::BoostTier::None);
}

#[tokio::test(start_paused = true)]
async fn providers_without_location_or_beyond_radius_are_still_offered() {
    let h = Harness::new(DispatchConfig::default());
    h.provider("nowhere", None);
    h.provider("far", None);
    h.place("far", north_of_luanda(120.0)).await;
    let mut nowhere = h.offers_for("nowhere").await;
    let mut far = h.offers_for("far").await;

    let handle = h
        .state
        .jobs
        .submit(request(Place::at("Luanda", LUANDA)))
        .await
        .unwrap();
    assert_eq!(handle.outcome().await.unwrap(), DispatchOutcome::NoService);

    assert_eq!(next_offer(&mut nowhere).await.wave, 5);
    assert_eq!(next_offer(&mut far).await.wave, 5);
}

#[tokio::test(start_paused = true)]
async fn offline_provider_is_never_offered() {
    let h = Harness::new(DispatchConfig::default());
    h.provider("off", None);
    h.backends
        .presence
        .upsert_presence(PresenceRecord {
            user_id: "off".to_string(),
            online: Some(false),
            lat: None,
            lng: None,
            updated_at: NOW,
        })
        .await
        .unwrap();
    let mut off = h.offers_for("off").await;

    let handle = h.state.jobs.submit(request(Place::named("Luanda"))).await.unwrap();
    assert_eq!(handle.outcome().await.unwrap(), DispatchOutcome::NoService);

    assert!(tokio::time::timeout(Duration::from_secs(1), off.recv())
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn repeated_accept_sends_a_single_event() {
    let h = Harness::new(DispatchConfig::default());
    let mut accepts = h
        .backends
        .hub
        .subscribe(&Topic::job("job-1"), ACCEPT_EVENT)
        .await
        .unwrap();

    let acceptance = &h.state.acceptance;
    assert_eq!(
        acceptance.accept_job("job-1", "p1").await.unwrap(),
        AcceptOutcome::Submitted
    );
    assert_eq!(
        acceptance.accept_job("job-1", "p1").await.unwrap(),
        AcceptOutcome::AlreadySubmitted
    );

    assert_eq!(
        accepts.recv().await,
        Some(NotificationEvent::Accept(AcceptPayload {
            provider_id: "p1".to_string()
        }))
    );
    assert!(tokio::time::timeout(Duration::from_secs(1), accepts.recv())
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn accept_before_invitation_is_ignored() {
    // A elite at 2 km, B pro at 1 km, C elite at 10 km.
    let h = Harness::new(DispatchConfig::default());
    for (id, tier, km) in [("A", "elite", 2.0), ("B", "pro", 1.0), ("C", "elite", 10.0)] {
        h.provider(id, Some((tier, HOUR_MS)));
        h.place(id, north_of_luanda(km)).await;
    }
    let mut a = h.offers_for("A").await;
    let mut b = h.offers_for("B").await;
    let mut c = h.offers_for("C").await;

    let mut job_request = request(Place::at("Luanda", LUANDA));
    job_request.radius_km = Some(5.0);
    let handle = h.state.jobs.submit(job_request).await.unwrap();
    let job_id = handle.id().to_string();

    assert_eq!(next_offer(&mut a).await.wave, 0);
    assert_eq!(next_offer(&mut c).await.wave, 0);

    // B has not been invited yet; its accept must not win the job.
    h.backends
        .hub
        .publish(
            &Topic::job(&job_id),
            &NotificationEvent::Accept(AcceptPayload {
                provider_id: "B".to_string(),
            }),
        )
        .await
        .unwrap();

    let offer = next_offer(&mut b).await;
    assert_eq!(offer.wave, 2);
    assert_eq!(offer.tier, kombo_core::BoostTier::Pro);
    assert_eq!(
        h.backends.jobs.get_job(&job_id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    h.state.acceptance.accept_job(&job_id, "B").await.unwrap();
    assert_eq!(
        handle.outcome().await.unwrap(),
        DispatchOutcome::Assigned {
            provider_id: "B".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn inbox_surfaces_offer_until_accepted() {
    let h = Harness::new(DispatchConfig::default());
    h.provider("p1", Some(("max", HOUR_MS)));
    h.state.acceptance.set_online("p1", true);
    assert!(h.state.acceptance.open_inbox("p1").await.unwrap());

    let handle = h.state.jobs.submit(request(Place::named("Luanda"))).await.unwrap();
    let job_id = handle.id().to_string();

    let view = loop {
        if let Some(view) = h.state.acceptance.pending_offer("p1") {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert_eq!(view.offer.job.id, job_id);
    assert_eq!(view.offer.wave, 1);
    assert_eq!(view.remaining_sec, 10);

    h.state.acceptance.accept_job(&job_id, "p1").await.unwrap();
    assert!(h.state.acceptance.pending_offer("p1").is_none());
    assert_eq!(
        handle.outcome().await.unwrap(),
        DispatchOutcome::Assigned {
            provider_id: "p1".to_string()
        }
    );
    h.state.acceptance.close_all_inboxes();
}
