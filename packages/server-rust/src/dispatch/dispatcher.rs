//! Wave-based dispatch of one job.
//!
//! A dispatch walks the tiers in priority order. Each wave publishes a
//! `job_wave` offer to every candidate of one tier, then races the job's
//! `accept` listener against the wave timeout and the cancellation token.
//! The first accept that wins the store's conditional `pending -> assigned`
//! update ends the dispatch; every other accept is a lost race and is
//! ignored. When all waves time out the job is written as `no_service`.
//!
//! ```text
//! created -> waving(0) -> waving(1) -> ... -> waving(n-1) -> no_service
//!               |            |                    |
//!               +------------+--------------------+--> assigned
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use kombo_core::messages::ACCEPT_EVENT;
use kombo_core::{
    BoostTier, ClockSource, DispatchConfig, Job, JobPatch, JobStatus, JobWavePayload,
    NotificationEvent, ProviderCandidate, Topic,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::DispatchError;
use super::ranker::partition_waves;
use crate::notify::Subscription;
use crate::traits::{JobStore, NotificationChannel};

// ---------------------------------------------------------------------------
// Progress and outcome
// ---------------------------------------------------------------------------

/// Live state of a dispatch, published on a `watch` channel for the client's
/// countdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchProgress {
    Pending,
    #[serde(rename_all = "camelCase")]
    Waving {
        wave: usize,
        tier: BoostTier,
        notified: usize,
        /// Wall-clock end of the wave, millis since epoch.
        deadline_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Assigned { provider_id: String },
    NoService,
    Cancelled,
    Failed { reason: String },
}

impl DispatchProgress {
    /// Whether no further updates will follow.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending | Self::Waving { .. })
    }

    /// Progress implied by a stored job when no dispatch is running.
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        match job.status {
            JobStatus::Pending => Self::Pending,
            JobStatus::Assigned => Self::Assigned {
                provider_id: job.assigned_provider_id.clone().unwrap_or_default(),
            },
            JobStatus::NoService => Self::NoService,
        }
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// This dispatch won the conditional update for `provider_id`.
    Assigned { provider_id: String },
    /// Every wave timed out; the job is now `no_service`.
    NoService,
    /// Cancelled before a winner; the job stays `pending`.
    Cancelled,
    /// The job left `pending` through another writer.
    Superseded(Job),
}

impl DispatchOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned { .. } => "assigned",
            Self::NoService => "no_service",
            Self::Cancelled => "cancelled",
            Self::Superseded(_) => "superseded",
        }
    }

    fn progress(&self) -> DispatchProgress {
        match self {
            Self::Assigned { provider_id } => DispatchProgress::Assigned {
                provider_id: provider_id.clone(),
            },
            Self::NoService => DispatchProgress::NoService,
            Self::Cancelled => DispatchProgress::Cancelled,
            Self::Superseded(job) => DispatchProgress::from_job(job),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchControl
// ---------------------------------------------------------------------------

/// Task-scoped handles for one dispatch: its cancellation token and the
/// sending half of its progress stream.
#[derive(Debug)]
pub struct DispatchControl {
    cancel: CancellationToken,
    progress: watch::Sender<DispatchProgress>,
}

impl DispatchControl {
    /// Creates a control block starting in [`DispatchProgress::Pending`].
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<DispatchProgress>) {
        let (progress, rx) = watch::channel(DispatchProgress::Pending);
        (
            Self {
                cancel: CancellationToken::new(),
                progress,
            },
            rx,
        )
    }

    /// Token that cancels this dispatch when triggered.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Publishes a progress update. Works with no receivers attached.
    pub fn report(&self, progress: DispatchProgress) {
        self.progress.send_replace(progress);
    }
}

// ---------------------------------------------------------------------------
// WaveDispatcher
// ---------------------------------------------------------------------------

enum WaveResult {
    Assigned(String),
    Superseded(Job),
    TimedOut,
    Cancelled,
}

enum Claim {
    Won,
    Lost,
    Failed,
}

/// Runs the wave protocol for one job at a time; shareable across tasks.
pub struct WaveDispatcher {
    jobs: Arc<dyn JobStore>,
    channel: Arc<dyn NotificationChannel>,
    clock: Arc<dyn ClockSource>,
}

impl WaveDispatcher {
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        channel: Arc<dyn NotificationChannel>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            jobs,
            channel,
            clock,
        }
    }

    /// Dispatches `job` to `candidates` (already ranked) in tier waves.
    ///
    /// The accept listener is opened before the first offer goes out and is
    /// released on every return path.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Subscribe`] if the accept listener cannot be opened,
    /// [`DispatchError::TerminalWrite`] if `no_service` cannot be written.
    pub async fn dispatch(
        &self,
        job: &Job,
        candidates: &[ProviderCandidate],
        config: &DispatchConfig,
        control: &DispatchControl,
    ) -> Result<DispatchOutcome, DispatchError> {
        let config = config.sanitized();
        let mut accepts = self
            .channel
            .subscribe(&Topic::job(&job.id), ACCEPT_EVENT)
            .await
            .map_err(|source| DispatchError::Subscribe {
                job_id: job.id.clone(),
                source,
            })?;

        let outcome = self.run_waves(job, candidates, &config, control, &mut accepts).await;
        accepts.unsubscribe();

        match &outcome {
            Ok(outcome) => {
                info!(job_id = %job.id, outcome = outcome.as_str(), "dispatch finished");
                metrics::counter!("kombo_dispatch_outcomes_total", "outcome" => outcome.as_str())
                    .increment(1);
                control.report(outcome.progress());
            }
            Err(e) => {
                metrics::counter!("kombo_dispatch_outcomes_total", "outcome" => "failed")
                    .increment(1);
                control.report(DispatchProgress::Failed {
                    reason: e.to_string(),
                });
            }
        }
        outcome
    }

    async fn run_waves(
        &self,
        job: &Job,
        candidates: &[ProviderCandidate],
        config: &DispatchConfig,
        control: &DispatchControl,
        accepts: &mut Subscription,
    ) -> Result<DispatchOutcome, DispatchError> {
        let waves = partition_waves(candidates, config.wave_count());
        let mut invited: HashSet<String> = HashSet::new();

        for (wave, group) in waves.iter().enumerate() {
            let tier = BoostTier::from_rank(wave).unwrap_or(BoostTier::None);
            if control.cancel.is_cancelled() {
                return Ok(DispatchOutcome::Cancelled);
            }
            if group.is_empty() && config.skip_empty_waves {
                debug!(job_id = %job.id, wave, %tier, "skipping empty wave");
                continue;
            }

            invited.extend(group.iter().cloned());
            let notified = self.publish_wave(job, wave, tier, group, config).await;
            let deadline = deadline_after(config.wave_timeout());
            control.report(DispatchProgress::Waving {
                wave,
                tier,
                notified,
                deadline_ms: self
                    .clock
                    .now()
                    .saturating_add(duration_ms(config.wave_timeout())),
            });
            metrics::counter!("kombo_dispatch_waves_total", "tier" => tier.as_str()).increment(1);
            info!(job_id = %job.id, wave, %tier, candidates = group.len(), notified, "wave opened");

            match self.listen(job, &invited, accepts, deadline, &control.cancel).await {
                WaveResult::Assigned(provider_id) => {
                    return Ok(DispatchOutcome::Assigned { provider_id });
                }
                WaveResult::Superseded(current) => return Ok(DispatchOutcome::Superseded(current)),
                WaveResult::Cancelled => return Ok(DispatchOutcome::Cancelled),
                WaveResult::TimedOut => {}
            }
            info!(job_id = %job.id, wave, %tier, "wave timed out");

            // Invited providers may still accept during the pause.
            let resume = deadline_after(config.wait_between_waves());
            match self.listen(job, &invited, accepts, resume, &control.cancel).await {
                WaveResult::Assigned(provider_id) => {
                    return Ok(DispatchOutcome::Assigned { provider_id });
                }
                WaveResult::Superseded(current) => return Ok(DispatchOutcome::Superseded(current)),
                WaveResult::Cancelled => return Ok(DispatchOutcome::Cancelled),
                WaveResult::TimedOut => {}
            }
        }

        if control.cancel.is_cancelled() {
            return Ok(DispatchOutcome::Cancelled);
        }
        let patch = JobPatch::NoService {
            finished_at: self.clock.now(),
        };
        if let Err(source) = self.jobs.update_job(&job.id, &patch).await {
            // Settled by another writer during the last pause.
            if let Some(current) = self.settled_job(job).await {
                return Ok(DispatchOutcome::Superseded(current));
            }
            return Err(DispatchError::TerminalWrite {
                job_id: job.id.clone(),
                source,
            });
        }
        Ok(DispatchOutcome::NoService)
    }

    /// Sends the wave's offer to each provider; returns how many sends
    /// succeeded. Individual failures are logged and skipped.
    async fn publish_wave(
        &self,
        job: &Job,
        wave: usize,
        tier: BoostTier,
        group: &[String],
        config: &DispatchConfig,
    ) -> usize {
        let event = NotificationEvent::JobWave(JobWavePayload {
            job: job.clone(),
            timeout_sec: config.wave_timeout_sec,
            wave,
            tier,
        });

        let mut notified = 0;
        for provider_id in group {
            match self
                .channel
                .publish(&Topic::user_notify(provider_id), &event)
                .await
            {
                Ok(()) => {
                    notified += 1;
                    metrics::counter!("kombo_dispatch_notifications_total").increment(1);
                    debug!(job_id = %job.id, provider_id = %provider_id, wave, "offer sent");
                }
                Err(e) => {
                    metrics::counter!("kombo_dispatch_publish_failures_total").increment(1);
                    warn!(job_id = %job.id, provider_id = %provider_id, wave, error = %e, "offer not delivered");
                }
            }
        }
        notified
    }

    /// Waits for a winning accept until `until`, or until cancelled.
    async fn listen(
        &self,
        job: &Job,
        invited: &HashSet<String>,
        accepts: &mut Subscription,
        until: Instant,
        cancel: &CancellationToken,
    ) -> WaveResult {
        let timer = sleep_until(until);
        tokio::pin!(timer);
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return WaveResult::Cancelled,
                event = accepts.recv(), if open => {
                    let provider_id = match event {
                        Some(NotificationEvent::Accept(accept)) => accept.provider_id,
                        Some(other) => {
                            debug!(job_id = %job.id, event = other.name(), "ignoring unexpected event");
                            continue;
                        }
                        None => {
                            warn!(job_id = %job.id, "accept listener closed, waiting out the wave");
                            open = false;
                            continue;
                        }
                    };
                    if !invited.contains(&provider_id) {
                        debug!(job_id = %job.id, provider_id = %provider_id, "ignoring accept from provider not yet invited");
                        continue;
                    }
                    match self.claim(job, &provider_id).await {
                        Claim::Won => return WaveResult::Assigned(provider_id),
                        Claim::Lost => {
                            if let Some(current) = self.settled_job(job).await {
                                return WaveResult::Superseded(current);
                            }
                        }
                        Claim::Failed => {}
                    }
                }
                () = &mut timer => return WaveResult::TimedOut,
            }
        }
    }

    /// Attempts the conditional `pending -> assigned` write.
    async fn claim(&self, job: &Job, provider_id: &str) -> Claim {
        let patch = JobPatch::Assign {
            provider_id: provider_id.to_string(),
            assigned_at: self.clock.now(),
        };
        match self
            .jobs
            .conditional_update_job(&job.id, JobStatus::Pending, &patch)
            .await
        {
            Ok(true) => {
                info!(job_id = %job.id, provider_id, "job assigned");
                Claim::Won
            }
            Ok(false) => {
                metrics::counter!("kombo_accept_lost_races_total").increment(1);
                debug!(job_id = %job.id, provider_id, "accept lost the race");
                Claim::Lost
            }
            Err(e) => {
                warn!(job_id = %job.id, provider_id, error = %e, "assignment write failed, still listening");
                Claim::Failed
            }
        }
    }

    /// Re-reads the job after a lost race or a rejected terminal write.
    /// `None` if it is still pending or unreadable.
    async fn settled_job(&self, job: &Job) -> Option<Job> {
        match self.jobs.get_job(&job.id).await {
            Ok(Some(current)) if current.status.is_terminal() => Some(current),
            Ok(_) => None,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not re-read job after lost race");
                None
            }
        }
    }
}

fn deadline_after(timeout: std::time::Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + std::time::Duration::from_secs_f64(DispatchConfig::MAX_TIMING_SEC))
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
