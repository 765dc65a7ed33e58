//! Job submission and the lifecycle of per-job dispatch tasks.
//!
//! Each submitted job gets its own task running rank -> dispatch. Tasks share
//! nothing but the job store; the service only keeps each task's cancellation
//! token and progress receiver so jobs can be cancelled, observed, and
//! drained on shutdown.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use kombo_core::{ClockSource, DispatchConfig, Job, JobRequest};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::dispatch::{
    CandidateRanker, DispatchControl, DispatchError, DispatchOutcome, DispatchProgress,
    WaveDispatcher,
};
use crate::network::shutdown::{HealthState, ShutdownController};
use crate::traits::JobStore;

/// Errors returned by [`JobService`].
#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("job {0} not found")]
    UnknownJob(String),

    #[error("server is draining and not accepting new jobs")]
    Draining,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug)]
struct ActiveDispatch {
    cancel: CancellationToken,
    progress: watch::Receiver<DispatchProgress>,
}

/// Owned by a dispatch task; removes the task's `active` entry however the
/// task ends. A task dropped before `finish` (panic or abort) leaves a
/// failure record behind.
struct ActiveEntry {
    job_id: String,
    active: Arc<DashMap<String, ActiveDispatch>>,
    aborted: Arc<DashMap<String, String>>,
    finished: bool,
}

impl ActiveEntry {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        if !self.finished {
            error!(job_id = %self.job_id, "dispatch task ended abnormally");
            self.aborted.insert(
                self.job_id.clone(),
                "dispatch task ended abnormally".to_string(),
            );
        }
        self.active.remove(&self.job_id);
    }
}

/// Handle to a submitted job's dispatch.
#[derive(Debug)]
pub struct JobHandle {
    /// The job as inserted (`pending`).
    pub job: Job,
    /// Live dispatch progress.
    pub progress: watch::Receiver<DispatchProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<DispatchOutcome, DispatchError>>,
}

impl JobHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.job.id
    }

    /// Stops the dispatch; the job stays `pending`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the dispatch to finish.
    ///
    /// # Errors
    ///
    /// Returns the dispatch failure, or `Internal` if the task panicked.
    pub async fn outcome(self) -> Result<DispatchOutcome, JobServiceError> {
        match self.task.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(JobServiceError::Internal(anyhow::anyhow!(
                "dispatch task for job {} failed: {e}",
                self.job.id
            ))),
        }
    }
}

/// Creates jobs and runs one dispatch task per job.
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    ranker: Arc<CandidateRanker>,
    dispatcher: Arc<WaveDispatcher>,
    clock: Arc<dyn ClockSource>,
    config: ArcSwap<DispatchConfig>,
    active: Arc<DashMap<String, ActiveDispatch>>,
    /// Jobs whose dispatch task died, with the reason reported as progress.
    aborted: Arc<DashMap<String, String>>,
    shutdown: Arc<ShutdownController>,
}

impl JobService {
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ranker: Arc<CandidateRanker>,
        dispatcher: Arc<WaveDispatcher>,
        clock: Arc<dyn ClockSource>,
        config: DispatchConfig,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            jobs,
            ranker,
            dispatcher,
            clock,
            config: ArcSwap::from_pointee(config.sanitized()),
            active: Arc::new(DashMap::new()),
            aborted: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Dispatch parameters applied to the next submitted job.
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        self.config.load().as_ref().clone()
    }

    /// Replaces the dispatch parameters. Running dispatches keep theirs.
    pub fn set_dispatch_config(&self, config: DispatchConfig) {
        let config = config.sanitized();
        info!(?config, "dispatch config updated");
        self.config.store(Arc::new(config));
    }

    /// Creates a `pending` job and starts dispatching it in the background.
    ///
    /// # Errors
    ///
    /// `Draining` during shutdown; `Dispatch(InsertJob)` if the job row
    /// could not be written, in which case nothing is dispatched.
    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle, JobServiceError> {
        if !self.accepting() {
            return Err(JobServiceError::Draining);
        }

        let config = self.dispatch_config();
        let radius = config.radius_for(request.radius_km);
        let job = Job::new(Uuid::new_v4().to_string(), request, radius, self.clock.now());
        self.jobs
            .insert_job(&job)
            .await
            .map_err(|source| DispatchError::InsertJob {
                job_id: job.id.clone(),
                source,
            })?;
        info!(job_id = %job.id, client_id = %job.client_id, radius_km = radius, "job created");

        let (control, progress) = DispatchControl::new();
        let cancel = control.cancel_token();
        self.active.insert(
            job.id.clone(),
            ActiveDispatch {
                cancel: cancel.clone(),
                progress: progress.clone(),
            },
        );

        let guard = self.shutdown.dispatch_guard();
        let entry = ActiveEntry {
            job_id: job.id.clone(),
            active: Arc::clone(&self.active),
            aborted: Arc::clone(&self.aborted),
            finished: false,
        };
        let ranker = Arc::clone(&self.ranker);
        let dispatcher = Arc::clone(&self.dispatcher);
        let task_job = job.clone();
        let span = info_span!("dispatch", job_id = %job.id);

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let candidates = ranker.rank_candidates(&task_job).await;
                let result = dispatcher
                    .dispatch(&task_job, &candidates, &config, &control)
                    .await;
                if let Err(e) = &result {
                    error!(error = %e, "dispatch failed");
                }
                entry.finish();
                result
            }
            .instrument(span),
        );

        // Shutdown may have started while the job was being inserted.
        if !self.accepting() {
            cancel.cancel();
        }

        Ok(JobHandle {
            job,
            progress,
            cancel,
            task,
        })
    }

    /// Loads a job.
    ///
    /// # Errors
    ///
    /// `UnknownJob` if it does not exist; `Internal` on store failure.
    pub async fn job(&self, job_id: &str) -> Result<Job, JobServiceError> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobServiceError::UnknownJob(job_id.to_string()))
    }

    /// Current progress: live while dispatching, `Failed` if the dispatch
    /// task died, derived from the stored job otherwise.
    ///
    /// # Errors
    ///
    /// `UnknownJob` if the job does not exist.
    pub async fn progress(&self, job_id: &str) -> Result<DispatchProgress, JobServiceError> {
        if let Some(progress) = self
            .active
            .get(job_id)
            .map(|active| active.progress.borrow().clone())
        {
            return Ok(progress);
        }
        if let Some(reason) = self.aborted.get(job_id).map(|r| r.clone()) {
            return Ok(DispatchProgress::Failed { reason });
        }
        let job = self.job(job_id).await?;
        Ok(DispatchProgress::from_job(&job))
    }

    /// Cancels the job's running dispatch.
    ///
    /// Returns `false` if the job exists but is not being dispatched.
    ///
    /// # Errors
    ///
    /// `UnknownJob` if the job does not exist.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, JobServiceError> {
        if let Some(active) = self.active.get(job_id) {
            active.cancel.cancel();
            info!(job_id, "dispatch cancelled");
            return Ok(true);
        }
        self.job(job_id).await?;
        Ok(false)
    }

    fn accepting(&self) -> bool {
        !matches!(
            self.shutdown.health_state(),
            HealthState::Draining | HealthState::Stopped
        )
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Refuses new jobs, cancels every running dispatch, and waits for them
    /// to finish. Returns whether all finished within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.trigger_shutdown();
        let running = self.active.len();
        for active in self.active.iter() {
            active.cancel.cancel();
        }
        let drained = self.shutdown.wait_for_drain(timeout).await;
        info!(running, drained, "dispatches drained");
        drained
    }
}
