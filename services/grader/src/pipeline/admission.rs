//! services/grader/src/pipeline/admission.rs
//!
//! Load-aware admission control for interactive-exercise submissions.
//!
//! Jobs wait in an unbounded FIFO. A single dispatcher task moves them into a bounded
//! pool of workers, but only while the host CPU is under the configured threshold and a
//! worker slot is free. After every dispatch the dispatcher pauses for a fixed cool-down
//! so that bursts are smoothed even when capacity frees up at once.

use crate::pipeline::submissions::SubmitError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grading_core::domain::{ExerciseKind, SubmissionRequest};
use grading_core::ports::{PortError, PortResult, SystemMetrics};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

//=========================================================================================
// Jobs
//=========================================================================================

/// How a submission reaches the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Executed on the caller's task; the caller waits for the result.
    Inline,
    /// Parked in the admission queue and executed when capacity allows.
    Queued,
}

impl AdmissionPolicy {
    pub fn for_kind(kind: ExerciseKind) -> Self {
        match kind {
            ExerciseKind::Assignment => AdmissionPolicy::Inline,
            ExerciseKind::Interactive => AdmissionPolicy::Queued,
        }
    }
}

/// One submission travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub id: Uuid,
    pub course_slug: String,
    pub exercise_slug: String,
    pub task_slug: Option<String>,
    pub request: SubmissionRequest,
    pub received_at: DateTime<Utc>,
    pub policy: AdmissionPolicy,
    pub retry_count: u32,
}

impl SubmissionJob {
    pub fn new(
        course_slug: &str,
        exercise_slug: &str,
        task_slug: Option<&str>,
        request: SubmissionRequest,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            course_slug: course_slug.to_string(),
            exercise_slug: exercise_slug.to_string(),
            task_slug: task_slug.map(str::to_string),
            request,
            received_at: Utc::now(),
            policy,
            retry_count: 0,
        }
    }

    fn targets(&self, course_slug: &str, exercise_slug: &str) -> bool {
        self.course_slug == course_slug && self.exercise_slug == exercise_slug
    }

    fn targets_user(&self, course_slug: &str, exercise_slug: &str, user_id: &str) -> bool {
        self.targets(course_slug, exercise_slug) && self.request.user_id == user_id
    }
}

/// The execution path a dispatched job is handed to.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &SubmissionJob) -> Result<(), SubmitError>;
}

//=========================================================================================
// Settings
//=========================================================================================

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// CPU utilization (0..=1) at or above which nothing is dispatched.
    pub cpu_threshold: f64,
    pub max_concurrent: usize,
    /// Pause after every dispatch.
    pub cooldown: Duration,
    /// Re-queue attempts for infrastructure failures.
    pub max_retries: u32,
    /// Bounded wait for running workers on shutdown.
    pub shutdown_grace: Duration,
    pub busy_backoff: Duration,
    pub metrics_backoff: Duration,
    /// Longest the dispatcher sleeps on an empty queue without being woken.
    pub idle_wait: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            cpu_threshold: 0.8,
            max_concurrent: 4,
            cooldown: Duration::from_millis(500),
            max_retries: 2,
            shutdown_grace: Duration::from_secs(30),
            busy_backoff: Duration::from_millis(100),
            metrics_backoff: Duration::from_secs(1),
            idle_wait: Duration::from_secs(1),
        }
    }
}

//=========================================================================================
// Shared State
//=========================================================================================

struct Shared {
    settings: AdmissionSettings,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<dyn SystemMetrics>,
    // Lock order: `pending` before `running`.
    pending: Mutex<VecDeque<SubmissionJob>>,
    running: Mutex<HashMap<Uuid, SubmissionJob>>,
    wakeup: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds one worker slot. Released on drop, so a finished, failed, panicked or
/// aborted job always frees its slot.
struct RunningSlot {
    shared: Arc<Shared>,
    job_id: Uuid,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        lock(&self.shared.running).remove(&self.job_id);
        self.shared.wakeup.notify_one();
    }
}

enum Dispatch {
    Started,
    Empty,
    Saturated,
    Overloaded(f64),
    NoMetric,
}

//=========================================================================================
// The Queue
//=========================================================================================

pub struct AdmissionQueue {
    shared: Arc<Shared>,
    token: CancellationToken,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<JoinSet<()>>>>,
}

impl AdmissionQueue {
    /// Creates the queue and starts its dispatcher. Cancelling `token` stops dispatching;
    /// call [`AdmissionQueue::shutdown`] to also drain the workers.
    pub fn spawn(
        settings: AdmissionSettings,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<dyn SystemMetrics>,
        token: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            settings,
            handler,
            metrics,
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
        });
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), token.clone()));
        Self {
            shared,
            token,
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
        }
    }

    pub fn enqueue(&self, job: SubmissionJob) -> PortResult<()> {
        if self.token.is_cancelled() {
            return Err(PortError::Unexpected(
                "The submission queue is shutting down".to_string(),
            ));
        }
        info!(
            job = %job.id,
            course = %job.course_slug,
            exercise = %job.exercise_slug,
            user = %job.request.user_id,
            "Submission queued."
        );
        lock(&self.shared.pending).push_back(job);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// True while a job for the exercise is still waiting to be dispatched.
    pub fn has_waiting_submissions(&self, course_slug: &str, exercise_slug: &str) -> bool {
        lock(&self.shared.pending)
            .iter()
            .any(|job| job.targets(course_slug, exercise_slug))
    }

    pub fn is_waiting(&self, course_slug: &str, exercise_slug: &str, user_id: &str) -> bool {
        lock(&self.shared.pending)
            .iter()
            .any(|job| job.targets_user(course_slug, exercise_slug, user_id))
    }

    pub fn is_running(&self, course_slug: &str, exercise_slug: &str, user_id: &str) -> bool {
        lock(&self.shared.running)
            .values()
            .any(|job| job.targets_user(course_slug, exercise_slug, user_id))
    }

    /// True once nothing for the exercise is waiting or running.
    pub fn is_fully_processed(&self, course_slug: &str, exercise_slug: &str) -> bool {
        let pending = lock(&self.shared.pending);
        let running = lock(&self.shared.running);
        !pending.iter().any(|job| job.targets(course_slug, exercise_slug))
            && !running.values().any(|job| job.targets(course_slug, exercise_slug))
    }

    /// Drops every waiting job for the exercise and returns how many were removed.
    /// Jobs already running are left to finish.
    pub fn purge(&self, course_slug: &str, exercise_slug: &str) -> usize {
        let mut pending = lock(&self.shared.pending);
        let before = pending.len();
        pending.retain(|job| !job.targets(course_slug, exercise_slug));
        let purged = before - pending.len();
        info!(course = course_slug, exercise = exercise_slug, purged, "Purged waiting submissions.");
        purged
    }

    pub fn waiting_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn running_count(&self) -> usize {
        lock(&self.shared.running).len()
    }

    /// Stops dispatching, waits up to the grace period for running jobs, then aborts
    /// whatever is left. Jobs still waiting in the queue are dropped.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let Some(dispatcher) = self.dispatcher.lock().await.take() else {
            return;
        };

        let mut workers = match dispatcher.await {
            Ok(workers) => workers,
            Err(e) => {
                error!(error = %e, "Submission dispatcher terminated abnormally.");
                return;
            }
        };

        let grace = self.shared.settings.shutdown_grace;
        info!(running = workers.len(), ?grace, "Draining submission workers.");
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = workers.len(), "Grace period elapsed; aborting submission workers.");
            workers.shutdown().await;
        }

        let abandoned = lock(&self.shared.pending).len();
        if abandoned > 0 {
            warn!(abandoned, "Submissions left in the queue at shutdown.");
        }
        info!("Submission queue stopped.");
    }
}

//=========================================================================================
// Dispatch Loop and Workers
//=========================================================================================

async fn dispatch_loop(shared: Arc<Shared>, token: CancellationToken) -> JoinSet<()> {
    let mut workers = JoinSet::new();
    info!(
        max_concurrent = shared.settings.max_concurrent,
        cpu_threshold = shared.settings.cpu_threshold,
        "Submission dispatcher started."
    );

    loop {
        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Submission worker panicked.");
                }
            }
        }

        let settings = &shared.settings;
        let pause = async {
            match try_dispatch(&shared, &mut workers).await {
                Dispatch::Started => tokio::time::sleep(settings.cooldown).await,
                Dispatch::Empty => {
                    let _ = tokio::time::timeout(settings.idle_wait, shared.wakeup.notified()).await;
                }
                Dispatch::Saturated => {
                    debug!("All submission workers busy.");
                    let _ = tokio::time::timeout(settings.busy_backoff, shared.wakeup.notified())
                        .await;
                }
                Dispatch::Overloaded(load) => {
                    debug!(load, "CPU above threshold; holding submissions.");
                    tokio::time::sleep(settings.busy_backoff).await;
                }
                Dispatch::NoMetric => {
                    warn!("CPU usage unavailable; holding submissions.");
                    tokio::time::sleep(settings.metrics_backoff).await;
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = pause => {}
        }
    }

    info!("Submission dispatcher stopped.");
    workers
}

async fn try_dispatch(shared: &Arc<Shared>, workers: &mut JoinSet<()>) -> Dispatch {
    if lock(&shared.pending).is_empty() {
        return Dispatch::Empty;
    }
    let Some(load) = shared.metrics.cpu_usage().await else {
        return Dispatch::NoMetric;
    };
    if load >= shared.settings.cpu_threshold {
        return Dispatch::Overloaded(load);
    }

    let job = {
        let mut pending = lock(&shared.pending);
        let mut running = lock(&shared.running);
        if running.len() >= shared.settings.max_concurrent {
            return Dispatch::Saturated;
        }
        let Some(job) = pending.pop_front() else {
            return Dispatch::Empty;
        };
        running.insert(job.id, job.clone());
        job
    };

    let slot = RunningSlot {
        shared: shared.clone(),
        job_id: job.id,
    };
    workers.spawn(run_job(shared.clone(), job, slot));
    Dispatch::Started
}

async fn run_job(shared: Arc<Shared>, mut job: SubmissionJob, _slot: RunningSlot) {
    info!(job = %job.id, user = %job.request.user_id, command = %job.request.command, "Submission dispatched.");
    match shared.handler.handle(&job).await {
        Ok(()) => info!(job = %job.id, "Submission processed."),
        Err(e) if e.is_retryable() && job.retry_count < shared.settings.max_retries => {
            job.retry_count += 1;
            warn!(job = %job.id, retry = job.retry_count, error = %e, "Submission failed; re-queueing.");
            lock(&shared.pending).push_back(job);
        }
        Err(e) => error!(job = %job.id, retries = job.retry_count, error = %e, "Submission failed."),
    }
}
