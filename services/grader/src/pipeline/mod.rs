//! services/grader/src/pipeline/mod.rs
//!
//! The submission pipeline and the facade the web layer talks to.

pub mod admission;
pub mod lifecycle;
pub mod notifications;
pub mod periodic;
pub mod presence;
pub mod sandbox;
pub mod submissions;

use admission::{AdmissionPolicy, AdmissionQueue, AdmissionSettings, SubmissionJob};
use chrono::Utc;
use grading_core::domain::{ExecutionOutcome, Submission, SubmissionRequest};
use grading_core::ports::{ContainerRuntime, SubmissionStore, SystemMetrics};
use lifecycle::{ExerciseLifecycle, LifecycleSettings};
use notifications::{ChannelHandle, ChannelRole, HubSettings, NotificationHub};
use presence::{PresenceSettings, PresenceTracker};
use sandbox::{SandboxExecutor, SandboxSettings};
use std::path::PathBuf;
use std::sync::Arc;
use submissions::{SubmissionService, SubmitError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub submissions_dir: PathBuf,
    pub sandbox: SandboxSettings,
    pub admission: AdmissionSettings,
    pub hub: HubSettings,
    pub presence: PresenceSettings,
    pub lifecycle: LifecycleSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            submissions_dir: PathBuf::from("./submissions"),
            sandbox: SandboxSettings::default(),
            admission: AdmissionSettings::default(),
            hub: HubSettings::default(),
            presence: PresenceSettings::default(),
            lifecycle: LifecycleSettings::default(),
        }
    }
}

/// What happened to an accepted submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Executed inline; the result is final.
    Completed(Submission),
    /// Parked in the admission queue.
    Queued,
}

pub struct Pipeline {
    store: Arc<dyn SubmissionStore>,
    submissions: Arc<SubmissionService>,
    queue: Arc<AdmissionQueue>,
    hub: Arc<NotificationHub>,
    presence: Arc<PresenceTracker>,
    lifecycle: ExerciseLifecycle,
    token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Wires every component together and starts the dispatcher and the periodic sweeps.
    pub fn start(
        settings: PipelineSettings,
        store: Arc<dyn SubmissionStore>,
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<dyn SystemMetrics>,
    ) -> Self {
        let token = CancellationToken::new();
        let sandbox = SandboxExecutor::new(runtime, settings.sandbox);
        let submissions = Arc::new(SubmissionService::new(
            store.clone(),
            sandbox,
            settings.submissions_dir,
        ));
        let queue = Arc::new(AdmissionQueue::spawn(
            settings.admission,
            submissions.clone(),
            metrics,
            token.child_token(),
        ));
        let hub = NotificationHub::new(settings.hub);
        let presence = PresenceTracker::new(settings.presence);
        let background = vec![
            hub.spawn_sweeper(token.child_token()),
            presence.spawn_cache_evictor(token.child_token()),
        ];
        let lifecycle = ExerciseLifecycle::new(
            store.clone(),
            hub.clone(),
            queue.clone(),
            settings.lifecycle,
        );

        Self {
            store,
            submissions,
            queue,
            hub,
            presence,
            lifecycle,
            token,
            background: Mutex::new(background),
        }
    }

    /// Validates the request, then either executes it inline or queues it depending on
    /// the kind of exercise it targets.
    pub async fn submit(
        &self,
        course_slug: &str,
        exercise_slug: &str,
        task_slug: Option<&str>,
        request: SubmissionRequest,
    ) -> Result<SubmitOutcome, SubmitError> {
        let exercise = self.store.find_exercise(course_slug, exercise_slug).await?;
        let task = self.store.find_task(course_slug, exercise_slug, task_slug).await?;
        let now = Utc::now();

        match AdmissionPolicy::for_kind(exercise.kind) {
            AdmissionPolicy::Inline => {
                let (submission, _) = self.submissions.execute(&exercise, &task, &request, now).await?;
                Ok(SubmitOutcome::Completed(submission))
            }
            AdmissionPolicy::Queued => {
                self.submissions.precheck(&exercise, &task, &request, now).await?;
                let mut job = SubmissionJob::new(
                    course_slug,
                    exercise_slug,
                    task_slug,
                    request,
                    AdmissionPolicy::Queued,
                );
                job.received_at = now;
                self.queue.enqueue(job)?;
                Ok(SubmitOutcome::Queued)
            }
        }
    }

    /// Executes a submission immediately, bypassing the admission queue.
    pub async fn execute_now(
        &self,
        course_slug: &str,
        exercise_slug: &str,
        task_slug: Option<&str>,
        request: SubmissionRequest,
    ) -> Result<(Submission, ExecutionOutcome), SubmitError> {
        let job = SubmissionJob::new(
            course_slug,
            exercise_slug,
            task_slug,
            request,
            AdmissionPolicy::Inline,
        );
        self.submissions.process(&job).await
    }

    pub async fn open_channel(&self, course_slug: &str, user_id: &str, role: ChannelRole) -> ChannelHandle {
        self.hub.open_channel(course_slug, user_id, role).await
    }

    pub async fn close_channel(&self, course_slug: &str, channel_id: &str) {
        self.hub.remove_channel(course_slug, channel_id).await;
    }

    /// Keeps the channel alive and counts its user as present. Returns `false` for
    /// unknown channels.
    pub async fn heartbeat(&self, course_slug: &str, channel_id: &str) -> bool {
        match self.hub.heartbeat(course_slug, channel_id).await {
            Some(user_id) => {
                self.presence.record(course_slug, &user_id).await;
                true
            }
            None => false,
        }
    }

    pub async fn recently_active_count(&self, course_slug: &str) -> usize {
        self.presence.recently_active_count(course_slug).await
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn lifecycle(&self) -> &ExerciseLifecycle {
        &self.lifecycle
    }

    /// Stops the periodic tasks, drains the admission queue and closes every channel.
    pub async fn shutdown(&self) {
        info!("Shutting down the submission pipeline.");
        self.token.cancel();
        self.queue.shutdown().await;

        let background: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally.");
            }
        }
        self.hub.close_all().await;
        info!("Submission pipeline stopped.");
    }
}
