//! services/grader/src/pipeline/submissions.rs
//!
//! The single execution path every submission takes, whether it was called inline or
//! dispatched by the admission queue: load or create the evaluation, refresh and check
//! the attempt ledger, persist the submission, run it in the sandbox and record the result.

use crate::pipeline::admission::{JobHandler, SubmissionJob};
use crate::pipeline::sandbox::{SandboxExecutor, StagingPlan};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grading_core::domain::{
    Evaluation, ExecutionOutcome, Exercise, NewSubmission, Submission, SubmissionRequest, Task,
};
use grading_core::ledger::{self, Rejection};
use grading_core::ports::{PortError, SubmissionStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Port(#[from] PortError),
    /// The submission row exists but its result could not be stored.
    #[error("Result of submission {submission_id} could not be recorded: {source}")]
    Unrecorded {
        submission_id: i64,
        #[source]
        source: PortError,
    },
}

impl SubmitError {
    /// Only infrastructure failures that happened before anything was persisted are
    /// worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Port(_))
    }
}

type AttemptLock = tokio::sync::Mutex<()>;

pub struct SubmissionService {
    store: Arc<dyn SubmissionStore>,
    sandbox: SandboxExecutor,
    submissions_dir: PathBuf,
    /// One lock per (task, user); entries die with their last holder.
    locks: Mutex<HashMap<(i64, String), Weak<AttemptLock>>>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn SubmissionStore>, sandbox: SandboxExecutor, submissions_dir: PathBuf) -> Self {
        Self {
            store,
            sandbox,
            submissions_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn attempt_lock(&self, task_id: i64, user_id: &str) -> Arc<AttemptLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);

        let key = (task_id, user_id.to_string());
        if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(AttemptLock::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }

    async fn load_evaluation(&self, task: &Task, user_id: &str) -> Result<Evaluation, PortError> {
        match self.store.find_evaluation(task.id, user_id).await? {
            Some(evaluation) => Ok(evaluation),
            None => self.store.create_evaluation(task, user_id).await,
        }
    }

    /// Runs the ledger check without reserving anything, so queued submissions that
    /// can never pass are refused up front. The check is repeated at execution time.
    pub async fn precheck(
        &self,
        exercise: &Exercise,
        task: &Task,
        request: &SubmissionRequest,
        now: DateTime<Utc>,
    ) -> Result<(), SubmitError> {
        ledger::validate(exercise, task, request, now)?;
        if !request.restricted || !request.command.is_graded() {
            return Ok(());
        }
        let Some(mut evaluation) = self.store.find_evaluation(task.id, &request.user_id).await? else {
            return Ok(());
        };
        let history = self.store.list_submissions(evaluation.id).await?;
        ledger::refresh(&mut evaluation, task, &history, now);
        ledger::check(exercise, task, &evaluation, request, now)?;
        Ok(())
    }

    /// Executes one submission to completion. `received_at` is the instant the request
    /// arrived; windows and refills are judged against it.
    pub async fn execute(
        &self,
        exercise: &Exercise,
        task: &Task,
        request: &SubmissionRequest,
        received_at: DateTime<Utc>,
    ) -> Result<(Submission, ExecutionOutcome), SubmitError> {
        let lock = self.attempt_lock(task.id, &request.user_id);
        let _held = lock.lock().await;

        let mut evaluation = self.load_evaluation(task, &request.user_id).await?;
        let history = self.store.list_submissions(evaluation.id).await?;
        ledger::refresh(&mut evaluation, task, &history, received_at);
        if let Err(rejection) = ledger::check(exercise, task, &evaluation, request, received_at) {
            info!(
                task = %task.slug,
                user = %request.user_id,
                reason = %rejection,
                "Submission rejected."
            );
            return Err(rejection.into());
        }

        let global_files = self.store.global_files(&exercise.course_slug).await?;
        let mut submission = self
            .store
            .insert_submission(
                evaluation.id,
                &NewSubmission {
                    user_id: request.user_id.clone(),
                    command: request.command,
                    valid: false,
                    created_at: received_at,
                },
            )
            .await?;

        let plan = StagingPlan::for_command(request.command, task, &request.files, &global_files);
        let staging_dir = self.submissions_dir.join(submission.id.to_string());
        let outcome = self.sandbox.run(task, &staging_dir, request.command, &plan).await;

        submission.logs = outcome.logs.clone();
        submission.output = outcome.output.clone();
        let graded = match outcome.points() {
            Some(points) if request.command.is_graded() => {
                submission.valid = true;
                submission.points = Some(points);
                ledger::record_grade(&mut evaluation, points);
                true
            }
            _ => false,
        };

        // A row only turns valid once its attempt is on the evaluation.
        let unrecorded = |source: PortError| SubmitError::Unrecorded {
            submission_id: submission.id,
            source,
        };
        if graded {
            self.store
                .update_evaluation(&evaluation)
                .await
                .map_err(unrecorded)?;
        } else if request.command.is_graded() {
            warn!(submission = submission.id, "Graded run produced no points.");
        }
        self.store
            .update_submission(&submission)
            .await
            .map_err(unrecorded)?;

        info!(
            submission = submission.id,
            task = %task.slug,
            user = %request.user_id,
            command = %request.command,
            ordinal = submission.ordinal_num,
            points = ?submission.points,
            remaining = evaluation.remaining_attempts,
            "Submission executed."
        );
        Ok((submission, outcome))
    }

    /// Resolves the job's exercise and task, then executes it.
    pub async fn process(&self, job: &SubmissionJob) -> Result<(Submission, ExecutionOutcome), SubmitError> {
        let exercise = self
            .store
            .find_exercise(&job.course_slug, &job.exercise_slug)
            .await?;
        let task = self
            .store
            .find_task(&job.course_slug, &job.exercise_slug, job.task_slug.as_deref())
            .await?;
        self.execute(&exercise, &task, &job.request, job.received_at).await
    }
}

#[async_trait]
impl JobHandler for SubmissionService {
    async fn handle(&self, job: &SubmissionJob) -> Result<(), SubmitError> {
        self.process(job).await.map(|_| ())
    }
}
