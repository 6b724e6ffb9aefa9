//! Publishing, extending, terminating and resetting interactive exercises.
//!
//! Every state change is persisted first and then broadcast to the course.

use crate::pipeline::admission::AdmissionQueue;
use crate::pipeline::notifications::{Audience, ClassroomEvent, NotificationHub};
use crate::pipeline::submissions::SubmitError;
use chrono::{DateTime, TimeDelta, Utc};
use grading_core::domain::{Exercise, ExerciseKind, ExerciseWindow};
use grading_core::ledger::Rejection;
use grading_core::ports::SubmissionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// How long a reset waits for queued and running submissions to finish.
    pub reset_drain_timeout: Duration,
    pub reset_poll_interval: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            reset_drain_timeout: Duration::from_secs(30),
            reset_poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct ExerciseLifecycle {
    store: Arc<dyn SubmissionStore>,
    hub: Arc<NotificationHub>,
    queue: Arc<AdmissionQueue>,
    settings: LifecycleSettings,
}

fn invalid(message: impl Into<String>) -> SubmitError {
    SubmitError::Rejected(Rejection::Validation(message.into()))
}

fn positive_duration(duration_secs: i64) -> Result<TimeDelta, SubmitError> {
    if duration_secs <= 0 {
        return Err(invalid("Duration must be a positive value"));
    }
    TimeDelta::try_seconds(duration_secs).ok_or_else(|| invalid("Duration is too long"))
}

fn shifted(instant: DateTime<Utc>, duration: TimeDelta) -> Result<DateTime<Utc>, SubmitError> {
    instant
        .checked_add_signed(duration)
        .ok_or_else(|| invalid("Duration is too long"))
}

impl ExerciseLifecycle {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        hub: Arc<NotificationHub>,
        queue: Arc<AdmissionQueue>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            hub,
            queue,
            settings,
        }
    }

    async fn load_interactive(&self, course_slug: &str, exercise_slug: &str) -> Result<Exercise, SubmitError> {
        let exercise = self.store.find_exercise(course_slug, exercise_slug).await?;
        if exercise.kind != ExerciseKind::Interactive {
            return Err(invalid(format!("{} is not an interactive exercise", exercise.slug)));
        }
        Ok(exercise)
    }

    /// Fails unless the exercise is published and still running.
    fn ensure_running(exercise: &Exercise, now: DateTime<Utc>) -> Result<(), SubmitError> {
        if !exercise.window.is_published() {
            return Err(invalid(format!("{} has not been published", exercise.slug)));
        }
        if exercise.window.has_ended(now) {
            return Err(invalid(format!("{} is past due", exercise.slug)));
        }
        Ok(())
    }

    /// A course runs at most one interactive exercise at a time.
    async fn ensure_course_idle(&self, exercise: &Exercise, now: DateTime<Utc>) -> Result<(), SubmitError> {
        let running = self
            .store
            .list_exercises(&exercise.course_slug)
            .await?
            .into_iter()
            .find(|other| {
                other.kind == ExerciseKind::Interactive
                    && other.slug != exercise.slug
                    && other.window.is_active(now)
            });
        match running {
            Some(other) => Err(invalid(format!(
                "Another interactive exercise is already running: {}",
                other.slug
            ))),
            None => Ok(()),
        }
    }

    async fn announce_timer(&self, exercise: &Exercise) {
        if let (Some(start), Some(end)) = (exercise.window.start, exercise.window.end) {
            self.hub
                .broadcast(
                    &exercise.course_slug,
                    Audience::Everyone,
                    ClassroomEvent::timer_update(start, end),
                )
                .await;
        }
    }

    pub async fn publish(
        &self,
        course_slug: &str,
        exercise_slug: &str,
        duration_secs: i64,
    ) -> Result<Exercise, SubmitError> {
        let duration = positive_duration(duration_secs)?;
        let mut exercise = self.load_interactive(course_slug, exercise_slug).await?;
        if exercise.window.is_published() {
            return Err(invalid(format!("{} has already been published", exercise.slug)));
        }
        let now = Utc::now();
        self.ensure_course_idle(&exercise, now).await?;

        exercise.window.start = Some(now);
        exercise.window.end = Some(shifted(now, duration)?);
        self.store.update_exercise_window(&exercise).await?;
        info!(course = course_slug, exercise = exercise_slug, duration_secs, "Exercise published.");

        let path = format!("/courses/{}/examples/{}", course_slug, exercise_slug);
        self.hub
            .broadcast(course_slug, Audience::Students, ClassroomEvent::redirect(path))
            .await;
        self.announce_timer(&exercise).await;
        Ok(exercise)
    }

    pub async fn extend(
        &self,
        course_slug: &str,
        exercise_slug: &str,
        duration_secs: i64,
    ) -> Result<Exercise, SubmitError> {
        let duration = positive_duration(duration_secs)?;
        let mut exercise = self.load_interactive(course_slug, exercise_slug).await?;
        let now = Utc::now();
        Self::ensure_running(&exercise, now)?;

        let end = exercise.window.end.unwrap_or(now);
        exercise.window.end = Some(shifted(end, duration)?);
        self.store.update_exercise_window(&exercise).await?;
        info!(course = course_slug, exercise = exercise_slug, duration_secs, "Exercise extended.");

        let message = format!(
            "Submission time extended by the lecturer by {} seconds.",
            duration_secs
        );
        self.hub
            .broadcast(course_slug, Audience::Everyone, ClassroomEvent::message(message))
            .await;
        self.announce_timer(&exercise).await;
        Ok(exercise)
    }

    /// Ends the exercise now and drops its submissions that are still waiting in the queue.
    pub async fn terminate(&self, course_slug: &str, exercise_slug: &str) -> Result<Exercise, SubmitError> {
        let mut exercise = self.load_interactive(course_slug, exercise_slug).await?;
        let now = Utc::now();
        Self::ensure_running(&exercise, now)?;

        exercise.window.end = Some(now);
        self.store.update_exercise_window(&exercise).await?;
        let purged = self.queue.purge(course_slug, exercise_slug);
        info!(course = course_slug, exercise = exercise_slug, purged, "Exercise terminated.");

        self.hub
            .broadcast(
                course_slug,
                Audience::Everyone,
                ClassroomEvent::message("The example has been terminated by the lecturer."),
            )
            .await;
        self.announce_timer(&exercise).await;
        Ok(exercise)
    }

    /// Returns the exercise to its unpublished state and deletes every submission made
    /// to it. Waiting submissions are dropped; running ones get a bounded time to finish.
    pub async fn reset(&self, course_slug: &str, exercise_slug: &str) -> Result<Exercise, SubmitError> {
        let mut exercise = self.load_interactive(course_slug, exercise_slug).await?;
        let purged = self.queue.purge(course_slug, exercise_slug);

        let drained = tokio::time::timeout(self.settings.reset_drain_timeout, async {
            while !self.queue.is_fully_processed(course_slug, exercise_slug) {
                tokio::time::sleep(self.settings.reset_poll_interval).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                course = course_slug,
                exercise = exercise_slug,
                timeout = ?self.settings.reset_drain_timeout,
                "Submissions still running; resetting anyway."
            );
        }

        self.store.reset_exercise(&exercise).await?;
        exercise.window = ExerciseWindow::default();
        info!(course = course_slug, exercise = exercise_slug, purged, "Exercise reset.");

        self.hub
            .broadcast(
                course_slug,
                Audience::Everyone,
                ClassroomEvent::exercise_reset(exercise_slug),
            )
            .await;
        Ok(exercise)
    }
}
