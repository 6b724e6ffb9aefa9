//! crates/grading_core/src/ports.rs
//!
//! Defines the service contracts (traits) the grading pipeline consumes.
//! These traits form the boundary of the hexagonal architecture, keeping the core
//! independent of the database, the container engine and the host metrics source.

use crate::domain::{Evaluation, Exercise, NewSubmission, Submission, Task, TaskFile};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (database, docker, ...).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Persistence
//=========================================================================================

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    // --- Exercises ---
    async fn find_exercise(&self, course_slug: &str, exercise_slug: &str) -> PortResult<Exercise>;

    async fn list_exercises(&self, course_slug: &str) -> PortResult<Vec<Exercise>>;

    async fn update_exercise_window(&self, exercise: &Exercise) -> PortResult<()>;

    /// Unpublishes the exercise and deletes every evaluation and submission of its tasks.
    async fn reset_exercise(&self, exercise: &Exercise) -> PortResult<()>;

    /// Loads a task with its files. Interactive exercises own a single task whose
    /// slug equals the exercise slug, so `task_slug` is `None` for them.
    async fn find_task(
        &self,
        course_slug: &str,
        exercise_slug: &str,
        task_slug: Option<&str>,
    ) -> PortResult<Task>;

    /// Files shared by every task of a course.
    async fn global_files(&self, course_slug: &str) -> PortResult<Vec<TaskFile>>;

    // --- Evaluations ---
    async fn find_evaluation(&self, task_id: i64, user_id: &str) -> PortResult<Option<Evaluation>>;

    async fn create_evaluation(&self, task: &Task, user_id: &str) -> PortResult<Evaluation>;

    async fn update_evaluation(&self, evaluation: &Evaluation) -> PortResult<()>;

    // --- Submissions ---
    /// All submissions of an evaluation, oldest first.
    async fn list_submissions(&self, evaluation_id: i64) -> PortResult<Vec<Submission>>;

    /// Persists a new submission, assigning its id and its per-command ordinal number.
    async fn insert_submission(
        &self,
        evaluation_id: i64,
        submission: &NewSubmission,
    ) -> PortResult<Submission>;

    async fn update_submission(&self, submission: &Submission) -> PortResult<()>;
}

//=========================================================================================
// Container Runtime
//=========================================================================================

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Host directories mounted read-write at the identical path inside the container.
    pub mounts: Vec<PathBuf>,
    pub memory_limit_bytes: i64,
    pub network_disabled: bool,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes sure the image is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> PortResult<()>;

    /// Creates a container and returns its id.
    async fn create(&self, spec: &ContainerSpec) -> PortResult<String>;

    async fn start(&self, container_id: &str) -> PortResult<()>;

    /// Blocks until the container stops and returns its exit code.
    /// Callers bound this with their own timeout.
    async fn wait(&self, container_id: &str) -> PortResult<i64>;

    /// Removes the container, killing it first if it is still running.
    async fn remove(&self, container_id: &str) -> PortResult<()>;
}

//=========================================================================================
// Host Metrics
//=========================================================================================

#[async_trait]
pub trait SystemMetrics: Send + Sync {
    /// Current CPU utilization in `0.0..=1.0`, or `None` while no sample is available.
    async fn cpu_usage(&self) -> Option<f64>;
}
