//! services/grader/src/pipeline/sandbox.rs
//!
//! Runs a single submission inside an isolated, resource-capped container.
//!
//! The executor stages the task templates, the student's files and the course-wide
//! files into a per-submission directory, bind-mounts it at the identical path inside
//! the container, runs the task command with its output redirected to a log file, and
//! reads the log and (for GRADE) the structured result file back. Every failure is
//! turned into a user-visible message; nothing escapes `run` as an error.

use grading_core::domain::{Command, ExecutionOutcome, GradeResults, SubmittedFile, Task, TaskFile};
use grading_core::ports::{ContainerRuntime, ContainerSpec, PortError};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LOG_FILE: &str = "logs.txt";
pub const RESULTS_FILE: &str = "grade_results.json";
pub const TIME_LIMIT_EXCEEDED: &str = "Time limit exceeded";

//=========================================================================================
// Settings and Staging Plan
//=========================================================================================

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub memory_limit_bytes: i64,
    /// Upper bound applied on top of every task's own time limit.
    pub hard_time_limit: Duration,
    pub log_line_limit: usize,
    pub network_disabled: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 512 * 1024 * 1024,
            hard_time_limit: Duration::from_secs(180),
            log_line_limit: 50,
            network_disabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedFile {
    path: String,
    content: String,
}

/// The files to materialize for one run, in write order. Later entries overwrite
/// earlier ones with the same relative path.
#[derive(Debug, Clone, Default)]
pub struct StagingPlan {
    files: Vec<StagedFile>,
}

impl StagingPlan {
    /// Task templates first, then the student's files, then the course-wide files.
    /// Grading files are only included for GRADE.
    pub fn for_command(
        command: Command,
        task: &Task,
        submitted: &[SubmittedFile],
        global: &[TaskFile],
    ) -> Self {
        let templates = task.files.iter().filter(|f| f.applies_to(command)).map(|f| StagedFile {
            path: f.path.clone(),
            content: f.content.clone(),
        });
        let student = submitted.iter().map(|f| StagedFile {
            path: f.path.clone(),
            content: f.content.clone(),
        });
        let shared = global.iter().filter(|f| f.applies_to(command)).map(|f| StagedFile {
            path: f.path.clone(),
            content: f.content.clone(),
        });
        Self {
            files: templates.chain(student).chain(shared).collect(),
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}

//=========================================================================================
// Errors
//=========================================================================================

#[derive(Debug, thiserror::Error)]
enum SandboxError {
    #[error("Failed to prepare the submission files: {0}")]
    Staging(#[from] std::io::Error),
    #[error("Invalid file path '{0}'")]
    UnsafePath(String),
    #[error("Task does not define a {0} command")]
    MissingCommand(Command),
    #[error("{0}")]
    Runtime(#[from] PortError),
    #[error("Execution timeout after {0:?}")]
    Timeout(Duration),
    #[error("Failed to read the grading results: {0}")]
    Results(String),
}

impl SandboxError {
    fn user_message(&self) -> String {
        match self {
            SandboxError::Timeout(_) => TIME_LIMIT_EXCEEDED.to_string(),
            other => {
                let message = other.to_string();
                if message.to_lowercase().contains("timeout") {
                    TIME_LIMIT_EXCEEDED.to_string()
                } else {
                    message
                }
            }
        }
    }
}

//=========================================================================================
// The Executor
//=========================================================================================

pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        Self { runtime, settings }
    }

    /// Executes `command` for `task` in `staging_dir` and always removes the directory
    /// afterwards. Failures end up in the outcome's `output`.
    pub async fn run(
        &self,
        task: &Task,
        staging_dir: &Path,
        command: Command,
        plan: &StagingPlan,
    ) -> ExecutionOutcome {
        let outcome = match self.execute(task, staging_dir, command, plan).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task = %task.slug, %command, error = %e, "Sandbox execution failed.");
                ExecutionOutcome::failed(e.user_message())
            }
        };

        if let Err(e) = remove_staging_dir(staging_dir).await {
            warn!(dir = %staging_dir.display(), error = %e, "Failed to remove staging directory.");
        }
        outcome
    }

    async fn execute(
        &self,
        task: &Task,
        staging_dir: &Path,
        command: Command,
        plan: &StagingPlan,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let command_line = task
            .command_line(command)
            .ok_or(SandboxError::MissingCommand(command))?;

        stage_files(staging_dir, plan).await?;
        let workdir = tokio::fs::canonicalize(staging_dir).await?;

        self.runtime.ensure_image(&task.image).await?;

        let spec = ContainerSpec {
            image: task.image.clone(),
            command: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("{} &> {}", command_line, LOG_FILE),
            ],
            working_dir: workdir.clone(),
            mounts: vec![workdir.clone()],
            memory_limit_bytes: self.settings.memory_limit_bytes,
            network_disabled: self.settings.network_disabled,
            labels: HashMap::from([
                ("task".to_string(), task.slug.clone()),
                ("command".to_string(), command.to_string()),
            ]),
        };
        let container_id = self.runtime.create(&spec).await?;
        debug!(container = %container_id, image = %task.image, "Sandbox container created.");

        let limit = task.time_limit.min(self.settings.hard_time_limit);
        let waited = self.start_and_wait(&container_id, limit).await;

        // The container is reaped on every path, including timeouts.
        if let Err(e) = self.runtime.remove(&container_id).await {
            warn!(container = %container_id, error = %e, "Failed to remove sandbox container.");
        }
        let exit_code = waited?;
        info!(container = %container_id, exit_code, "Sandbox container finished.");

        let logs = read_logs(&workdir, self.settings.log_line_limit).await?;
        if !command.is_graded() {
            return Ok(ExecutionOutcome {
                output: logs.clone(),
                logs,
                results: None,
            });
        }

        let results = read_results(&workdir).await?;
        Ok(ExecutionOutcome {
            logs,
            output: results.hints.first().cloned(),
            results: Some(results),
        })
    }

    async fn start_and_wait(&self, container_id: &str, limit: Duration) -> Result<i64, SandboxError> {
        self.runtime.start(container_id).await?;
        match tokio::time::timeout(limit, self.runtime.wait(container_id)).await {
            Ok(exit) => Ok(exit?),
            Err(_) => Err(SandboxError::Timeout(limit)),
        }
    }
}

//=========================================================================================
// Filesystem Helpers
//=========================================================================================

/// Resolves a submitted path against the staging directory. A leading `/` is treated as
/// the staging root; anything that would leave the directory is refused.
fn staged_path(root: &Path, relative: &str) -> Result<PathBuf, SandboxError> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SandboxError::UnsafePath(relative.to_string()))
            }
        }
    }
    if depth == 0 {
        return Err(SandboxError::UnsafePath(relative.to_string()));
    }
    Ok(resolved)
}

async fn stage_files(staging_dir: &Path, plan: &StagingPlan) -> Result<(), SandboxError> {
    tokio::fs::create_dir_all(staging_dir).await?;
    for file in &plan.files {
        let target = staged_path(staging_dir, &file.path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, file.content.as_bytes()).await?;
    }
    Ok(())
}

async fn read_logs(dir: &Path, line_limit: usize) -> Result<Option<String>, SandboxError> {
    match tokio::fs::read(dir.join(LOG_FILE)).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(Some(text.lines().take(line_limit).collect::<Vec<_>>().join("\n")))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_results(dir: &Path) -> Result<GradeResults, SandboxError> {
    let raw = tokio::fs::read_to_string(dir.join(RESULTS_FILE))
        .await
        .map_err(|e| SandboxError::Results(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| SandboxError::Results(e.to_string()))
}

async fn remove_staging_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
