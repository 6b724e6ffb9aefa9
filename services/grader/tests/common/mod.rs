//! In-memory stand-ins for the pipeline's ports.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use grader_lib::pipeline::admission::AdmissionSettings;
use grader_lib::pipeline::lifecycle::LifecycleSettings;
use grader_lib::pipeline::notifications::HubSettings;
use grader_lib::pipeline::{Pipeline, PipelineSettings};
use grading_core::domain::{
    Command, Evaluation, Exercise, ExerciseKind, ExerciseWindow, NewSubmission, Submission,
    SubmissionRequest, SubmittedFile, Task, TaskFile,
};
use grading_core::ports::{
    ContainerRuntime, ContainerSpec, PortError, PortResult, SubmissionStore, SystemMetrics,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const COURSE: &str = "algorithms";

//=========================================================================================
// Store
//=========================================================================================

#[derive(Default)]
pub struct FakeStore {
    exercises: Mutex<Vec<Exercise>>,
    tasks: Mutex<Vec<(String, Task)>>,
    global_files: Mutex<Vec<TaskFile>>,
    evaluations: Mutex<Vec<Evaluation>>,
    submissions: Mutex<Vec<Submission>>,
    fail_evaluation_update: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_exercise(&self, slug: &str, kind: ExerciseKind, window: ExerciseWindow) -> i64 {
        let mut exercises = self.exercises.lock().unwrap();
        let id = exercises.len() as i64 + 1;
        exercises.push(Exercise {
            id,
            course_slug: COURSE.to_string(),
            slug: slug.to_string(),
            kind,
            window,
        });
        id
    }

    pub fn add_task(&self, exercise_slug: &str, task: Task) {
        self.tasks
            .lock()
            .unwrap()
            .push((exercise_slug.to_string(), task));
    }

    pub fn add_global_file(&self, file: TaskFile) {
        self.global_files.lock().unwrap().push(file);
    }

    pub fn exercise(&self, slug: &str) -> Exercise {
        self.exercises
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.slug == slug)
            .cloned()
            .unwrap()
    }

    pub fn evaluation(&self, task_id: i64, user_id: &str) -> Option<Evaluation> {
        self.evaluations
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.task_id == task_id && e.user_id == user_id)
            .cloned()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    /// The next `update_evaluation` call fails as if the database had gone away.
    pub fn fail_next_evaluation_update(&self) {
        self.fail_evaluation_update.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubmissionStore for FakeStore {
    async fn find_exercise(&self, course_slug: &str, exercise_slug: &str) -> PortResult<Exercise> {
        self.exercises
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.course_slug == course_slug && e.slug == exercise_slug)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Exercise {} not found", exercise_slug)))
    }

    async fn list_exercises(&self, course_slug: &str) -> PortResult<Vec<Exercise>> {
        Ok(self
            .exercises
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.course_slug == course_slug)
            .cloned()
            .collect())
    }

    async fn reset_exercise(&self, exercise: &Exercise) -> PortResult<()> {
        let task_ids: Vec<i64> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(slug, _)| *slug == exercise.slug)
            .map(|(_, task)| task.id)
            .collect();
        let mut evaluations = self.evaluations.lock().unwrap();
        let dropped: Vec<i64> = evaluations
            .iter()
            .filter(|e| task_ids.contains(&e.task_id))
            .map(|e| e.id)
            .collect();
        evaluations.retain(|e| !dropped.contains(&e.id));
        self.submissions
            .lock()
            .unwrap()
            .retain(|s| !dropped.contains(&s.evaluation_id));

        let mut exercises = self.exercises.lock().unwrap();
        if let Some(stored) = exercises.iter_mut().find(|e| e.id == exercise.id) {
            stored.window = ExerciseWindow::default();
        }
        Ok(())
    }

    async fn update_exercise_window(&self, exercise: &Exercise) -> PortResult<()> {
        let mut exercises = self.exercises.lock().unwrap();
        let stored = exercises
            .iter_mut()
            .find(|e| e.id == exercise.id)
            .ok_or_else(|| PortError::NotFound("exercise".into()))?;
        stored.window = exercise.window;
        Ok(())
    }

    async fn find_task(
        &self,
        _course_slug: &str,
        exercise_slug: &str,
        task_slug: Option<&str>,
    ) -> PortResult<Task> {
        let task_slug = task_slug.unwrap_or(exercise_slug);
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|(exercise, task)| exercise == exercise_slug && task.slug == task_slug)
            .map(|(_, task)| task.clone())
            .ok_or_else(|| PortError::NotFound(format!("Task {} not found", task_slug)))
    }

    async fn global_files(&self, _course_slug: &str) -> PortResult<Vec<TaskFile>> {
        Ok(self.global_files.lock().unwrap().clone())
    }

    async fn find_evaluation(&self, task_id: i64, user_id: &str) -> PortResult<Option<Evaluation>> {
        Ok(self.evaluation(task_id, user_id))
    }

    async fn create_evaluation(&self, task: &Task, user_id: &str) -> PortResult<Evaluation> {
        let mut evaluations = self.evaluations.lock().unwrap();
        if let Some(existing) = evaluations
            .iter()
            .find(|e| e.task_id == task.id && e.user_id == user_id)
        {
            return Ok(existing.clone());
        }
        let evaluation = Evaluation {
            id: evaluations.len() as i64 + 1,
            task_id: task.id,
            user_id: user_id.to_string(),
            best_score: None,
            remaining_attempts: task.max_attempts,
            next_attempt_at: None,
        };
        evaluations.push(evaluation.clone());
        Ok(evaluation)
    }

    async fn update_evaluation(&self, evaluation: &Evaluation) -> PortResult<()> {
        if self.fail_evaluation_update.swap(false, Ordering::SeqCst) {
            return Err(PortError::Unexpected("connection reset".into()));
        }
        let mut evaluations = self.evaluations.lock().unwrap();
        let stored = evaluations
            .iter_mut()
            .find(|e| e.id == evaluation.id)
            .ok_or_else(|| PortError::NotFound("evaluation".into()))?;
        *stored = evaluation.clone();
        Ok(())
    }

    async fn list_submissions(&self, evaluation_id: i64) -> PortResult<Vec<Submission>> {
        Ok(self
            .submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.evaluation_id == evaluation_id)
            .cloned()
            .collect())
    }

    async fn insert_submission(
        &self,
        evaluation_id: i64,
        submission: &NewSubmission,
    ) -> PortResult<Submission> {
        let mut submissions = self.submissions.lock().unwrap();
        let ordinal_num = submissions
            .iter()
            .filter(|s| s.evaluation_id == evaluation_id && s.command == submission.command)
            .map(|s| s.ordinal_num)
            .max()
            .unwrap_or(0)
            + 1;
        let stored = Submission {
            id: submissions.len() as i64 + 1,
            evaluation_id,
            user_id: submission.user_id.clone(),
            command: submission.command,
            ordinal_num,
            valid: submission.valid,
            points: None,
            logs: None,
            output: None,
            created_at: submission.created_at,
        };
        submissions.push(stored.clone());
        Ok(stored)
    }

    async fn update_submission(&self, submission: &Submission) -> PortResult<()> {
        let mut submissions = self.submissions.lock().unwrap();
        let stored = submissions
            .iter_mut()
            .find(|s| s.id == submission.id)
            .ok_or_else(|| PortError::NotFound("submission".into()))?;
        *stored = submission.clone();
        Ok(())
    }
}

//=========================================================================================
// Container Runtime
//=========================================================================================

/// Pretends to run containers by writing the log and result files into the mount.
#[derive(Default)]
pub struct FakeRuntime {
    /// Points reported by successive GRADE runs; `1.0` once exhausted.
    scores: Mutex<VecDeque<f64>>,
    pub hang: AtomicBool,
    delay: Mutex<Duration>,
    containers: Mutex<HashMap<String, ContainerSpec>>,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    /// What each container found in its working directory, keyed by relative path.
    staged: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_scores(scores: &[f64]) -> Arc<Self> {
        let runtime = Self::default();
        runtime.scores.lock().unwrap().extend(scores.iter().copied());
        Arc::new(runtime)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn staged(&self) -> Vec<HashMap<String, String>> {
        self.staged.lock().unwrap().clone()
    }
}

fn read_tree(root: &Path, dir: &Path, into: &mut HashMap<String, String>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path: PathBuf = entry.unwrap().path();
        if path.is_dir() {
            read_tree(root, &path, into);
        } else {
            let relative = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            into.insert(relative, std::fs::read_to_string(&path).unwrap());
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, _image: &str) -> PortResult<()> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> PortResult<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake-{}", n);
        self.containers.lock().unwrap().insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start(&self, _container_id: &str) -> PortResult<()> {
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> PortResult<i64> {
        let spec = self
            .containers
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(container_id.to_string()))?;
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let dir = &spec.working_dir;
        let mut files = HashMap::new();
        read_tree(dir, dir, &mut files);
        self.staged.lock().unwrap().push(files);

        std::fs::write(dir.join("logs.txt"), format!("ran: {}\n", spec.command[2]))
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        if spec.labels.get("command").map(String::as_str) == Some("grade") {
            let points = self.scores.lock().unwrap().pop_front().unwrap_or(1.0);
            let results = serde_json::json!({
                "points": points,
                "hints": ["Well done"],
                "tests": ["t1"],
                "testScores": [points],
            });
            std::fs::write(dir.join("grade_results.json"), results.to_string())
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }
        Ok(0)
    }

    async fn remove(&self, container_id: &str) -> PortResult<()> {
        self.containers.lock().unwrap().remove(container_id);
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//=========================================================================================
// Metrics
//=========================================================================================

pub struct FixedLoad(pub f64);

#[async_trait]
impl SystemMetrics for FixedLoad {
    async fn cpu_usage(&self) -> Option<f64> {
        Some(self.0)
    }
}

//=========================================================================================
// Builders
//=========================================================================================

pub fn task(id: i64, slug: &str, max_attempts: u32) -> Task {
    Task {
        id,
        exercise_id: 1,
        slug: slug.to_string(),
        image: "python:3.12-slim".to_string(),
        run_command: Some("python main.py".to_string()),
        test_command: None,
        grade_command: Some("python -m grader".to_string()),
        time_limit: Duration::from_secs(5),
        max_attempts,
        attempt_window: None,
        max_points: 3.0,
        files: vec![TaskFile {
            path: "main.py".to_string(),
            content: "# write your solution here".to_string(),
            grading: false,
        }],
    }
}

pub fn open_window() -> ExerciseWindow {
    ExerciseWindow {
        start: Some(Utc::now() - chrono::Duration::days(1)),
        end: Some(Utc::now() + chrono::Duration::days(1)),
    }
}

pub fn request(user: &str, command: Command) -> SubmissionRequest {
    SubmissionRequest {
        user_id: user.to_string(),
        command,
        restricted: true,
        files: vec![SubmittedFile {
            path: "main.py".to_string(),
            content: "print('hello')".to_string(),
        }],
    }
}

pub fn start_pipeline(
    submissions_dir: &Path,
    store: Arc<FakeStore>,
    runtime: Arc<FakeRuntime>,
) -> Pipeline {
    Pipeline::start(
        settings(submissions_dir),
        store,
        runtime,
        Arc::new(FixedLoad(0.1)),
    )
}

pub fn settings(submissions_dir: &Path) -> PipelineSettings {
    PipelineSettings {
        submissions_dir: submissions_dir.to_path_buf(),
        admission: AdmissionSettings {
            max_concurrent: 2,
            cooldown: Duration::from_millis(10),
            idle_wait: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
            ..AdmissionSettings::default()
        },
        // Channel ids are read from the handle; keep the pushed copy out of event assertions.
        hub: HubSettings {
            id_push_delay: Duration::from_secs(3600),
            ..HubSettings::default()
        },
        lifecycle: LifecycleSettings {
            reset_drain_timeout: Duration::from_secs(5),
            reset_poll_interval: Duration::from_millis(10),
        },
        ..PipelineSettings::default()
    }
}
