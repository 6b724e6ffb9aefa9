//! services/grader/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `SubmissionStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grading_core::domain::{
    Command, Evaluation, Exercise, ExerciseKind, ExerciseWindow, NewSubmission, Submission, Task,
    TaskFile,
};
use grading_core::ports::{PortError, PortResult, SubmissionStore};
use sqlx::{FromRow, PgPool};
use std::time::Duration;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `SubmissionStore` port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// An update that touched no row means the row was deleted underneath us.
fn updated(rows: u64, what: &str, id: i64) -> PortResult<()> {
    if rows == 0 {
        return Err(PortError::NotFound(format!("{} {} no longer exists", what, id)));
    }
    Ok(())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct ExerciseRecord {
    id: i64,
    course_slug: String,
    slug: String,
    kind: String,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
}
impl ExerciseRecord {
    fn to_domain(self) -> PortResult<Exercise> {
        let kind = match self.kind.as_str() {
            "assignment" => ExerciseKind::Assignment,
            "interactive" => ExerciseKind::Interactive,
            other => {
                return Err(PortError::Unexpected(format!(
                    "Exercise {} has unknown kind '{}'",
                    self.slug, other
                )))
            }
        };
        Ok(Exercise {
            id: self.id,
            course_slug: self.course_slug,
            slug: self.slug,
            kind,
            window: ExerciseWindow {
                start: self.start_at,
                end: self.end_at,
            },
        })
    }
}

#[derive(FromRow)]
struct TaskRecord {
    id: i64,
    exercise_id: i64,
    slug: String,
    image: String,
    run_command: Option<String>,
    test_command: Option<String>,
    grade_command: Option<String>,
    time_limit_secs: i32,
    max_attempts: i32,
    attempt_window_secs: Option<i64>,
    max_points: f64,
}
impl TaskRecord {
    fn to_domain(self, files: Vec<TaskFile>) -> Task {
        Task {
            id: self.id,
            exercise_id: self.exercise_id,
            slug: self.slug,
            image: self.image,
            run_command: self.run_command,
            test_command: self.test_command,
            grade_command: self.grade_command,
            time_limit: Duration::from_secs(self.time_limit_secs.max(1) as u64),
            max_attempts: self.max_attempts.max(0) as u32,
            attempt_window: self.attempt_window_secs.and_then(chrono::TimeDelta::try_seconds),
            max_points: self.max_points,
            files,
        }
    }
}

#[derive(FromRow)]
struct FileRecord {
    path: String,
    content: String,
    grading: bool,
}
impl FileRecord {
    fn to_domain(self) -> TaskFile {
        TaskFile {
            path: self.path,
            content: self.content,
            grading: self.grading,
        }
    }
}

#[derive(FromRow)]
struct EvaluationRecord {
    id: i64,
    task_id: i64,
    user_id: String,
    best_score: Option<f64>,
    remaining_attempts: i32,
}
impl EvaluationRecord {
    fn to_domain(self) -> Evaluation {
        Evaluation {
            id: self.id,
            task_id: self.task_id,
            user_id: self.user_id,
            best_score: self.best_score,
            remaining_attempts: self.remaining_attempts.max(0) as u32,
            next_attempt_at: None,
        }
    }
}

#[derive(FromRow)]
struct SubmissionRecord {
    id: i64,
    evaluation_id: i64,
    user_id: String,
    command: String,
    ordinal_num: i64,
    valid: bool,
    points: Option<f64>,
    logs: Option<String>,
    output: Option<String>,
    created_at: DateTime<Utc>,
}
impl SubmissionRecord {
    fn to_domain(self) -> PortResult<Submission> {
        let command: Command = self.command.parse().map_err(PortError::Unexpected)?;
        Ok(Submission {
            id: self.id,
            evaluation_id: self.evaluation_id,
            user_id: self.user_id,
            command,
            ordinal_num: self.ordinal_num,
            valid: self.valid,
            points: self.points,
            logs: self.logs,
            output: self.output,
            created_at: self.created_at,
        })
    }
}

const SUBMISSION_COLUMNS: &str =
    "id, evaluation_id, user_id, command, ordinal_num, valid, points, logs, output, created_at";

//=========================================================================================
// `SubmissionStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl SubmissionStore for PgStore {
    async fn find_exercise(&self, course_slug: &str, exercise_slug: &str) -> PortResult<Exercise> {
        let record = sqlx::query_as::<_, ExerciseRecord>(
            "SELECT e.id, c.slug AS course_slug, e.slug, e.kind, e.start_at, e.end_at \
             FROM exercises e JOIN courses c ON c.id = e.course_id \
             WHERE c.slug = $1 AND e.slug = $2",
        )
        .bind(course_slug)
        .bind(exercise_slug)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Exercise {}/{} not found", course_slug, exercise_slug))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn list_exercises(&self, course_slug: &str) -> PortResult<Vec<Exercise>> {
        let records = sqlx::query_as::<_, ExerciseRecord>(
            "SELECT e.id, c.slug AS course_slug, e.slug, e.kind, e.start_at, e.end_at \
             FROM exercises e JOIN courses c ON c.id = e.course_id \
             WHERE c.slug = $1 ORDER BY e.id ASC",
        )
        .bind(course_slug)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn reset_exercise(&self, exercise: &Exercise) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        // Submissions go with their evaluations (ON DELETE CASCADE).
        sqlx::query(
            "DELETE FROM evaluations \
             WHERE task_id IN (SELECT id FROM tasks WHERE exercise_id = $1)",
        )
        .bind(exercise.id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        sqlx::query("UPDATE exercises SET start_at = NULL, end_at = NULL WHERE id = $1")
            .bind(exercise.id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn update_exercise_window(&self, exercise: &Exercise) -> PortResult<()> {
        sqlx::query("UPDATE exercises SET start_at = $1, end_at = $2 WHERE id = $3")
            .bind(exercise.window.start)
            .bind(exercise.window.end)
            .bind(exercise.id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn find_task(
        &self,
        course_slug: &str,
        exercise_slug: &str,
        task_slug: Option<&str>,
    ) -> PortResult<Task> {
        let task_slug = task_slug.unwrap_or(exercise_slug);
        let record = sqlx::query_as::<_, TaskRecord>(
            "SELECT t.id, t.exercise_id, t.slug, t.image, t.run_command, t.test_command, \
                    t.grade_command, t.time_limit_secs, t.max_attempts, t.attempt_window_secs, \
                    t.max_points \
             FROM tasks t \
             JOIN exercises e ON e.id = t.exercise_id \
             JOIN courses c ON c.id = e.course_id \
             WHERE c.slug = $1 AND e.slug = $2 AND t.slug = $3",
        )
        .bind(course_slug)
        .bind(exercise_slug)
        .bind(task_slug)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!(
                "Task {}/{}/{} not found",
                course_slug, exercise_slug, task_slug
            )),
            _ => unexpected(e),
        })?;

        let files = sqlx::query_as::<_, FileRecord>(
            "SELECT path, content, grading FROM task_files WHERE task_id = $1 ORDER BY id ASC",
        )
        .bind(record.id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record.to_domain(files.into_iter().map(|f| f.to_domain()).collect()))
    }

    async fn global_files(&self, course_slug: &str) -> PortResult<Vec<TaskFile>> {
        let records = sqlx::query_as::<_, FileRecord>(
            "SELECT g.path, g.content, g.grading \
             FROM global_files g JOIN courses c ON c.id = g.course_id \
             WHERE c.slug = $1 ORDER BY g.id ASC",
        )
        .bind(course_slug)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn find_evaluation(&self, task_id: i64, user_id: &str) -> PortResult<Option<Evaluation>> {
        let record = sqlx::query_as::<_, EvaluationRecord>(
            "SELECT id, task_id, user_id, best_score, remaining_attempts \
             FROM evaluations WHERE task_id = $1 AND user_id = $2",
        )
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn create_evaluation(&self, task: &Task, user_id: &str) -> PortResult<Evaluation> {
        // A concurrent creator may have won the race; return whichever row exists.
        let record = sqlx::query_as::<_, EvaluationRecord>(
            "INSERT INTO evaluations (task_id, user_id, remaining_attempts) VALUES ($1, $2, $3) \
             ON CONFLICT (task_id, user_id) DO UPDATE SET user_id = EXCLUDED.user_id \
             RETURNING id, task_id, user_id, best_score, remaining_attempts",
        )
        .bind(task.id)
        .bind(user_id)
        .bind(task.max_attempts as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn update_evaluation(&self, evaluation: &Evaluation) -> PortResult<()> {
        let result = sqlx::query("UPDATE evaluations SET best_score = $1, remaining_attempts = $2 WHERE id = $3")
            .bind(evaluation.best_score)
            .bind(evaluation.remaining_attempts as i32)
            .bind(evaluation.id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        updated(result.rows_affected(), "Evaluation", evaluation.id)
    }

    async fn list_submissions(&self, evaluation_id: i64) -> PortResult<Vec<Submission>> {
        let query = format!(
            "SELECT {} FROM submissions WHERE evaluation_id = $1 ORDER BY created_at ASC, id ASC",
            SUBMISSION_COLUMNS
        );
        let records = sqlx::query_as::<_, SubmissionRecord>(&query)
            .bind(evaluation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn insert_submission(
        &self,
        evaluation_id: i64,
        submission: &NewSubmission,
    ) -> PortResult<Submission> {
        let query = format!(
            "INSERT INTO submissions (evaluation_id, user_id, command, ordinal_num, valid, created_at) \
             SELECT $1, $2, $3, COALESCE(MAX(ordinal_num), 0) + 1, $4, $5 \
             FROM submissions WHERE evaluation_id = $1 AND command = $3 \
             RETURNING {}",
            SUBMISSION_COLUMNS
        );
        let record = sqlx::query_as::<_, SubmissionRecord>(&query)
            .bind(evaluation_id)
            .bind(&submission.user_id)
            .bind(submission.command.as_str())
            .bind(submission.valid)
            .bind(submission.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;
        record.to_domain()
    }

    async fn update_submission(&self, submission: &Submission) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE submissions SET valid = $1, points = $2, logs = $3, output = $4 WHERE id = $5",
        )
        .bind(submission.valid)
        .bind(submission.points)
        .bind(&submission.logs)
        .bind(&submission.output)
        .bind(submission.id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        updated(result.rows_affected(), "Submission", submission.id)
    }
}
