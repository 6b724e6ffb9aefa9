//! crates/grading_core/src/domain.rs
//!
//! Defines the pure, core data structures of the grading pipeline.
//! These structs are independent of any database, container runtime or wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

//=========================================================================================
// Commands
//=========================================================================================

/// The kind of execution a submission asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Run,
    Test,
    Grade,
}

impl Command {
    /// Only GRADE submissions are scored and consume attempts.
    pub fn is_graded(self) -> bool {
        matches!(self, Command::Grade)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Run => "run",
            Command::Test => "test",
            Command::Grade => "grade",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "run" => Ok(Command::Run),
            "test" => Ok(Command::Test),
            "grade" => Ok(Command::Grade),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

//=========================================================================================
// Exercises and Tasks
//=========================================================================================

/// Whether an exercise is a regular assignment or a live classroom activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseKind {
    /// Submissions execute inline; the caller waits for the result.
    Assignment,
    /// Lecturer-triggered live exercise; submissions go through the admission queue.
    Interactive,
}

/// The time span during which graded submissions are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExerciseWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ExerciseWindow {
    pub fn is_published(&self) -> bool {
        self.start.is_some()
    }

    /// Active means started and not yet ended. An open end never expires.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= now && now < end,
            (Some(start), None) => start <= now,
            _ => false,
        }
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end.map(|end| end <= now).unwrap_or(false)
    }
}

/// An assignment or interactive exercise inside a course.
#[derive(Debug, Clone)]
pub struct Exercise {
    pub id: i64,
    pub course_slug: String,
    pub slug: String,
    pub kind: ExerciseKind,
    pub window: ExerciseWindow,
}

/// A file that is copied into the staging directory before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFile {
    /// Path relative to the staging directory.
    pub path: String,
    pub content: String,
    /// Grading files are only visible to GRADE executions.
    pub grading: bool,
}

impl TaskFile {
    pub fn applies_to(&self, command: Command) -> bool {
        !self.grading || command.is_graded()
    }
}

/// The execution configuration of a gradable task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub exercise_id: i64,
    pub slug: String,
    /// Container image the sandbox is created from.
    pub image: String,
    pub run_command: Option<String>,
    pub test_command: Option<String>,
    pub grade_command: Option<String>,
    pub time_limit: Duration,
    pub max_attempts: u32,
    /// Interval after which a spent attempt is returned.
    pub attempt_window: Option<chrono::Duration>,
    pub max_points: f64,
    pub files: Vec<TaskFile>,
}

impl Task {
    pub fn command_line(&self, command: Command) -> Option<&str> {
        match command {
            Command::Run => self.run_command.as_deref(),
            Command::Test => self.test_command.as_deref(),
            Command::Grade => self.grade_command.as_deref(),
        }
    }

    pub fn supports(&self, command: Command) -> bool {
        self.command_line(command).is_some()
    }
}

//=========================================================================================
// Evaluations and Submissions
//=========================================================================================

/// Per (task, user) grading state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub id: i64,
    pub task_id: i64,
    pub user_id: String,
    pub best_score: Option<f64>,
    pub remaining_attempts: u32,
    /// Derived on read; never persisted.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// A single execution request and, once it ran, its result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub id: i64,
    pub evaluation_id: i64,
    pub user_id: String,
    pub command: Command,
    pub ordinal_num: i64,
    pub valid: bool,
    pub points: Option<f64>,
    #[serde(skip_serializing)]
    pub logs: Option<String>,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The fields the store needs to create a submission.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub user_id: String,
    pub command: Command,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
}

/// A file a student sent along with a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedFile {
    pub path: String,
    pub content: String,
}

/// What a caller asks the pipeline to execute.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub user_id: String,
    pub command: Command,
    /// Regular users are always restricted; staff may bypass attempt and window checks.
    pub restricted: bool,
    pub files: Vec<SubmittedFile>,
}

//=========================================================================================
// Execution Results
//=========================================================================================

/// The structured result file a grading run writes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GradeResults {
    pub points: Option<f64>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default, rename = "testScores")]
    pub test_scores: Vec<f64>,
}

/// Everything captured from one sandbox run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub logs: Option<String>,
    pub output: Option<String>,
    pub results: Option<GradeResults>,
}

impl ExecutionOutcome {
    /// An outcome for a run that never produced results.
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            logs: None,
            output: Some(output.into()),
            results: None,
        }
    }

    pub fn points(&self) -> Option<f64> {
        self.results.as_ref().and_then(|r| r.points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn grading_files_only_apply_to_grade() {
        let file = TaskFile {
            path: "private/test.py".into(),
            content: String::new(),
            grading: true,
        };
        assert!(file.applies_to(Command::Grade));
        assert!(!file.applies_to(Command::Run));
        assert!(!file.applies_to(Command::Test));
    }

    #[test]
    fn window_activity() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let window = ExerciseWindow {
            start: Some(start),
            end: Some(end),
        };
        assert!(!window.is_active(start - chrono::Duration::seconds(1)));
        assert!(window.is_active(start));
        assert!(!window.is_active(end));
        assert!(window.has_ended(end));
        assert!(!ExerciseWindow::default().is_active(start));
    }

    #[test]
    fn result_file_uses_camel_case_scores() {
        let parsed: GradeResults = serde_json::from_str(
            r#"{"points": 2.5, "hints": ["check the loop"], "tests": ["t1"], "testScores": [2.5]}"#,
        )
        .unwrap();
        assert_eq!(parsed.points, Some(2.5));
        assert_eq!(parsed.hints, vec!["check the loop".to_string()]);
        assert_eq!(parsed.test_scores, vec![2.5]);

        let empty: GradeResults = serde_json::from_str(r#"{"points": null}"#).unwrap();
        assert_eq!(empty, GradeResults::default());
    }

    #[test]
    fn command_parsing_is_case_insensitive() {
        assert_eq!("GRADE".parse::<Command>().unwrap(), Command::Grade);
        assert!("compile".parse::<Command>().is_err());
    }
}
