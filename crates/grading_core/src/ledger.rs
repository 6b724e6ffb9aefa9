//! crates/grading_core/src/ledger.rs
//!
//! Attempt accounting for graded submissions.
//!
//! Refills are a pure function of the submission history and the current time and are
//! recomputed on every read, so nothing here depends on a background timer surviving
//! a restart. Callers are expected to serialize `refresh` → `check` → `record_grade`
//! per (task, user).

use crate::domain::{Command, Evaluation, Exercise, ExerciseKind, Submission, SubmissionRequest, Task};
use chrono::{DateTime, Utc};

/// Why a submission was refused before any execution happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The request itself is not acceptable (unsupported command, unpublished exercise, ...).
    #[error("{0}")]
    Validation(String),
    /// The request is well-formed but the user is out of attempts or outside the window.
    #[error("{0}")]
    RateLimited(String),
}

/// Recomputes `remaining_attempts` and `next_attempt_at` from the graded history.
///
/// The reference point is the earliest valid GRADE submission created before `now`.
/// Every full `attempt_window` elapsed since then returns one attempt, capped at
/// `max_attempts`.
pub fn refresh(evaluation: &mut Evaluation, task: &Task, history: &[Submission], now: DateTime<Utc>) {
    let Some(window) = task.attempt_window else {
        return;
    };
    if window <= chrono::Duration::zero() {
        return;
    }

    let Some(reference) = history
        .iter()
        .filter(|s| s.command.is_graded() && s.valid && s.created_at < now)
        .map(|s| s.created_at)
        .min()
    else {
        return;
    };

    let elapsed = now - reference;
    let refills = (elapsed.num_milliseconds() / window.num_milliseconds()).max(0);
    let spent = i64::from(task.max_attempts.saturating_sub(evaluation.remaining_attempts));

    if spent <= refills {
        evaluation.remaining_attempts = task.max_attempts;
        evaluation.next_attempt_at = None;
    } else {
        // refills < spent <= max_attempts, so the cast cannot truncate
        evaluation.remaining_attempts += refills as u32;
        evaluation.next_attempt_at = Some(reference + window * (refills as i32 + 1));
    }
}

/// Cheap checks that need no evaluation state. Run before anything is queued or staged.
pub fn validate(
    exercise: &Exercise,
    task: &Task,
    request: &SubmissionRequest,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    if !task.supports(request.command) {
        return Err(Rejection::Validation(format!(
            "Submission rejected - task does not support {} command",
            request.command
        )));
    }

    if request.restricted && exercise.kind == ExerciseKind::Interactive {
        if !exercise.window.is_published() {
            return Err(Rejection::Validation(format!(
                "Submission rejected - {} has not been published",
                exercise.slug
            )));
        }
        if request.command.is_graded() && exercise.window.has_ended(now) {
            return Err(Rejection::Validation(format!(
                "Submission rejected - {} has been terminated",
                exercise.slug
            )));
        }
    }

    Ok(())
}

/// Full admission check against a freshly refreshed evaluation.
pub fn check(
    exercise: &Exercise,
    task: &Task,
    evaluation: &Evaluation,
    request: &SubmissionRequest,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    validate(exercise, task, request, now)?;

    if request.restricted && request.command == Command::Grade {
        if exercise.kind == ExerciseKind::Assignment && !exercise.window.is_active(now) {
            return Err(Rejection::RateLimited(format!(
                "Submission rejected - {} is not active",
                exercise.slug
            )));
        }
        if evaluation.remaining_attempts == 0 {
            return Err(Rejection::RateLimited(
                "Submission rejected - no remaining attempts".to_string(),
            ));
        }
    }

    Ok(())
}

/// Applies a scored GRADE result.
pub fn record_grade(evaluation: &mut Evaluation, score: f64) {
    evaluation.remaining_attempts = evaluation.remaining_attempts.saturating_sub(1);
    evaluation.best_score = Some(evaluation.best_score.unwrap_or(0.0).max(score));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExerciseWindow;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn task(max_attempts: u32, window: Option<Duration>) -> Task {
        Task {
            id: 1,
            exercise_id: 1,
            slug: "task-1".into(),
            image: "python:3.12".into(),
            run_command: Some("python main.py".into()),
            test_command: None,
            grade_command: Some("python -m grading".into()),
            time_limit: std::time::Duration::from_secs(30),
            max_attempts,
            attempt_window: window,
            max_points: 10.0,
            files: vec![],
        }
    }

    fn exercise(kind: ExerciseKind, window: ExerciseWindow) -> Exercise {
        Exercise {
            id: 1,
            course_slug: "info1".into(),
            slug: "ex-1".into(),
            kind,
            window,
        }
    }

    fn open_window() -> ExerciseWindow {
        ExerciseWindow {
            start: Some(now() - Duration::days(1)),
            end: Some(now() + Duration::days(1)),
        }
    }

    fn evaluation(remaining: u32) -> Evaluation {
        Evaluation {
            id: 1,
            task_id: 1,
            user_id: "alice".into(),
            best_score: None,
            remaining_attempts: remaining,
            next_attempt_at: None,
        }
    }

    fn graded(at: DateTime<Utc>, valid: bool) -> Submission {
        Submission {
            id: 1,
            evaluation_id: 1,
            user_id: "alice".into(),
            command: Command::Grade,
            ordinal_num: 1,
            valid,
            points: valid.then_some(1.0),
            logs: None,
            output: None,
            created_at: at,
        }
    }

    fn request(command: Command) -> SubmissionRequest {
        SubmissionRequest {
            user_id: "alice".into(),
            command,
            restricted: true,
            files: vec![],
        }
    }

    #[test]
    fn refill_adds_elapsed_windows() {
        let task = task(5, Some(Duration::hours(1)));
        let mut eval = evaluation(1);
        let first = now() - Duration::minutes(150);
        let history = vec![graded(first, true), graded(now() - Duration::minutes(10), true)];

        refresh(&mut eval, &task, &history, now());

        assert_eq!(eval.remaining_attempts, 3);
        assert_eq!(eval.next_attempt_at, Some(first + Duration::hours(3)));
    }

    #[test]
    fn refill_is_capped_at_max_attempts() {
        let task = task(3, Some(Duration::hours(1)));
        for before in 0..=3 {
            for periods in 0..6i64 {
                let mut eval = evaluation(before);
                let history = vec![graded(now() - Duration::hours(periods) - Duration::minutes(1), true)];
                refresh(&mut eval, &task, &history, now());
                let expected = (before + periods as u32).min(3);
                assert_eq!(eval.remaining_attempts, expected, "before={before} periods={periods}");
            }
        }
    }

    #[test]
    fn refill_ignores_invalid_and_ungraded_history() {
        let task = task(3, Some(Duration::hours(1)));
        let mut eval = evaluation(0);
        let mut run = graded(now() - Duration::hours(5), true);
        run.command = Command::Run;
        let history = vec![run, graded(now() - Duration::hours(5), false)];

        refresh(&mut eval, &task, &history, now());

        assert_eq!(eval.remaining_attempts, 0);
        assert_eq!(eval.next_attempt_at, None);
    }

    #[test]
    fn no_window_means_no_refill() {
        let task = task(3, None);
        let mut eval = evaluation(0);
        refresh(&mut eval, &task, &[graded(now() - Duration::days(30), true)], now());
        assert_eq!(eval.remaining_attempts, 0);
    }

    #[test]
    fn best_score_never_decreases() {
        let mut eval = evaluation(5);
        let mut last_best = 0.0;
        for score in [3.0, 7.5, 2.0, 7.5, 9.0, 0.0] {
            record_grade(&mut eval, score);
            let best = eval.best_score.unwrap();
            assert!(best >= last_best);
            last_best = best;
        }
        assert_eq!(eval.best_score, Some(9.0));
        assert_eq!(eval.remaining_attempts, 0);
    }

    #[test]
    fn attempts_never_go_negative() {
        let mut eval = evaluation(0);
        record_grade(&mut eval, 1.0);
        assert_eq!(eval.remaining_attempts, 0);
    }

    #[test]
    fn three_grades_exhaust_three_attempts() {
        let task = task(3, None);
        let exercise = exercise(ExerciseKind::Assignment, open_window());
        let mut eval = evaluation(task.max_attempts);

        for _ in 0..3 {
            check(&exercise, &task, &eval, &request(Command::Grade), now()).unwrap();
            record_grade(&mut eval, 1.0);
        }

        let rejection = check(&exercise, &task, &eval, &request(Command::Grade), now()).unwrap_err();
        assert_eq!(
            rejection,
            Rejection::RateLimited("Submission rejected - no remaining attempts".into())
        );
        // RUN never consumes attempts and is still allowed
        check(&exercise, &task, &eval, &request(Command::Run), now()).unwrap();
    }

    #[test]
    fn unrestricted_grade_bypasses_limits() {
        let task = task(1, None);
        let exercise = exercise(ExerciseKind::Assignment, ExerciseWindow::default());
        let mut req = request(Command::Grade);
        req.restricted = false;
        check(&exercise, &task, &evaluation(0), &req, now()).unwrap();
    }

    #[test]
    fn unsupported_command_is_a_validation_error() {
        let task = task(3, None);
        let exercise = exercise(ExerciseKind::Assignment, open_window());
        let err = validate(&exercise, &task, &request(Command::Test), now()).unwrap_err();
        assert!(matches!(err, Rejection::Validation(msg) if msg.contains("test")));
    }

    #[test]
    fn inactive_assignment_rejects_grade_only() {
        let task = task(3, None);
        let closed = ExerciseWindow {
            start: Some(now() - Duration::days(2)),
            end: Some(now() - Duration::days(1)),
        };
        let exercise = exercise(ExerciseKind::Assignment, closed);
        let eval = evaluation(3);

        let err = check(&exercise, &task, &eval, &request(Command::Grade), now()).unwrap_err();
        assert!(matches!(err, Rejection::RateLimited(_)));
        check(&exercise, &task, &eval, &request(Command::Run), now()).unwrap();
    }

    #[test]
    fn interactive_exercise_must_be_published() {
        let task = task(3, None);
        let unpublished = exercise(ExerciseKind::Interactive, ExerciseWindow::default());
        let err = validate(&unpublished, &task, &request(Command::Run), now()).unwrap_err();
        assert!(matches!(err, Rejection::Validation(msg) if msg.contains("not been published")));

        let ended = exercise(
            ExerciseKind::Interactive,
            ExerciseWindow {
                start: Some(now() - Duration::minutes(10)),
                end: Some(now() - Duration::minutes(1)),
            },
        );
        let err = validate(&ended, &task, &request(Command::Grade), now()).unwrap_err();
        assert!(matches!(err, Rejection::Validation(msg) if msg.contains("terminated")));
        validate(&ended, &task, &request(Command::Run), now()).unwrap();
    }
}
