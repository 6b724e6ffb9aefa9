//! services/grader/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI document.

use crate::pipeline::submissions::SubmitError;
use crate::pipeline::SubmitOutcome;
use crate::web::{middleware::Caller, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use grading_core::domain::{Command, Exercise, Submission, SubmissionRequest, SubmittedFile};
use grading_core::ledger::Rejection;
use grading_core::ports::PortError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        submit_interactive_handler,
        submit_task_handler,
        queue_status_handler,
        publish_handler,
        extend_handler,
        terminate_handler,
        reset_handler,
        heartbeat_handler,
        active_users_handler,
        health_handler,
    ),
    components(
        schemas(
            SubmissionBody,
            FileBody,
            SubmissionResponse,
            SubmissionView,
            QueueStatusResponse,
            DurationBody,
            ExerciseWindowResponse,
            ActiveUsersResponse,
            ErrorResponse
        )
    ),
    tags(
        (name = "Grader API", description = "Submission execution, live exercises and classroom presence.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

fn reject(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Maps pipeline failures onto HTTP statuses. Infrastructure details stay in the log.
fn error_response(e: SubmitError) -> (StatusCode, Json<ErrorResponse>) {
    match e {
        SubmitError::Rejected(Rejection::Validation(reason)) => reject(StatusCode::BAD_REQUEST, reason),
        SubmitError::Rejected(Rejection::RateLimited(reason)) => reject(StatusCode::FORBIDDEN, reason),
        SubmitError::Port(PortError::NotFound(what)) => reject(StatusCode::NOT_FOUND, what),
        SubmitError::Port(PortError::Unauthorized) => reject(StatusCode::FORBIDDEN, "Unauthorized"),
        SubmitError::Port(e) => {
            error!(error = %e, "Request failed.");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
        SubmitError::Unrecorded { submission_id, source } => {
            error!(submission = submission_id, error = %source, "Submission result was lost.");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn require_staff(caller: &Caller) -> ApiResult<()> {
    if caller.privileged {
        Ok(())
    } else {
        Err(reject(StatusCode::FORBIDDEN, "Only course staff may do this"))
    }
}

/// A file sent along with a submission.
#[derive(Deserialize, ToSchema)]
pub struct FileBody {
    /// Path relative to the task root.
    path: String,
    content: String,
}

/// The payload of a submission request.
#[derive(Deserialize, ToSchema)]
pub struct SubmissionBody {
    /// One of `run`, `test` or `grade`.
    command: String,
    #[serde(default)]
    files: Vec<FileBody>,
    /// Staff may send `false` to bypass attempt and window limits.
    #[serde(default)]
    restricted: Option<bool>,
}

impl SubmissionBody {
    fn into_request(self, caller: &Caller) -> ApiResult<SubmissionRequest> {
        let command: Command = self
            .command
            .parse()
            .map_err(|e: String| reject(StatusCode::BAD_REQUEST, e))?;
        Ok(SubmissionRequest {
            user_id: caller.user_id.clone(),
            command,
            restricted: !caller.privileged || self.restricted.unwrap_or(true),
            files: self
                .files
                .into_iter()
                .map(|f| SubmittedFile {
                    path: f.path,
                    content: f.content,
                })
                .collect(),
        })
    }
}

#[derive(Serialize, ToSchema)]
pub struct SubmissionView {
    id: i64,
    command: String,
    ordinal_num: i64,
    valid: bool,
    points: Option<f64>,
    output: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<Submission> for SubmissionView {
    fn from(s: Submission) -> Self {
        Self {
            id: s.id,
            command: s.command.to_string(),
            ordinal_num: s.ordinal_num,
            valid: s.valid,
            points: s.points,
            output: s.output,
            created_at: s.created_at,
        }
    }
}

/// `completed` carries the executed submission; `queued` has none yet.
#[derive(Serialize, ToSchema)]
pub struct SubmissionResponse {
    status: String,
    submission: Option<SubmissionView>,
}

fn submission_response(outcome: SubmitOutcome) -> (StatusCode, Json<SubmissionResponse>) {
    match outcome {
        SubmitOutcome::Completed(submission) => (
            StatusCode::OK,
            Json(SubmissionResponse {
                status: "completed".to_string(),
                submission: Some(submission.into()),
            }),
        ),
        SubmitOutcome::Queued => (
            StatusCode::ACCEPTED,
            Json(SubmissionResponse {
                status: "queued".to_string(),
                submission: None,
            }),
        ),
    }
}

#[derive(Serialize, ToSchema)]
pub struct QueueStatusResponse {
    /// Any submission for the exercise still waiting to be dispatched.
    waiting: bool,
    user_waiting: bool,
    user_running: bool,
    fully_processed: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct DurationBody {
    /// Seconds; must be positive.
    duration: i64,
}

#[derive(Serialize, ToSchema)]
pub struct ExerciseWindowResponse {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl From<Exercise> for ExerciseWindowResponse {
    fn from(e: Exercise) -> Self {
        Self {
            start: e.window.start,
            end: e.window.end,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ActiveUsersResponse {
    count: usize,
}

//=========================================================================================
// Submission Handlers
//=========================================================================================

/// Submit to an interactive exercise.
///
/// Interactive submissions are queued and executed as capacity allows.
#[utoipa::path(
    post,
    path = "/courses/{course}/exercises/{exercise}/submissions",
    request_body = SubmissionBody,
    responses(
        (status = 200, description = "Executed inline", body = SubmissionResponse),
        (status = 202, description = "Queued for execution", body = SubmissionResponse),
        (status = 400, description = "Validation failure", body = ErrorResponse),
        (status = 403, description = "Out of attempts or outside the exercise window", body = ErrorResponse),
        (status = 404, description = "Unknown exercise", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug"),
        ("x-user-id" = String, Header, description = "The authenticated user.")
    )
)]
pub async fn submit_interactive_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise)): Path<(String, String)>,
    Json(body): Json<SubmissionBody>,
) -> ApiResult<impl IntoResponse> {
    let request = body.into_request(&caller)?;
    let outcome = app_state
        .pipeline
        .submit(&course, &exercise, None, request)
        .await
        .map_err(error_response)?;
    Ok(submission_response(outcome))
}

/// Submit to a task of an assignment.
///
/// The request returns once the execution has finished.
#[utoipa::path(
    post,
    path = "/courses/{course}/exercises/{exercise}/tasks/{task}/submissions",
    request_body = SubmissionBody,
    responses(
        (status = 200, description = "Executed", body = SubmissionResponse),
        (status = 400, description = "Validation failure", body = ErrorResponse),
        (status = 403, description = "Out of attempts or outside the assignment window", body = ErrorResponse),
        (status = 404, description = "Unknown task", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug"),
        ("task" = String, Path, description = "Task slug"),
        ("x-user-id" = String, Header, description = "The authenticated user.")
    )
)]
pub async fn submit_task_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise, task)): Path<(String, String, String)>,
    Json(body): Json<SubmissionBody>,
) -> ApiResult<impl IntoResponse> {
    let request = body.into_request(&caller)?;
    let outcome = app_state
        .pipeline
        .submit(&course, &exercise, Some(&task), request)
        .await
        .map_err(error_response)?;
    Ok(submission_response(outcome))
}

/// Report whether submissions for an exercise are still pending.
#[utoipa::path(
    get,
    path = "/courses/{course}/exercises/{exercise}/queue",
    responses(
        (status = 200, description = "Queue status", body = QueueStatusResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug")
    )
)]
pub async fn queue_status_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise)): Path<(String, String)>,
) -> Json<QueueStatusResponse> {
    let queue = app_state.pipeline.queue();
    Json(QueueStatusResponse {
        waiting: queue.has_waiting_submissions(&course, &exercise),
        user_waiting: queue.is_waiting(&course, &exercise, &caller.user_id),
        user_running: queue.is_running(&course, &exercise, &caller.user_id),
        fully_processed: queue.is_fully_processed(&course, &exercise),
    })
}

//=========================================================================================
// Lifecycle Handlers
//=========================================================================================

/// Publish an interactive exercise for `duration` seconds.
#[utoipa::path(
    post,
    path = "/courses/{course}/exercises/{exercise}/publish",
    request_body = DurationBody,
    responses(
        (status = 200, description = "Published", body = ExerciseWindowResponse),
        (status = 400, description = "Invalid duration or already published", body = ErrorResponse),
        (status = 403, description = "Caller is not course staff", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug")
    )
)]
pub async fn publish_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise)): Path<(String, String)>,
    Json(body): Json<DurationBody>,
) -> ApiResult<Json<ExerciseWindowResponse>> {
    require_staff(&caller)?;
    let exercise = app_state
        .pipeline
        .lifecycle()
        .publish(&course, &exercise, body.duration)
        .await
        .map_err(error_response)?;
    Ok(Json(exercise.into()))
}

/// Extend a running interactive exercise by `duration` seconds.
#[utoipa::path(
    post,
    path = "/courses/{course}/exercises/{exercise}/extend",
    request_body = DurationBody,
    responses(
        (status = 200, description = "Extended", body = ExerciseWindowResponse),
        (status = 400, description = "Invalid duration, not published or already over", body = ErrorResponse),
        (status = 403, description = "Caller is not course staff", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug")
    )
)]
pub async fn extend_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise)): Path<(String, String)>,
    Json(body): Json<DurationBody>,
) -> ApiResult<Json<ExerciseWindowResponse>> {
    require_staff(&caller)?;
    let exercise = app_state
        .pipeline
        .lifecycle()
        .extend(&course, &exercise, body.duration)
        .await
        .map_err(error_response)?;
    Ok(Json(exercise.into()))
}

/// End a running interactive exercise now.
#[utoipa::path(
    post,
    path = "/courses/{course}/exercises/{exercise}/terminate",
    responses(
        (status = 200, description = "Terminated", body = ExerciseWindowResponse),
        (status = 400, description = "Not published or already over", body = ErrorResponse),
        (status = 403, description = "Caller is not course staff", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug")
    )
)]
pub async fn terminate_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise)): Path<(String, String)>,
) -> ApiResult<Json<ExerciseWindowResponse>> {
    require_staff(&caller)?;
    let exercise = app_state
        .pipeline
        .lifecycle()
        .terminate(&course, &exercise)
        .await
        .map_err(error_response)?;
    Ok(Json(exercise.into()))
}

/// Unpublish an interactive exercise and delete all of its submissions.
///
/// Waiting submissions are dropped; running ones get a bounded time to finish first.
#[utoipa::path(
    post,
    path = "/courses/{course}/exercises/{exercise}/reset",
    responses(
        (status = 200, description = "Reset; the window is empty again", body = ExerciseWindowResponse),
        (status = 400, description = "Not an interactive exercise", body = ErrorResponse),
        (status = 403, description = "Caller is not course staff", body = ErrorResponse),
        (status = 404, description = "Unknown exercise", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("exercise" = String, Path, description = "Exercise slug")
    )
)]
pub async fn reset_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((course, exercise)): Path<(String, String)>,
) -> ApiResult<Json<ExerciseWindowResponse>> {
    require_staff(&caller)?;
    let exercise = app_state
        .pipeline
        .lifecycle()
        .reset(&course, &exercise)
        .await
        .map_err(error_response)?;
    Ok(Json(exercise.into()))
}

//=========================================================================================
// Presence Handlers
//=========================================================================================

/// Keep a push channel alive.
#[utoipa::path(
    post,
    path = "/courses/{course}/heartbeat/{channel_id}",
    responses(
        (status = 204, description = "Heartbeat recorded"),
        (status = 404, description = "Unknown or expired channel", body = ErrorResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug"),
        ("channel_id" = String, Path, description = "Id received on the channel after connecting")
    )
)]
pub async fn heartbeat_handler(
    State(app_state): State<Arc<AppState>>,
    Path((course, channel_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if app_state.pipeline.heartbeat(&course, &channel_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(reject(StatusCode::NOT_FOUND, "Channel not found"))
    }
}

/// Count the distinct users active on a course in the last five minutes.
#[utoipa::path(
    get,
    path = "/courses/{course}/active-users",
    responses(
        (status = 200, description = "Recently active users", body = ActiveUsersResponse)
    ),
    params(
        ("course" = String, Path, description = "Course slug")
    )
)]
pub async fn active_users_handler(
    State(app_state): State<Arc<AppState>>,
    Path(course): Path<String>,
) -> Json<ActiveUsersResponse> {
    let count = app_state.pipeline.recently_active_count(&course).await;
    Json(ActiveUsersResponse { count })
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up"))
)]
pub async fn health_handler() -> &'static str {
    "ok"
}
