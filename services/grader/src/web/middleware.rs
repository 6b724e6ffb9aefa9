//! services/grader/src/web/middleware.rs
//!
//! Caller identification for protected routes.
//!
//! Authentication happens upstream; the gateway forwards the authenticated user in
//! `x-user-id` and their course roles in `x-user-roles`.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};

const USER_HEADER: &str = "x-user-id";
const ROLES_HEADER: &str = "x-user-roles";
const PRIVILEGED_ROLES: [&str; 2] = ["assistant", "supervisor"];

/// The identity a request was made with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// Staff may bypass attempt limits and drive the exercise lifecycle.
    pub privileged: bool,
}

impl Caller {
    fn from_headers(headers: &axum::http::HeaderMap) -> Option<Self> {
        let user_id = headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())?
            .to_string();
        let privileged = headers
            .get(ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|roles| {
                roles
                    .split(',')
                    .any(|role| PRIVILEGED_ROLES.contains(&role.trim().to_ascii_lowercase().as_str()))
            })
            .unwrap_or(false);
        Some(Self { user_id, privileged })
    }
}

/// Middleware that extracts the caller from the gateway headers.
///
/// If present, inserts a [`Caller`] into request extensions for handlers to use.
/// If missing, returns 401 Unauthorized.
pub async fn require_identity(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let caller = Caller::from_headers(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
