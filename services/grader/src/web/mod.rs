pub mod middleware;
pub mod rest;
pub mod state;
pub mod ws_handler;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use rest::*;
use state::AppState;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use middleware::require_identity;
pub use ws_handler::ws_handler;

/// Builds the complete router: the API behind caller identification, the public
/// health check and the Swagger UI.
pub fn router(app_state: Arc<AppState>) -> Router {
    let protected_routes = Router::new()
        .route(
            "/courses/{course}/exercises/{exercise}/submissions",
            post(submit_interactive_handler),
        )
        .route(
            "/courses/{course}/exercises/{exercise}/tasks/{task}/submissions",
            post(submit_task_handler),
        )
        .route("/courses/{course}/exercises/{exercise}/queue", get(queue_status_handler))
        .route("/courses/{course}/exercises/{exercise}/publish", post(publish_handler))
        .route("/courses/{course}/exercises/{exercise}/extend", post(extend_handler))
        .route("/courses/{course}/exercises/{exercise}/terminate", post(terminate_handler))
        .route("/courses/{course}/exercises/{exercise}/reset", post(reset_handler))
        .route("/courses/{course}/subscribe", get(ws_handler))
        .route("/courses/{course}/heartbeat/{channel_id}", post(heartbeat_handler))
        .route("/courses/{course}/active-users", get(active_users_handler))
        .layer(axum_middleware::from_fn(require_identity));

    let api_router = Router::new()
        .route("/health", get(health_handler))
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
