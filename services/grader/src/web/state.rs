//! services/grader/src/web/state.rs
//!
//! What every handler and WebSocket session shares: the running submission pipeline.

use crate::pipeline::Pipeline;
use std::sync::Arc;

/// Cloned into each request by axum; the pipeline itself is shared, never copied.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}
