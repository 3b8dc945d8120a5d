mod health;
mod verify;

use std::sync::Arc;

use axum::{routing::{get, post}, Router};

use crate::gate::Gate;

pub use health::health;
pub use verify::verify;

/// All routes served by the worker.
pub fn router(gate: Arc<Gate>) -> Router {
  Router::new()
    .route("/api/verify", post(verify))
    .route("/api/health", get(health))
    .with_state(gate)
}
