//! HTTP surface of the sandbox backend.

pub mod error;
pub mod health;
pub mod run;

use axum::routing::{any, get};
use axum::Router;

use crate::state::AppState;

/// GET /
async fn index() -> &'static str {
    "Hi from the playground sandbox backend.\n"
}

/// Builds the router. `/run` is registered for every method so the
/// handler can answer non-POSTs with a 400 rather than a 405.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/run", any(run::run))
        .route("/health", get(health::healthz))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}
