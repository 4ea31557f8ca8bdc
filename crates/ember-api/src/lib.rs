//! ember-api — HTTP surface of the orchestrator.
//!
//! Thin axum handlers over [`Orchestrator`]. JSON answers use the
//! `{ success, data, error }` envelope; generate and pull stream as
//! server-sent events.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Orchestrator liveness |
//! | POST | `/api/v1/executor/start` | Begin bringing the executor up |
//! | POST | `/api/v1/executor/stop` | Begin tearing the executor down |
//! | GET | `/api/v1/executor/status` | Lifecycle snapshot |
//! | POST | `/api/v1/generate` | Stream generated output (SSE) |
//! | POST | `/api/v1/models/{name}/pull` | Stream download progress (SSE) |
//! | GET | `/api/v1/models` | Executor models plus catalog |
//! | GET | `/api/v1/models/{name}` | Whether a model is on the executor |
//! | DELETE | `/api/v1/models/{name}` | Remove a model from the executor |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use ember_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/executor/start", post(handlers::start_executor))
        .route("/executor/stop", post(handlers::stop_executor))
        .route("/executor/status", get(handlers::executor_status))
        .route("/generate", post(handlers::generate))
        .route("/models", get(handlers::list_models))
        .route(
            "/models/{name}",
            get(handlers::check_model).delete(handlers::delete_model),
        )
        .route("/models/{name}/pull", post(handlers::pull_model))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state))
}
