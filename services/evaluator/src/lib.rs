//! Classification evaluation service.
//!
//! Runs a labeled dataset through a bulk inference job and records how well the
//! model's answers match the ground truth. Every step is a memoized stage, so a
//! run survives restarts and day-long batch jobs.

pub mod config;
pub mod connector;
pub mod connector_http;
pub mod loader;
pub mod pipeline;
pub mod poller;
pub mod provider_openai;
pub mod recorder;
pub mod registry;
pub mod routes_evaluations;
pub mod runner;
pub mod state;
pub mod store_pg;
pub mod submitter;
pub mod trace_sink;
pub mod types;
pub mod types_runs;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::state::SharedState;

pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(routes_evaluations::health))
        .route("/evaluations", post(routes_evaluations::post_evaluation))
        .route("/evaluations/:id", get(routes_evaluations::get_evaluation))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
