use axum::{
    routing::{get, post},
    Router,
};

pub mod estimates;
pub mod jobs;
pub mod metrics;
pub mod system;

/// Router for all authenticated endpoints (mounted under `/api`).
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/analyze", post(jobs::analyze))
        .route("/analyze/batch", post(jobs::analyze_batch))
        .route("/batch", post(jobs::batch))
        .nest("/estimates", estimates::router())
        .nest("/jobs", jobs::router())
        .nest("/metrics", metrics::router())
}
