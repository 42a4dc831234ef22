use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use estimator_infra::EstimationCore;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_operations))
        .route("/:operation", get(operation_statistics))
}

pub async fn list_operations(Extension(core): Extension<Arc<EstimationCore>>) -> impl IntoResponse {
    Json(serde_json::json!({ "operations": core.perf().operations() }))
}

/// Timing statistics for one operation; `{}` when it was never recorded.
pub async fn operation_statistics(
    Extension(core): Extension<Arc<EstimationCore>>,
    Path(operation): Path<String>,
) -> axum::response::Response {
    match core.perf().statistics(&operation) {
        Some(stats) => Json(stats).into_response(),
        None => Json(serde_json::json!({})).into_response(),
    }
}
