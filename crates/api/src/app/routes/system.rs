use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use estimator_infra::EstimationCore;

use crate::app::errors;
use crate::context::UserContext;

pub async fn health(Extension(core): Extension<Arc<EstimationCore>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "cache": core.cache().stats(),
        "jobs": core.jobs().stats(),
    }))
}

pub async fn whoami(Extension(user): Extension<UserContext>) -> impl IntoResponse {
    Json(serde_json::json!({ "user_id": user.user_id().to_string() }))
}

pub async fn not_found() -> axum::response::Response {
    errors::json_error(StatusCode::NOT_FOUND, "not_found", "Endpoint not found")
}
