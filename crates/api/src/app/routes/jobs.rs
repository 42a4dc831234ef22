use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::info;

use estimator_infra::jobs::JobId;
use estimator_infra::tasks::{self, AnalyzeImagesArgs, ProcessImageArgs};
use estimator_infra::EstimationCore;

use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new().route("/:id", get(get_job).delete(cancel_job))
}

fn parse_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

fn accepted(job_id: JobId) -> axum::response::Response {
    (StatusCode::ACCEPTED, Json(dto::JobAccepted::new(job_id))).into_response()
}

pub async fn analyze(
    Extension(core): Extension<Arc<EstimationCore>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::AnalyzeRequest>,
) -> axum::response::Response {
    if body.image_path.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "Field 'image_path' is required");
    }
    if let Err(e) = core.estimates().fetch(body.estimate_id) {
        return errors::repository_error_to_response(e);
    }

    let args = ProcessImageArgs {
        image_path: body.image_path,
        estimate_id: body.estimate_id,
    };
    let args = match serde_json::to_value(&args) {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialize_error", e.to_string()),
    };

    match core.jobs().submit(tasks::PROCESS_IMAGE, args) {
        Ok(job_id) => {
            info!(job_id = %job_id, user_id = %user.user_id(), "image analysis queued");
            accepted(job_id)
        }
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn analyze_batch(
    Extension(core): Extension<Arc<EstimationCore>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::AnalyzeBatchRequest>,
) -> axum::response::Response {
    if body.image_paths.is_empty() || body.image_paths.iter().any(|p| p.trim().is_empty()) {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Field 'image_paths' must list at least one image path",
        );
    }

    let images = body.image_paths.len();
    let args = AnalyzeImagesArgs {
        image_paths: body.image_paths,
    };
    let args = match serde_json::to_value(&args) {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialize_error", e.to_string()),
    };

    match core.jobs().submit(tasks::ANALYZE_IMAGES, args) {
        Ok(job_id) => {
            info!(job_id = %job_id, user_id = %user.user_id(), images, "batch image analysis queued");
            accepted(job_id)
        }
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn batch(
    Extension(core): Extension<Arc<EstimationCore>>,
    Json(body): Json<dto::BatchRequest>,
) -> axum::response::Response {
    match core
        .jobs()
        .submit(tasks::BATCH_PROCESS, serde_json::json!({ "items": body.items }))
    {
        Ok(job_id) => accepted(job_id),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(core): Extension<Arc<EstimationCore>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match core.jobs().status(id) {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(core): Extension<Arc<EstimationCore>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match core.jobs().cancel(id) {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(e) => errors::cancel_error_to_response(e),
    }
}
