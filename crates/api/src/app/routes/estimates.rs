use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use estimator_core::{Estimate, EstimateId, EstimateInput, EstimateUpdate};
use estimator_infra::cache::KeyArgs;
use estimator_infra::tasks::{self, ESTIMATE_CACHE_PATTERN};
use estimator_infra::EstimationCore;

use crate::app::{dto, errors};
use crate::context::UserContext;

/// Cache namespace for single-estimate reads.
pub const ESTIMATE_NAMESPACE: &str = "estimate";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_estimates).post(create_estimate))
        .route("/:id", get(get_estimate).patch(update_estimate))
        .route("/:id/report", post(request_report))
}

fn parse_id(id: &str) -> Result<EstimateId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid estimate id"))
}

pub async fn list_estimates(
    Extension(core): Extension<Arc<EstimationCore>>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let page = query.page.unwrap_or(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE);
    if page == 0 || per_page == 0 || per_page > MAX_PER_PAGE {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_page",
            format!("page must be at least 1 and per_page between 1 and {MAX_PER_PAGE}"),
        );
    }

    match core.estimates().page(page, per_page) {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::repository_error_to_response(e),
    }
}

pub async fn create_estimate(
    Extension(core): Extension<Arc<EstimationCore>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<EstimateInput>,
) -> axum::response::Response {
    let estimate = match Estimate::from_input(&body) {
        Ok(e) => e,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match core.estimates().insert(estimate) {
        Ok(estimate) => {
            info!(estimate_id = %estimate.id, user_id = %user.user_id(), "estimate created");
            (StatusCode::CREATED, Json(estimate)).into_response()
        }
        Err(e) => errors::repository_error_to_response(e),
    }
}

pub async fn get_estimate(
    Extension(core): Extension<Arc<EstimationCore>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    let _timing = core.perf().track_time("get_estimate");
    let estimates = core.estimates().clone();
    let cached = core
        .cache()
        .cache_around(
            ESTIMATE_NAMESPACE,
            core.settings().cache_default_ttl,
            &KeyArgs::new().arg(id),
            || async move { estimates.fetch(id) },
        )
        .await;

    match cached {
        Ok(estimate) => Json::<Estimate>(estimate).into_response(),
        Err(e) => errors::compute_error_to_response(e),
    }
}

pub async fn update_estimate(
    Extension(core): Extension<Arc<EstimationCore>>,
    Path(id): Path<String>,
    body: Result<Json<EstimateUpdate>, JsonRejection>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    let Json(update) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };
    let patch = match update.validate() {
        Ok(patch) => patch,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match core.estimates().update(id, &patch) {
        Ok(estimate) => {
            core.cache().invalidate(ESTIMATE_CACHE_PATTERN);
            Json(estimate).into_response()
        }
        Err(e) => errors::repository_error_to_response(e),
    }
}

pub async fn request_report(
    Extension(core): Extension<Arc<EstimationCore>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    if let Err(e) = core.estimates().fetch(id) {
        return errors::repository_error_to_response(e);
    }

    match core
        .jobs()
        .submit(tasks::GENERATE_PDF, serde_json::json!({ "estimate_id": id }))
    {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(dto::JobAccepted::new(job_id))).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
