use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use estimator_core::DomainError;
use estimator_infra::cache::ComputeError;
use estimator_infra::jobs::{CancelError, JobStoreError, SubmitError};
use estimator_infra::persistence::RepositoryError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(errors) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": "validation_error",
                "message": errors.join("; "),
                "details": errors,
            })),
        )
            .into_response(),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

pub fn repository_error_to_response(err: RepositoryError) -> axum::response::Response {
    match err {
        RepositoryError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        RepositoryError::AlreadyExists(_) => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        RepositoryError::Unavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "repository_unavailable", err.to_string())
        }
    }
}

pub fn compute_error_to_response(err: ComputeError<RepositoryError>) -> axum::response::Response {
    match err {
        ComputeError::Failed(e) => repository_error_to_response(e),
        ComputeError::TimedOut(_) => json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string()),
    }
}

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        JobStoreError::AlreadyExists(_) | JobStoreError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        JobStoreError::Storage(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
        }
        JobStoreError::Serialize(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::UnknownTask(_) => json_error(StatusCode::BAD_REQUEST, "unknown_task", err.to_string()),
        SubmitError::Store(e) => job_store_error_to_response(e),
        SubmitError::Queue(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_closed", err.to_string())
        }
    }
}

pub fn cancel_error_to_response(err: CancelError) -> axum::response::Response {
    match err {
        CancelError::NotCancellable { .. } => {
            json_error(StatusCode::CONFLICT, "not_cancellable", err.to_string())
        }
        CancelError::Store(e) => job_store_error_to_response(e),
    }
}
