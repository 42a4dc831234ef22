//! HTTP API application wiring (Axum router + middleware).
//!
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

use estimator_infra::EstimationCore;

use crate::auth::Hs256Validator;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// The caller owns `core`'s lifecycle (starting workers, shutdown).
pub fn build_app(core: Arc<EstimationCore>, jwt_secret: &str) -> Router {
    let auth_state = middleware::AuthState {
        validator: Arc::new(Hs256Validator::new(jwt_secret)),
    };
    let cors_state = middleware::CorsState::new(&core.settings().allowed_origins);

    // Protected routes: require a valid bearer token.
    let protected = routes::router().route_layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/api/health", get(routes::system::health))
        .nest("/api", protected)
        .fallback(routes::system::not_found)
        .layer(Extension(core))
        .layer(axum::middleware::from_fn_with_state(cors_state, middleware::cors))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(axum::middleware::from_fn(middleware::response_time))
}
