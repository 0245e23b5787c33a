//! Defines routes for the gallery API.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /`         welcome message
//!   - `GET    /healthz`  liveness
//!   - `GET    /readyz`   readiness (database ping, disk round-trip)
//!
//! - **Images**
//!   - `POST   /api/upload/`             upload one image (multipart)
//!   - `GET    /api/images/`             paginated, sorted filename listing
//!   - `DELETE /api/images/{filename}`   delete an image
//!   - `GET    /images/{filename}`       serve raw image bytes
//!
//! Anything else, including a known path with the wrong method, answers with
//! a JSON `route_not_found` error.

use crate::{
    errors::AppError,
    handlers::{
        health_handlers::{healthz, readyz, root},
        image_handlers::{delete_image, list_images, serve_image, upload_image},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{delete, get, post},
};
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Route table without middleware or state.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/upload/", post(upload_image))
        .route("/api/images/", get(list_images))
        .route("/api/images/{filename}", delete(delete_image))
        .route("/images/{filename}", get(serve_image))
        .fallback(route_not_found)
        .method_not_allowed_fallback(route_not_found)
}

/// Full application: routes, body limit, request timeout and tracing, bound
/// to `state`.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let body_limit = state.upload_policy.body_limit();

    routes()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn route_not_found() -> AppError {
    AppError::route_not_found()
}
