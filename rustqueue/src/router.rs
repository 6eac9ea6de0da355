//! HTTP router for RustQueue

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use rustqueue_queue::{routes, QueueEngine};
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(engine: QueueEngine) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(routes(engine))
        .layer(TraceLayer::new_for_http())
}

async fn root() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"service": "rustqueue", "api": "/api/v1"}"#,
    )
}
