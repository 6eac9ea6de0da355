//! HTTP handlers for the queue API
//!
//! JSON over `/api/v1`. The credential is read from the `x-api-key` header
//! and checked by the engine's [`Caller`](crate::Caller).

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use bytes::Bytes;
use rustqueue_core::{ApiError, ErrorCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error};

use crate::engine::{QueueEngine, QueueError, ReceiveOptions};

pub const API_KEY_HEADER: &str = "x-api-key";

const DEFAULT_PAGE_SIZE: usize = 10;

/// Shared handler state
pub struct QueueState {
    pub engine: QueueEngine,
}

/// Routes for the queue API
pub fn routes(engine: QueueEngine) -> Router {
    let state = Arc::new(QueueState { engine });

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/queues", get(handle_list_queues))
        .route(
            "/api/v1/queues/:queue/messages",
            post(handle_add_message)
                .get(handle_get_messages)
                .delete(handle_clear_queue),
        )
        .route(
            "/api/v1/queues/:queue/messages/receive",
            post(handle_receive_messages),
        )
        .route(
            "/api/v1/queues/:queue/messages/by-id/:id",
            delete(handle_delete_message_by_id).put(handle_update_message),
        )
        .route(
            "/api/v1/queues/:queue/messages/:receipt_handle",
            delete(handle_delete_message),
        )
        .route("/api/v1/queues/:queue/info", get(handle_queue_info))
        .route("/api/v1/queues/:queue/health", get(handle_queue_health))
        .with_state(state)
}

// === Request shapes ===

#[derive(Debug, Deserialize)]
pub struct AddMessageRequest {
    pub id: Option<String>,
    pub message: Value,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessageRequest {
    pub message: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub max_messages: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReceiveQuery {
    pub max_messages: Option<usize>,
    pub visibility_timeout: Option<u64>,
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub only_new: bool,
}

// === Helpers ===

fn credential(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, QueueError> {
    serde_json::from_slice(body)
        .map_err(|e| QueueError::InvalidParameter(format!("Invalid request body: {e}")))
}

fn json_response(status: StatusCode, value: &impl serde::Serialize) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => error_response(ApiError::new(ErrorCode::InternalError, e.to_string())),
    }
}

fn error_response(err: ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        err.to_json(),
    )
        .into_response()
}

fn queue_error(err: QueueError) -> Response {
    match &err {
        QueueError::Storage(e) => error!(error = %e, "Storage failure"),
        other => debug!(error = %other, "Request rejected"),
    }
    error_response(err.into())
}

fn not_found(what: &str) -> Response {
    error_response(ApiError::new(
        ErrorCode::MessageNotFound,
        format!("{what} not found"),
    ))
}

fn respond<T: serde::Serialize>(result: Result<T, QueueError>) -> Response {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => queue_error(e),
    }
}

// === Handlers ===

async fn handle_health(State(state): State<Arc<QueueState>>) -> Response {
    let engine = &state.engine;
    let healthy = engine.health_check(None).await.unwrap_or(false);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    json_response(
        status,
        &json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "backend": engine.backend_name(),
        }),
    )
}

async fn handle_list_queues(
    State(state): State<Arc<QueueState>>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    respond(caller.list_queues().await.map(|queues| json!({ "queues": queues })))
}

async fn handle_add_message(
    State(state): State<Arc<QueueState>>,
    Path(queue): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: AddMessageRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return queue_error(e),
    };

    let caller = state.engine.caller(credential(&headers));
    match caller
        .add_message(&queue, request.id, request.message, request.attributes)
        .await
    {
        Ok(message) => json_response(StatusCode::CREATED, &message),
        Err(e) => queue_error(e),
    }
}

async fn handle_get_messages(
    State(state): State<Arc<QueueState>>,
    Path(queue): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    respond(
        caller
            .get_messages(
                &queue,
                query.max_messages.unwrap_or(DEFAULT_PAGE_SIZE),
                query.offset.unwrap_or(0),
            )
            .await,
    )
}

async fn handle_receive_messages(
    State(state): State<Arc<QueueState>>,
    Path(queue): Path<String>,
    Query(query): Query<ReceiveQuery>,
    headers: HeaderMap,
) -> Response {
    let options = ReceiveOptions {
        max_messages: query.max_messages.unwrap_or(1),
        visibility_timeout: query.visibility_timeout,
        consumer_id: query.consumer_id,
        destructive: query.delete,
        only_new: query.only_new,
    };

    let caller = state.engine.caller(credential(&headers));
    respond(
        caller
            .receive_messages(&queue, options)
            .await
            .map(|messages| json!({ "messages": messages })),
    )
}

async fn handle_delete_message(
    State(state): State<Arc<QueueState>>,
    Path((queue, receipt_handle)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    match caller.delete_message(&queue, &receipt_handle).await {
        Ok(true) => json_response(StatusCode::OK, &json!({ "deleted": true })),
        Ok(false) => not_found("Receipt handle"),
        Err(e) => queue_error(e),
    }
}

async fn handle_delete_message_by_id(
    State(state): State<Arc<QueueState>>,
    Path((queue, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    match caller.delete_message_by_id(&queue, &id).await {
        Ok(true) => json_response(StatusCode::OK, &json!({ "deleted": true })),
        Ok(false) => not_found("Message"),
        Err(e) => queue_error(e),
    }
}

async fn handle_update_message(
    State(state): State<Arc<QueueState>>,
    Path((queue, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: UpdateMessageRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return queue_error(e),
    };

    let caller = state.engine.caller(credential(&headers));
    match caller.update_message(&queue, &id, request.message).await {
        Ok(true) => json_response(StatusCode::OK, &json!({ "updated": true })),
        Ok(false) => not_found("Message"),
        Err(e) => queue_error(e),
    }
}

async fn handle_clear_queue(
    State(state): State<Arc<QueueState>>,
    Path(queue): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    respond(
        caller
            .clear_queue(&queue)
            .await
            .map(|deleted| json!({ "deleted": deleted })),
    )
}

async fn handle_queue_info(
    State(state): State<Arc<QueueState>>,
    Path(queue): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    respond(caller.queue_info(&queue).await)
}

async fn handle_queue_health(
    State(state): State<Arc<QueueState>>,
    Path(queue): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = state.engine.caller(credential(&headers));
    match caller.health_check(&queue).await {
        Ok(healthy) => {
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(
                status,
                &json!({
                    "queue": queue,
                    "healthy": healthy,
                    "backend": state.engine.backend_name(),
                }),
            )
        }
        Err(e) => queue_error(e),
    }
}
