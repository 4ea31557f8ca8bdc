//! REST and SSE handlers.
//!
//! Each handler calls one orchestrator operation. Streaming answers are
//! server-sent events: one `data:` frame per record, `[DONE]` after the
//! final one, and `Error: …` if the stream breaks off.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use tracing::{debug, info};

use ember_core::{GenerateChunk, GenerateRequest, ModelList, PullProgress};
use ember_proxy::{NdjsonStream, ProxyError, ProxyResult};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// `NotReady` is the caller's problem (409); anything else is the
/// executor's (502).
fn proxy_error(err: &ProxyError) -> Response {
    let status = if err.is_not_ready() {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_GATEWAY
    };
    debug!(error = %err, kind = %err.kind(), %status, "inference call refused");
    error_response(&err.to_string(), status).into_response()
}

// ── Orchestrator ───────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "executor": state.orchestrator.status().state,
    }))
}

// ── Executor lifecycle ─────────────────────────────────────────

/// POST /api/v1/executor/start
pub async fn start_executor(State(state): State<ApiState>) -> impl IntoResponse {
    let receipt = state.orchestrator.start_executor();
    info!(state = %receipt.state, "start requested over API");
    (StatusCode::ACCEPTED, ApiResponse::ok(receipt))
}

/// POST /api/v1/executor/stop
pub async fn stop_executor(State(state): State<ApiState>) -> impl IntoResponse {
    let receipt = state.orchestrator.stop_executor();
    info!(state = %receipt.state, "stop requested over API");
    (StatusCode::ACCEPTED, ApiResponse::ok(receipt))
}

/// GET /api/v1/executor/status
pub async fn executor_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.status())
}

// ── Inference ──────────────────────────────────────────────────

/// POST /api/v1/generate
pub async fn generate(
    State(state): State<ApiState>,
    Json(req): Json<GenerateRequest>,
) -> Response {
    if req.model.trim().is_empty() {
        return error_response("model is required", StatusCode::BAD_REQUEST).into_response();
    }

    match state
        .orchestrator
        .generate(&req.model, &req.prompt, req.options)
        .await
    {
        Ok(stream) => event_stream(stream, generate_events).into_response(),
        Err(e) => proxy_error(&e),
    }
}

/// POST /api/v1/models/:name/pull
pub async fn pull_model(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.pull_model(&name).await {
        Ok(stream) => event_stream(stream, pull_events).into_response(),
        Err(e) => proxy_error(&e),
    }
}

// ── Models ─────────────────────────────────────────────────────

/// GET /api/v1/models
pub async fn list_models(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(ModelList {
        models: state.orchestrator.list_models().await,
    })
}

/// GET /api/v1/models/:name
pub async fn check_model(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.check_model(&name).await {
        Ok(Some(model)) => ApiResponse::ok(serde_json::json!({
            "available": true,
            "model": model,
        }))
        .into_response(),
        Ok(None) => ApiResponse::ok(serde_json::json!({ "available": false })).into_response(),
        Err(e) => proxy_error(&e),
    }
}

/// DELETE /api/v1/models/:name
pub async fn delete_model(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.delete_model(&name).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "status": "deleted",
            "model": name,
        }))
        .into_response(),
        Err(e) => proxy_error(&e),
    }
}

// ── Server-sent events ─────────────────────────────────────────

fn event_stream<T>(
    records: NdjsonStream<T>,
    to_events: fn(ProxyResult<T>) -> Vec<Event>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Send + 'static,
{
    let events = records.flat_map(move |record| {
        futures_util::stream::iter(to_events(record).into_iter().map(Ok::<Event, Infallible>))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// SSE data lines cannot carry raw line breaks.
fn escape(text: &str) -> String {
    text.replace('\n', "\\n").replace('\r', "\\r")
}

fn done_event() -> Event {
    Event::default().data("[DONE]")
}

fn error_event(err: &ProxyError) -> Event {
    Event::default().data(format!("Error: {}", escape(&err.to_string())))
}

fn generate_events(record: ProxyResult<GenerateChunk>) -> Vec<Event> {
    match record {
        Ok(chunk) => {
            let mut events = Vec::with_capacity(2);
            if !chunk.chunk.is_empty() {
                events.push(Event::default().data(escape(&chunk.chunk)));
            }
            if chunk.done {
                events.push(done_event());
            }
            events
        }
        Err(e) => vec![error_event(&e)],
    }
}

fn pull_events(record: ProxyResult<PullProgress>) -> Vec<Event> {
    match record {
        Ok(progress) => {
            let data = match serde_json::to_string(&progress) {
                Ok(json) => json,
                Err(e) => return vec![Event::default().data(format!("Error: {e}"))],
            };
            let mut events = vec![Event::default().data(data)];
            if progress.is_final() {
                events.push(done_event());
            }
            events
        }
        Err(e) => vec![error_event(&e)],
    }
}
