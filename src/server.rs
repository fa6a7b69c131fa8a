use crate::error::GatewayError;
use crate::gateway::{error_body, Gateway, SseEvent, SseStream};
use crate::translate::anthropic_types::MessagesRequest;
use crate::translate::openai_types::ChatCompletionRequest;
use crate::translate::{anthropic, openai};
use crate::unified::UnifiedRequest;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const OWNER_HEADER: &str = "x-owner-id";
pub const GATE_HEADER: &str = "x-gate-id";

pub struct AppState {
    pub gateway: Gateway,
    /// Owner used when a request carries no owner header.
    pub default_owner: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/gateway", post(handle_unified))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Which wire shape errors are rendered in.
#[derive(Debug, Clone, Copy)]
enum Wire {
    OpenAi,
    Anthropic,
    Unified,
}

fn error_response(wire: Wire, err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        info!("Request rejected: {}", err);
    }
    match wire {
        Wire::OpenAi => (status, Json(openai::error_response(err))).into_response(),
        Wire::Anthropic => (status, Json(anthropic::error_response(err))).into_response(),
        Wire::Unified => (status, Json(error_body(err))).into_response(),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn owner<'a>(state: &'a AppState, headers: &'a HeaderMap) -> &'a str {
    header(headers, OWNER_HEADER).unwrap_or(&state.default_owner)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid request body: {e}")))
}

fn sse_response(events: SseStream) -> Response {
    let stream = events.map(|e: SseEvent| -> Result<Event, Infallible> {
        let event = Event::default().data(e.data);
        Ok(match e.event {
            Some(name) => event.event(name),
            None => event,
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ChatCompletionRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return error_response(Wire::OpenAi, &e),
    };
    let owner = owner(&state, &headers);
    let gate = header(&headers, GATE_HEADER);

    if req.stream.unwrap_or(false) {
        match state.gateway.openai_chat_stream(owner, gate, req).await {
            Ok(events) => sse_response(events),
            Err(e) => error_response(Wire::OpenAi, &e),
        }
    } else {
        match state.gateway.openai_chat(owner, gate, req).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => error_response(Wire::OpenAi, &e),
        }
    }
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: MessagesRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return error_response(Wire::Anthropic, &e),
    };
    let owner = owner(&state, &headers);
    let gate = header(&headers, GATE_HEADER);

    if req.stream.unwrap_or(false) {
        match state.gateway.anthropic_messages_stream(owner, gate, req).await {
            Ok(events) => sse_response(events),
            Err(e) => error_response(Wire::Anthropic, &e),
        }
    } else {
        match state.gateway.anthropic_messages(owner, gate, req).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => error_response(Wire::Anthropic, &e),
        }
    }
}

async fn handle_unified(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut req: UnifiedRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return error_response(Wire::Unified, &e),
    };
    if let Some(gate) = header(&headers, GATE_HEADER) {
        req.gate_id = gate.to_string();
    }
    let owner = owner(&state, &headers);

    if req.is_streaming() {
        match state.gateway.execute_stream_events(owner, req).await {
            Ok(events) => sse_response(events),
            Err(e) => error_response(Wire::Unified, &e),
        }
    } else {
        match state.gateway.execute(owner, req).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => error_response(Wire::Unified, &e),
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .gateway
        .catalog()
        .models()
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.provider.as_str(),
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
