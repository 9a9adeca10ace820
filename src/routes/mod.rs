// HTTP facade
// Routes /v1/messages, /v1/messages/count_tokens, /health and
// /antigravity-status, translating between the client protocol and the
// upstream through the converter and streaming modules

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::converters::request::build_upstream_request;
use crate::converters::response::translate_response;
use crate::converters::{self, last_user_text};
use crate::endpoints::EndpointPool;
use crate::error::ApiError;
use crate::http_client::UpstreamClient;
use crate::models::anthropic::{AnthropicMessagesRequest, CountTokensRequest};
use crate::models::antigravity::{unwrap_internal, GenerateContentResponse};
use crate::resolver::ModelResolver;
use crate::streaming::{bridge_stream, message_to_sse, FrameDecoder, StreamBridge};
use crate::tokenizer::{count_input_tokens, CounterProfile};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthManager>,
    pub pool: Arc<EndpointPool>,
    pub upstream: Arc<UpstreamClient>,
    pub resolver: ModelResolver,
    /// Process-start nonce folded into per-connection session ids
    pub session_nonce: u64,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/antigravity-status", get(status_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .layer(from_fn_with_state(state.clone(), crate::middleware::host_guard))
        .layer(crate::middleware::cors_layer())
        .with_state(state)
}

/// GET / - basic liveness
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Antigravity Gateway is running",
        "version": VERSION
    }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let accounts = state.auth.account_count().await;
    Json(json!({
        "ok": true,
        "version": VERSION,
        "antigravity": {
            "enabled": accounts > 0,
            "available": state.pool.available(),
            "accounts": accounts,
        },
        "streaming": {
            "force_disabled": state.config.force_disable_streaming,
            "max_retries": state.config.max_streaming_retries,
        }
    }))
}

/// GET /antigravity-status - account and endpoint detail, no token material
async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let accounts = state.auth.accounts_summary().await;
    let endpoints = state.pool.summary();
    let last_error = endpoints
        .iter()
        .find(|e| e.status != crate::endpoints::EndpointStatus::Ok)
        .map(|e| json!({"endpoint": e.host, "status": e.status}));

    Json(json!({
        "accounts": accounts,
        "endpoints": endpoints,
        "last_error": last_error,
    }))
}

/// POST /v1/messages/count_tokens
async fn count_tokens_handler(
    State(state): State<AppState>,
    Json(request): Json<CountTokensRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let profile = CounterProfile::from_model(&state.config.token_counter_model);
    let input_tokens = count_input_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref(),
        profile,
    );
    Ok(Json(json!({ "input_tokens": input_tokens })))
}

/// POST /v1/messages
///
/// Streaming and non-streaming message requests. Failures before the first
/// downstream event surface as plain HTTP errors; once the SSE stream has
/// started, failures degrade to an in-band error stop reason.
async fn messages_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Request to /v1/messages: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    if request.messages.is_empty() {
        return Err(ApiError::Validation("messages cannot be empty".to_string()));
    }
    if request.max_tokens <= 0 {
        return Err(ApiError::Validation(
            "max_tokens must be positive".to_string(),
        ));
    }

    let route = state.resolver.resolve(&request.model)?;
    tracing::debug!(
        "Model route: {} -> {} (thinking: {})",
        route.requested,
        route.upstream_id,
        route.thinking
    );

    // Streaming to the upstream can be disabled wholesale; the client still
    // gets the response shape it asked for
    let upstream_streaming = request.stream && !state.config.force_disable_streaming;

    let session_id = session_id_for(connect_info.map(|c| c.0), state.session_nonce);

    let profile = CounterProfile::from_model(&state.config.token_counter_model);
    let input_tokens = count_input_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref(),
        profile,
    );

    let snapshot = state.auth.snapshot().await?;
    let upstream_body = build_upstream_request(
        &request,
        &route,
        &snapshot.project_id,
        &session_id,
        &state.config,
    )?;

    let tool_schemas = converters::request::tool_schema_map(&request.tools);
    let user_text = last_user_text(&request.messages);

    let response = state
        .upstream
        .call(&upstream_body, route.thinking, upstream_streaming)
        .await?;

    if upstream_streaming {
        let bridge = StreamBridge::new(
            route.requested.clone(),
            input_tokens,
            tool_schemas,
            user_text,
            state.config.tool_repair_enabled,
        );
        let decoder = FrameDecoder::new(
            state.config.max_streaming_retries,
            state.config.chunk_buffer_limit,
        );

        let sse = bridge_stream(
            response,
            bridge,
            decoder,
            Duration::from_secs(state.config.request_timeout),
        );
        let byte_stream =
            futures::StreamExt::map(sse, |event| Ok::<_, std::io::Error>(Bytes::from(event)));

        return sse_response(Body::from_stream(byte_stream));
    }

    // Non-streaming upstream call: single JSON body, possibly wrapped
    let raw = response
        .bytes()
        .await
        .map_err(|e| ApiError::EndpointUnavailable(format!("failed to read body: {e}")))?;
    let value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
        ApiError::MalformedChunk(format!("upstream response is not JSON: {e}"))
    })?;
    let upstream_response: GenerateContentResponse = serde_json::from_value(unwrap_internal(value))
        .map_err(|e| ApiError::MalformedChunk(format!("unexpected upstream shape: {e}")))?;

    let message = translate_response(
        &upstream_response,
        &route.requested,
        &tool_schemas,
        user_text.as_deref(),
        state.config.tool_repair_enabled,
        input_tokens,
    );

    if request.stream {
        // Client asked for SSE but upstream streaming is disabled: replay
        // the finished message as a conformant event sequence
        let events = message_to_sse(&message);
        let byte_stream = futures::stream::iter(
            events
                .into_iter()
                .map(|event| Ok::<_, std::io::Error>(Bytes::from(event))),
        );
        return sse_response(Body::from_stream(byte_stream));
    }

    Ok(Json(message).into_response())
}

fn sse_response(body: Body) -> Result<Response, ApiError> {
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to build response: {e}")))
}

/// Stable per-connection session id: hash of the client address and the
/// process-start nonce, rendered in the upstream's negative-decimal shape.
fn session_id_for(peer: Option<SocketAddr>, nonce: u64) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    nonce.hash(&mut hasher);
    match peer {
        Some(addr) => {
            addr.ip().hash(&mut hasher);
            addr.port().hash(&mut hasher);
        }
        None => "local".hash(&mut hasher),
    }
    format!("-{}", hasher.finish() >> 1)
}
