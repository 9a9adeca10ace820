// Integration tests for the Antigravity Gateway
//
// These exercise the full HTTP stack (routing, host guard, translation,
// streaming) against a fake upstream served by mockito.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::io::Write as _;
use std::sync::Arc;
use tower::ServiceExt;

use antigravity_gateway::{
    auth::{
        store::{Account, TokenStore},
        AuthManager,
    },
    config::Config,
    endpoints::EndpointPool,
    http_client::UpstreamClient,
    resolver::ModelResolver,
    routes::{build_router, AppState},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

struct TestGateway {
    app: Router,
    auth: Arc<AuthManager>,
    pool: Arc<EndpointPool>,
    _store_dir: tempfile::TempDir,
}

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        log_level: "info".to_string(),
        allow_remote: false,
        token_store_file: std::path::PathBuf::from("/tmp/unused.json"),
        connect_timeout: 10,
        request_timeout: 30,
        request_deadline_ms: 60_000,
        max_streaming_retries: 12,
        chunk_buffer_limit: 1024 * 1024,
        force_disable_streaming: false,
        upstream_max_retries: 3,
        haiku_model: "antigravity-gemini-2.5-flash".to_string(),
        sonnet_model: "antigravity-claude-sonnet-4-5".to_string(),
        opus_model: "antigravity-claude-opus-4-5-thinking".to_string(),
        token_counter_model: "claude".to_string(),
        thinking_budget: None,
        tool_repair_enabled: true,
    }
}

fn account(access_token: &str) -> Account {
    Account {
        email: "me@example.com".to_string(),
        access_token: access_token.to_string(),
        refresh_token: "1//refresh".to_string(),
        expires_at: Utc::now() + ChronoDuration::hours(1),
        project_id: Some("proj-1".to_string()),
        scopes: vec![],
        created_at: Utc::now(),
        last_refresh: None,
    }
}

/// Build a gateway whose upstream and token endpoints point at `server`.
fn gateway_with_config(server: &mockito::Server, config: Config) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let mut store = TokenStore::load(&path).unwrap();
    store.upsert(account("ya29.first"));

    let auth = Arc::new(AuthManager::new_for_testing(
        store,
        format!("{}/token", server.url()),
        format!("{}/v1internal:loadCodeAssist", server.url()),
    ));

    let pool = Arc::new(EndpointPool::new());
    let upstream = Arc::new(
        UpstreamClient::new(auth.clone(), pool.clone(), &config)
            .unwrap()
            .with_base_url(server.url()),
    );
    let resolver = ModelResolver::new(&config);

    let state = AppState {
        config: Arc::new(config),
        auth: auth.clone(),
        pool: pool.clone(),
        upstream,
        resolver,
        session_nonce: 7,
    };

    TestGateway {
        app: build_router(state),
        auth,
        pool,
        _store_dir: dir,
    }
}

fn gateway(server: &mockito::Server) -> TestGateway {
    gateway_with_config(server, test_config())
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::HOST, "127.0.0.1:8089")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::HOST, "localhost:8089")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Parse an SSE body into (event, data) pairs.
fn parse_sse(raw: &str) -> Vec<(String, Value)> {
    raw.split("\n\n")
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| {
            let mut event = String::new();
            let mut data = Value::Null;
            for line in chunk.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(rest).unwrap();
                }
            }
            (event, data)
        })
        .collect()
}

fn ping_request(stream: bool) -> Value {
    json!({
        "model": "claude-3-haiku-x",
        "stream": stream,
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "ping"}]
    })
}

// ==================================================================================================
// Health and status
// ==================================================================================================

#[tokio::test]
async fn test_health_shape() {
    let server = mockito::Server::new_async().await;
    let gw = gateway(&server);

    let response = gw.app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response.into_body()).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["antigravity"]["enabled"], true);
    assert_eq!(body["antigravity"]["available"], true);
    assert_eq!(body["antigravity"]["accounts"], 1);
    assert_eq!(body["streaming"]["force_disabled"], false);
}

#[tokio::test]
async fn test_status_has_no_token_material() {
    let server = mockito::Server::new_async().await;
    let gw = gateway(&server);

    let response = gw.app.oneshot(get("/antigravity-status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let raw = text_body(response.into_body()).await;
    assert!(!raw.contains("ya29.first"));
    assert!(!raw.contains("1//refresh"));

    let body: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(body["accounts"][0]["email"], "me@example.com");
    assert_eq!(body["accounts"][0]["project_id"], "proj-1");
    assert_eq!(body["endpoints"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_non_loopback_host_rejected() {
    let server = mockito::Server::new_async().await;
    let gw = gateway(&server);

    let request = Request::builder()
        .uri("/health")
        .header(header::HOST, "evil.example.com")
        .body(Body::empty())
        .unwrap();

    let response = gw.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ==================================================================================================
// Scenario: text ping (non-streaming)
// ==================================================================================================

#[tokio::test]
async fn test_text_ping() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1internal:generateContent")
        .match_header("authorization", "Bearer ya29.first")
        .with_status(200)
        .with_body(
            json!({
                "response": {
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "pong"}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let gw = gateway(&server);
    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.into_body()).await;

    mock.assert_async().await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    // The client sees the alias it asked for, not the upstream id
    assert_eq!(body["model"], "claude-3-haiku-x");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "pong");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 4);
    assert_eq!(body["usage"]["output_tokens"], 1);
}

#[tokio::test]
async fn test_empty_tools_array_accepted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1internal:generateContent")
        .with_status(200)
        .with_body(
            json!({"response": {"candidates": [{
                "content": {"role": "model", "parts": [{"text": "ok"}]},
                "finishReason": "STOP"
            }]}})
            .to_string(),
        )
        .create_async()
        .await;

    let gw = gateway(&server);
    let mut request = ping_request(false);
    request["tools"] = json!([]);

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_body_shape() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1internal:generateContent")
        .match_body(mockito::Matcher::PartialJson(json!({
            "project": "proj-1",
            "model": "gemini-2.5-flash",
            "requestType": "agent",
            "userAgent": "antigravity",
            "request": {
                "contents": [{"role": "user", "parts": [{"text": "ping"}]}]
            }
        })))
        .with_status(200)
        .with_body(
            json!({"response": {"candidates": [{
                "content": {"role": "model", "parts": [{"text": "ok"}]},
                "finishReason": "STOP"
            }]}})
            .to_string(),
        )
        .create_async()
        .await;

    let gw = gateway(&server);
    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(false)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;
}

// ==================================================================================================
// Scenario: streaming tool call with argument repair
// ==================================================================================================

#[tokio::test]
async fn test_streaming_tool_call() {
    let mut server = mockito::Server::new_async().await;
    let stream_body = format!(
        "data: {}\n\ndata: {}\n\n",
        json!({"response": {"candidates": [{
            "content": {"role": "model", "parts": [{"text": "planning", "thought": true}]}
        }]}}),
        json!({"response": {"candidates": [{
            "content": {"role": "model", "parts": [
                {"functionCall": {"name": "read_file", "args": {}}}
            ]},
            "finishReason": "STOP"
        }]}}),
    );
    server
        .mock("POST", "/v1internal:streamGenerateContent")
        .match_query(mockito::Matcher::UrlEncoded("alt".into(), "sse".into()))
        .match_header("accept", "text/event-stream")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(stream_body)
        .create_async()
        .await;

    let gw = gateway(&server);
    let request = json!({
        "model": "claude-3-haiku-x",
        "stream": true,
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "read README.md"}],
        "tools": [{
            "name": "read_file",
            "description": "Read a file",
            "input_schema": {
                "type": "object",
                "properties": {"file_path": {"type": "string"}},
                "required": ["file_path"]
            }
        }]
    });

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let raw = text_body(response.into_body()).await;
    let events = parse_sse(&raw);
    let kinds: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );

    assert_eq!(events[0].1["message"]["model"], "claude-3-haiku-x");
    assert_eq!(events[1].1["content_block"]["type"], "thinking");
    assert_eq!(events[2].1["delta"]["thinking"], "planning");
    assert_eq!(events[4].1["content_block"]["type"], "tool_use");
    assert_eq!(events[4].1["content_block"]["name"], "read_file");

    // Argument repaired from the user text, carried as serialized JSON
    let partial = events[5].1["delta"]["partial_json"].as_str().unwrap();
    let args: Value = serde_json::from_str(partial).unwrap();
    assert_eq!(args, json!({"file_path": "README.md"}));

    assert_eq!(events[7].1["delta"]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn test_streaming_ndjson_upstream() {
    let mut server = mockito::Server::new_async().await;
    let stream_body = format!(
        "{}\n{}\n",
        json!({"response": {"candidates": [{
            "content": {"role": "model", "parts": [{"text": "po"}]}
        }]}}),
        json!({"response": {"candidates": [{
            "content": {"role": "model", "parts": [{"text": "ng"}]},
            "finishReason": "STOP"
        }]}}),
    );
    server
        .mock("POST", "/v1internal:streamGenerateContent")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(stream_body)
        .create_async()
        .await;

    let gw = gateway(&server);
    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let raw = text_body(response.into_body()).await;
    let events = parse_sse(&raw);
    let text: String = events
        .iter()
        .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "text_delta")
        .map(|(_, d)| d["delta"]["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(text, "pong");
    assert_eq!(events.last().unwrap().0, "message_stop");
}

// ==================================================================================================
// Scenario: endpoint failover
// ==================================================================================================

#[tokio::test]
async fn test_request_skips_rate_limited_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1internal:generateContent")
        .with_status(200)
        .with_body(
            json!({"response": {"candidates": [{
                "content": {"role": "model", "parts": [{"text": "from B"}]},
                "finishReason": "STOP"
            }]}})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let gw = gateway(&server);
    // Endpoint A was rate limited moments ago
    gw.pool
        .mark_rate_limited(0, Some(std::time::Duration::from_secs(30)));

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;

    // A is still cooling down; the request went straight to B
    let summary = gw.pool.summary();
    assert!(summary[0].retry_after_secs > 20);
    let picked = gw.pool.pick();
    assert_eq!(picked.index, 1);
}

#[tokio::test]
async fn test_first_chunk_429_is_http_429_not_sse() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1internal:streamGenerateContent")
        .match_query(mockito::Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "30")
        .with_body(r#"{"error": {"status": "RESOURCE_EXHAUSTED"}}"#)
        .create_async()
        .await;

    let gw = gateway(&server);
    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(true)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());

    let body = json_body(response.into_body()).await;
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "rate_limited");
}

// ==================================================================================================
// Scenario: token refresh on 401
// ==================================================================================================

#[tokio::test]
async fn test_refresh_on_401() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1internal:generateContent")
        .match_header("authorization", "Bearer ya29.first")
        .with_status(401)
        .with_body("unauthorized")
        .expect(1)
        .create_async()
        .await;
    server
        .mock("POST", "/v1internal:generateContent")
        .match_header("authorization", "Bearer ya29.new")
        .with_status(200)
        .with_body(
            json!({"response": {"candidates": [{
                "content": {"role": "model", "parts": [{"text": "ok"}]},
                "finishReason": "STOP"
            }]}})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let refresh_mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_body(r#"{"access_token":"ya29.new","expires_in":3599}"#)
        .expect(1)
        .create_async()
        .await;

    let gw = gateway(&server);
    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    refresh_mock.assert_async().await;
    assert_eq!(gw.auth.refresh_call_count(), 1);

    // The refreshed expiry is persisted on the account
    let summary = gw.auth.accounts_summary().await;
    let expires: chrono::DateTime<Utc> = summary[0].token_expires_at.parse().unwrap();
    assert!(expires > Utc::now() + ChronoDuration::minutes(50));
}

// ==================================================================================================
// Scenario: mid-stream error
// ==================================================================================================

#[tokio::test]
async fn test_mid_stream_error_frames_in_band() {
    let mut server = mockito::Server::new_async().await;

    let first_frame = json!({"response": {"candidates": [{
        "content": {"role": "model", "parts": [{"text": "partial answer"}]}
    }]}})
    .to_string();

    // One good frame, then framing garbage that overruns the buffer cap
    let mock = server
        .mock("POST", "/v1internal:streamGenerateContent")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_chunked_body(move |w| {
            w.write_all(format!("data: {}\n\n", first_frame).as_bytes())?;
            w.write_all(&vec![b'x'; 4096])?;
            Ok(())
        })
        .expect(1)
        .create_async()
        .await;

    let mut config = test_config();
    config.chunk_buffer_limit = 1024;
    let gw = gateway_with_config(&server, config);

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let raw = text_body(response.into_body()).await;
    let events = parse_sse(&raw);
    let kinds: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();

    // No retry happened and the stream still terminates properly
    mock.assert_async().await;
    assert_eq!(kinds.first(), Some(&"message_start"));
    assert_eq!(kinds[kinds.len() - 2], "message_delta");
    assert_eq!(kinds.last(), Some(&"message_stop"));

    let delta = &events[events.len() - 2].1;
    assert_eq!(delta["delta"]["stop_reason"], "error");
}

// ==================================================================================================
// Validation errors
// ==================================================================================================

#[tokio::test]
async fn test_unroutable_model_is_400() {
    let server = mockito::Server::new_async().await;
    let gw = gateway(&server);

    let mut request = ping_request(false);
    request["model"] = json!("gpt-4o");

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response.into_body()).await;
    assert_eq!(body["error"]["type"], "invalid_model");
}

#[tokio::test]
async fn test_invalid_tool_schema_is_400_before_upstream() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1internal:generateContent")
        .expect(0)
        .create_async()
        .await;

    let gw = gateway(&server);
    let mut request = ping_request(false);
    request["tools"] = json!([{
        "name": "broken",
        "input_schema": {"type": "string"}
    }]);

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    mock.assert_async().await;

    let body = json_body(response.into_body()).await;
    assert_eq!(body["error"]["type"], "schema_invalid");
}

#[tokio::test]
async fn test_empty_messages_is_400() {
    let server = mockito::Server::new_async().await;
    let gw = gateway(&server);

    let request = json!({
        "model": "claude-3-haiku-x",
        "max_tokens": 16,
        "messages": []
    });

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ==================================================================================================
// count_tokens
// ==================================================================================================

#[tokio::test]
async fn test_count_tokens_shape() {
    let server = mockito::Server::new_async().await;
    let gw = gateway(&server);

    let request = json!({
        "model": "claude-3-haiku-x",
        "messages": [{"role": "user", "content": "how many tokens is this sentence?"}],
        "system": "You are a counter."
    });

    let response = gw
        .app
        .oneshot(post_json("/v1/messages/count_tokens", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response.into_body()).await;
    let tokens = body["input_tokens"].as_i64().unwrap();
    assert!(tokens > 0);
    assert!(tokens < 200);
}

// ==================================================================================================
// Forced non-streaming
// ==================================================================================================

#[tokio::test]
async fn test_force_disable_streaming_still_emits_sse() {
    let mut server = mockito::Server::new_async().await;
    // Only the non-streaming upstream route may be hit
    let stream_mock = server
        .mock("POST", "/v1internal:streamGenerateContent")
        .match_query(mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    server
        .mock("POST", "/v1internal:generateContent")
        .with_status(200)
        .with_body(
            json!({"response": {"candidates": [{
                "content": {"role": "model", "parts": [{"text": "pong"}]},
                "finishReason": "STOP"
            }]}})
            .to_string(),
        )
        .create_async()
        .await;

    let mut config = test_config();
    config.force_disable_streaming = true;
    let gw = gateway_with_config(&server, config);

    let response = gw
        .app
        .oneshot(post_json("/v1/messages", ping_request(true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    stream_mock.assert_async().await;
    let raw = text_body(response.into_body()).await;
    let events = parse_sse(&raw);
    let kinds: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"message_start"));
    assert_eq!(kinds.last(), Some(&"message_stop"));
    assert!(kinds.contains(&"content_block_delta"));
}
