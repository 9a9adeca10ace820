// Anthropic request -> Antigravity envelope
//
// Builds the upstream body and headers from a validated client request. Tool
// schemas are coerced here; argument repair happens on the way back.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{extract_system_prompt, ANTIGRAVITY_VERSION};
use crate::auth::discovery::client_metadata;
use crate::config::Config;
use crate::error::ApiError;
use crate::models::anthropic::{AnthropicMessagesRequest, AnthropicTool};
use crate::models::antigravity::{
    AntigravityRequestBody, Content, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerationConfig, InlineData, Part, Tool,
};
use crate::resolver::ModelRoute;

/// Beta marker the upstream expects for interleaved-thinking models; without
/// it thoughts are elided from the stream.
pub const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

/// Build the request headers for one upstream call.
pub fn build_headers(access_token: &str, thinking: bool, streaming: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {access_token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let user_agent = format!(
        "antigravity/{} {}/{}",
        ANTIGRAVITY_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if let Ok(value) = HeaderValue::from_str(&user_agent) {
        headers.insert(USER_AGENT, value);
    }

    let api_client = format!("gl-rust/1.0 antigravity/{ANTIGRAVITY_VERSION}");
    if let Ok(value) = HeaderValue::from_str(&api_client) {
        headers.insert("x-goog-api-client", value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_metadata().to_string()) {
        headers.insert("client-metadata", value);
    }

    if streaming {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    if thinking {
        headers.insert(
            "anthropic-beta",
            HeaderValue::from_static(INTERLEAVED_THINKING_BETA),
        );
    }

    headers
}

/// Coerce every declared tool, failing the request on the first schema that
/// cannot become an object declaration.
pub fn coerce_tools(
    tools: &Option<Vec<AnthropicTool>>,
) -> Result<Option<Vec<Tool>>, ApiError> {
    let Some(tools) = tools else {
        return Ok(None);
    };
    if tools.is_empty() {
        return Ok(None);
    }

    let mut declarations = Vec::with_capacity(tools.len());
    for tool in tools {
        let parameters = crate::schema::coerce_tool_schema(&tool.input_schema)
            .map_err(|e| ApiError::SchemaInvalid(format!("tool \"{}\": {}", tool.name, e)))?;
        declarations.push(FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters,
        });
    }

    Ok(Some(vec![Tool {
        function_declarations: declarations,
    }]))
}

/// Coerced schema per tool name, used for argument repair on the way back.
pub fn tool_schema_map(tools: &Option<Vec<AnthropicTool>>) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    if let Some(tools) = tools {
        for tool in tools {
            if let Ok(schema) = crate::schema::coerce_tool_schema(&tool.input_schema) {
                map.insert(tool.name.clone(), schema);
            }
        }
    }
    map
}

/// Build the full upstream envelope for one request.
pub fn build_upstream_request(
    request: &AnthropicMessagesRequest,
    route: &ModelRoute,
    project_id: &str,
    session_id: &str,
    config: &Config,
) -> Result<AntigravityRequestBody, ApiError> {
    let contents = convert_messages(request)?;
    let tools = coerce_tools(&request.tools)?;

    let system_text = extract_system_prompt(&request.system);
    // Upstream rejects role "system"; the instruction rides as a user turn
    let system_instruction = if system_text.is_empty() {
        None
    } else {
        Some(Content {
            role: Some("user".to_string()),
            parts: vec![Part::text(system_text)],
        })
    };

    let thinking_config = if route.thinking {
        let mut cfg = json!({ "includeThoughts": true });
        if let Some(budget) = config.thinking_budget {
            cfg["thinkingBudget"] = json!(budget);
        }
        Some(cfg)
    } else {
        None
    };

    let generation_config = GenerationConfig {
        max_output_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.clone(),
        thinking_config,
    };

    let body = GenerateContentRequest {
        contents,
        tools,
        system_instruction,
        generation_config: Some(generation_config),
        session_id: Some(session_id.to_string()),
    };

    Ok(AntigravityRequestBody::new(
        project_id.to_string(),
        route.upstream_id.clone(),
        body,
    ))
}

/// Convert the message history to upstream contents. Client-side thinking
/// blocks are dropped; tool results become functionResponse parts on a user
/// turn, matched to their call by the tool_use id recorded earlier in the
/// history.
fn convert_messages(request: &AnthropicMessagesRequest) -> Result<Vec<Content>, ApiError> {
    let mut contents = Vec::with_capacity(request.messages.len());
    // tool_use id -> tool name, for functionResponse naming
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        let role = match message.role.as_str() {
            "user" => "user",
            "assistant" => "model",
            other => {
                return Err(ApiError::Validation(format!(
                    "unsupported message role \"{other}\""
                )))
            }
        };

        let parts = convert_content(&message.content, role, &mut call_names)?;
        if parts.is_empty() {
            continue;
        }

        contents.push(Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    if contents.is_empty() {
        return Err(ApiError::Validation(
            "messages produced no usable content".to_string(),
        ));
    }

    Ok(contents)
}

fn convert_content(
    content: &Value,
    role: &str,
    call_names: &mut HashMap<String, String>,
) -> Result<Vec<Part>, ApiError> {
    if let Some(text) = content.as_str() {
        if text.is_empty() {
            return Ok(vec![]);
        }
        return Ok(vec![Part::text(text)]);
    }

    let Some(blocks) = content.as_array() else {
        return Err(ApiError::Validation(
            "message content must be a string or an array of blocks".to_string(),
        ));
    };

    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        let block_type = block
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ApiError::Validation("content block missing type".to_string()))?;

        match block_type {
            "text" => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                }
            }
            // History thoughts are not replayed upstream
            "thinking" | "redacted_thinking" => {}
            "image" => {
                if let Some(part) = convert_image(block) {
                    parts.push(part);
                }
            }
            "tool_use" => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ApiError::Validation("tool_use block missing name".to_string())
                    })?
                    .to_string();
                let args = block.get("input").cloned().unwrap_or_else(|| json!({}));

                if !id.is_empty() {
                    call_names.insert(id.clone(), name.clone());
                }

                parts.push(Part {
                    function_call: Some(FunctionCall {
                        name,
                        args,
                        id: if id.is_empty() { None } else { Some(id) },
                    }),
                    ..Part::default()
                });
            }
            "tool_result" => {
                if role != "user" {
                    return Err(ApiError::Validation(
                        "tool_result blocks belong to user messages".to_string(),
                    ));
                }
                let tool_use_id = block
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let name = call_names
                    .get(tool_use_id)
                    .cloned()
                    .unwrap_or_else(|| tool_use_id.to_string());

                let output = tool_result_value(block);
                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        name,
                        response: json!({ "output": output }),
                    }),
                    ..Part::default()
                });
            }
            other => {
                tracing::debug!("Dropping unsupported content block type \"{}\"", other);
            }
        }
    }

    Ok(parts)
}

fn convert_image(block: &Value) -> Option<Part> {
    let source = block.get("source")?;
    let source_type = source.get("type")?.as_str()?;
    if source_type != "base64" {
        tracing::warn!("URL-based images are not supported upstream, skipping");
        return None;
    }
    let media_type = source
        .get("media_type")
        .and_then(|v| v.as_str())
        .unwrap_or("image/jpeg");
    let data = source.get("data")?.as_str()?;
    if data.is_empty() {
        return None;
    }

    Some(Part {
        inline_data: Some(InlineData {
            mime_type: media_type.to_string(),
            data: data.to_string(),
        }),
        ..Part::default()
    })
}

/// Flatten a tool_result content field to text; error results keep their
/// text with an error marker.
fn tool_result_value(block: &Value) -> Value {
    let is_error = block
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let text = match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let text = if text.is_empty() {
        "(empty result)".to_string()
    } else {
        text
    };

    if is_error {
        json!({ "error": text })
    } else {
        json!(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ModelRoute;
    use serde_json::json;

    fn route(thinking: bool) -> ModelRoute {
        ModelRoute {
            requested: "claude-3-sonnet-x".to_string(),
            upstream_id: if thinking {
                "claude-sonnet-4-5".to_string()
            } else {
                "gemini-2.5-flash".to_string()
            },
            thinking,
        }
    }

    fn config() -> Config {
        crate::config::test_config()
    }

    fn simple_request(content: Value) -> AnthropicMessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-3-sonnet-x",
            "max_tokens": 128,
            "messages": [{"role": "user", "content": content}]
        }))
        .unwrap()
    }

    #[test]
    fn test_envelope_shape() {
        let request = simple_request(json!("ping"));
        let body =
            build_upstream_request(&request, &route(false), "proj-1", "-42", &config()).unwrap();

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["project"], "proj-1");
        assert_eq!(value["model"], "gemini-2.5-flash");
        assert_eq!(value["requestType"], "agent");
        assert_eq!(value["userAgent"], "antigravity");
        assert!(value["requestId"].as_str().unwrap().starts_with("agent-"));
        assert_eq!(value["request"]["sessionId"], "-42");
        assert_eq!(value["request"]["contents"][0]["role"], "user");
        assert_eq!(
            value["request"]["contents"][0]["parts"][0]["text"],
            "ping"
        );
        assert_eq!(
            value["request"]["generationConfig"]["maxOutputTokens"],
            128
        );
    }

    #[test]
    fn test_system_prompt_rides_as_user_role() {
        let mut request = simple_request(json!("hi"));
        request.system = Some(json!("Always answer in French."));

        let body =
            build_upstream_request(&request, &route(false), "proj-1", "-1", &config()).unwrap();

        let si = body.request.system_instruction.unwrap();
        assert_eq!(si.role.as_deref(), Some("user"));
        assert_eq!(si.parts[0].text.as_deref(), Some("Always answer in French."));
    }

    #[test]
    fn test_thinking_config_applied_without_budget() {
        let request = simple_request(json!("hi"));
        let body =
            build_upstream_request(&request, &route(true), "proj-1", "-1", &config()).unwrap();

        let gen = body.request.generation_config.unwrap();
        assert_eq!(
            gen.thinking_config,
            Some(json!({"includeThoughts": true}))
        );
    }

    #[test]
    fn test_thinking_budget_only_when_configured() {
        let mut cfg = config();
        cfg.thinking_budget = Some(8096);
        let request = simple_request(json!("hi"));
        let body = build_upstream_request(&request, &route(true), "proj-1", "-1", &cfg).unwrap();

        let gen = body.request.generation_config.unwrap();
        assert_eq!(
            gen.thinking_config,
            Some(json!({"includeThoughts": true, "thinkingBudget": 8096}))
        );
    }

    #[test]
    fn test_non_thinking_model_has_no_thinking_config() {
        let request = simple_request(json!("hi"));
        let body =
            build_upstream_request(&request, &route(false), "proj-1", "-1", &config()).unwrap();
        assert!(body
            .request
            .generation_config
            .unwrap()
            .thinking_config
            .is_none());
    }

    #[test]
    fn test_history_thinking_blocks_are_dropped() {
        let request: AnthropicMessagesRequest = serde_json::from_value(json!({
            "model": "claude-3-sonnet-x",
            "max_tokens": 128,
            "messages": [
                {"role": "user", "content": "question"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "private reasoning", "signature": "sig"},
                    {"type": "text", "text": "answer"}
                ]},
                {"role": "user", "content": "follow-up"}
            ]
        }))
        .unwrap();

        let body =
            build_upstream_request(&request, &route(true), "proj-1", "-1", &config()).unwrap();

        let assistant_turn = &body.request.contents[1];
        assert_eq!(assistant_turn.role.as_deref(), Some("model"));
        assert_eq!(assistant_turn.parts.len(), 1);
        assert_eq!(assistant_turn.parts[0].text.as_deref(), Some("answer"));
    }

    #[test]
    fn test_tool_roundtrip_names_function_response() {
        let request: AnthropicMessagesRequest = serde_json::from_value(json!({
            "model": "claude-3-sonnet-x",
            "max_tokens": 128,
            "messages": [
                {"role": "user", "content": "read it"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_9", "name": "read_file",
                     "input": {"file_path": "README.md"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_9", "content": "# Title"}
                ]}
            ]
        }))
        .unwrap();

        let body =
            build_upstream_request(&request, &route(true), "proj-1", "-1", &config()).unwrap();

        let call = body.request.contents[1].parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.id.as_deref(), Some("toolu_9"));

        let response = body.request.contents[2].parts[0]
            .function_response
            .as_ref()
            .unwrap();
        assert_eq!(response.name, "read_file");
        assert_eq!(response.response["output"], "# Title");
    }

    #[test]
    fn test_error_tool_result_is_marked() {
        let request: AnthropicMessagesRequest = serde_json::from_value(json!({
            "model": "claude-3-sonnet-x",
            "max_tokens": 128,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1",
                     "content": "command not found", "is_error": true}
                ]}
            ]
        }))
        .unwrap();

        let body =
            build_upstream_request(&request, &route(true), "proj-1", "-1", &config()).unwrap();
        let response = body.request.contents[1].parts[0]
            .function_response
            .as_ref()
            .unwrap();
        assert_eq!(response.response["output"]["error"], "command not found");
    }

    #[test]
    fn test_image_becomes_inline_data() {
        let request = simple_request(json!([
            {"type": "image", "source": {
                "type": "base64", "media_type": "image/png", "data": "aWJt"
            }},
            {"type": "text", "text": "what is this"}
        ]));

        let body =
            build_upstream_request(&request, &route(false), "proj-1", "-1", &config()).unwrap();
        let parts = &body.request.contents[0].parts;
        let inline = parts[0].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "aWJt");
        assert_eq!(parts[1].text.as_deref(), Some("what is this"));
    }

    #[test]
    fn test_empty_tools_accepted() {
        let mut request = simple_request(json!("hi"));
        request.tools = Some(vec![]);
        let body =
            build_upstream_request(&request, &route(false), "proj-1", "-1", &config()).unwrap();
        assert!(body.request.tools.is_none());
    }

    #[test]
    fn test_bad_tool_schema_rejected() {
        let mut request = simple_request(json!("hi"));
        request.tools = Some(vec![AnthropicTool {
            name: "weird".to_string(),
            description: None,
            input_schema: json!({"type": "string"}),
        }]);

        let err = build_upstream_request(&request, &route(false), "proj-1", "-1", &config())
            .unwrap_err();
        assert_eq!(err.error_type(), "schema_invalid");
        assert!(err.to_string().contains("weird"));
    }

    #[test]
    fn test_tool_coercion_applied() {
        let mut request = simple_request(json!("hi"));
        request.tools = Some(vec![AnthropicTool {
            name: "read_file".to_string(),
            description: Some("Reads a file".to_string()),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "file_path": {"type": "string", "format": "uri", "default": "a.md"}
                },
                "required": ["file_path"]
            }),
        }]);

        let body =
            build_upstream_request(&request, &route(false), "proj-1", "-1", &config()).unwrap();
        let declaration = &body.request.tools.unwrap()[0].function_declarations[0];
        assert_eq!(declaration.name, "read_file");
        assert!(declaration.parameters.get("additionalProperties").is_none());
        assert!(declaration.parameters["properties"]["file_path"]
            .get("format")
            .is_none());
        assert!(declaration.parameters["properties"]["file_path"]
            .get("default")
            .is_none());
    }

    #[test]
    fn test_headers_for_thinking_stream() {
        let headers = build_headers("ya29.tok", true, true);
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap().to_str().unwrap(),
            "Bearer ya29.tok"
        );
        assert_eq!(
            headers.get(ACCEPT).unwrap().to_str().unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            headers.get("anthropic-beta").unwrap().to_str().unwrap(),
            INTERLEAVED_THINKING_BETA
        );
        let ua = headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(ua.starts_with("antigravity/"));
        let metadata = headers.get("client-metadata").unwrap().to_str().unwrap();
        assert!(metadata.contains("ANTIGRAVITY"));
    }

    #[test]
    fn test_headers_without_thinking() {
        let headers = build_headers("ya29.tok", false, false);
        assert!(headers.get("anthropic-beta").is_none());
        assert!(headers.get(ACCEPT).is_none());
    }
}
