//! Typed schema for the Antigravity upstream wire protocol.
//!
//! Antigravity wraps a Gemini-style generate-content request in an envelope
//! carrying the managed project id and request bookkeeping, and exposes the
//! matching `generateContent` / `streamGenerateContent` pair under
//! `/v1internal`. Responses may arrive wrapped as `{"response": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const USER_AGENT_PRODUCT: &str = "antigravity";
pub const REQUEST_TYPE: &str = "agent";

// ==================================================================================================
// Request envelope
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntigravityRequestBody {
    pub project: String,
    pub model: String,
    pub request: GenerateContentRequest,
    pub request_type: String,
    pub request_id: String,
    pub user_agent: String,
}

impl AntigravityRequestBody {
    pub fn new(project: String, model: String, request: GenerateContentRequest) -> Self {
        Self {
            project,
            model,
            request,
            request_type: REQUEST_TYPE.to_string(),
            request_id: format!("agent-{}", uuid::Uuid::new_v4()),
            user_agent: USER_AGENT_PRODUCT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A single conversation turn. Role is `"user"` or `"model"`; absent only
/// would be unusual here, but the upstream requires `role:"user"` even for
/// the system instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Some("model".to_string()),
            parts,
        }
    }
}

/// One atomic piece of content inside a turn. At most one data field is set;
/// `thought` marks a text part as model reasoning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,

    /// Opaque reusable thought signature (base64 string)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            thought: Some(true),
            ..Self::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<Value>,
}

// ==================================================================================================
// Response shapes
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<i32>,
}

/// Peel the `/v1internal` wrapper off a response value, if present.
pub fn unwrap_internal(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("response") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrips() {
        let input = json!({
            "project": "test-project",
            "model": "claude-sonnet-4-5",
            "request": {
                "contents": [{"role": "user", "parts": [{"text": "hello"}]}],
                "sessionId": "-42"
            },
            "requestType": "agent",
            "requestId": "agent-00000000-0000-4000-8000-000000000000",
            "userAgent": "antigravity"
        });
        let body: AntigravityRequestBody = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(serde_json::to_value(&body).unwrap(), input);
    }

    #[test]
    fn test_new_fills_fixed_fields() {
        let body = AntigravityRequestBody::new(
            "proj-1".to_string(),
            "claude-sonnet-4-5".to_string(),
            GenerateContentRequest {
                contents: vec![Content::user(vec![Part::text("hi")])],
                ..Default::default()
            },
        );
        assert_eq!(body.user_agent, "antigravity");
        assert_eq!(body.request_type, "agent");
        assert!(body.request_id.starts_with("agent-"));
    }

    #[test]
    fn test_thought_part_roundtrip() {
        let input = json!({"text": "planning", "thought": true, "thoughtSignature": "c2ln"});
        let part: Part = serde_json::from_value(input.clone()).unwrap();
        assert!(part.is_thought());
        assert_eq!(part.thought_signature.as_deref(), Some("c2ln"));
        assert_eq!(serde_json::to_value(&part).unwrap(), input);
    }

    #[test]
    fn test_function_call_default_args() {
        let part: Part =
            serde_json::from_value(json!({"functionCall": {"name": "read_file"}})).unwrap();
        let call = part.function_call.unwrap();
        assert_eq!(call.name, "read_file");
        assert!(call.args.is_null());
        assert!(call.id.is_none());
    }

    #[test]
    fn test_response_parsing() {
        let raw = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "pong"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1}
        });
        let resp: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.candidates[0].finish_reason.as_deref(), Some("STOP"));
        assert_eq!(
            resp.usage_metadata.unwrap().candidates_token_count,
            Some(1)
        );
    }

    #[test]
    fn test_unwrap_internal() {
        let wrapped = json!({"response": {"candidates": []}});
        assert_eq!(unwrap_internal(wrapped), json!({"candidates": []}));

        let bare = json!({"candidates": []});
        assert_eq!(unwrap_internal(bare.clone()), bare);
    }
}
