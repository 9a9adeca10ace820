// Antigravity response -> Anthropic message
//
// Non-streaming translation. Parts map onto content blocks in arrival
// order; function-call arguments are repaired against the declared schemas
// before they reach the client.

use serde_json::Value;
use std::collections::HashMap;

use crate::models::anthropic::{AnthropicMessagesResponse, AnthropicUsage, ContentBlock};
use crate::models::antigravity::{GenerateContentResponse, Part};
use crate::tokenizer::count_text_tokens;

/// Map an upstream finish reason onto the client-facing stop reason. Any
/// function call in the turn wins over the reported reason.
pub fn map_stop_reason(finish_reason: Option<&str>, saw_tool_call: bool) -> &'static str {
    if saw_tool_call {
        return "tool_use";
    }
    match finish_reason.unwrap_or("STOP") {
        "STOP" => "end_turn",
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" => "stop_sequence",
        "ERROR" => "error",
        other => {
            tracing::debug!("Unmapped finish reason \"{}\", treating as end_turn", other);
            "end_turn"
        }
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

/// Convert one upstream part to a content block. Returns None for parts that
/// have no client-facing counterpart.
pub fn part_to_block(
    part: &Part,
    tool_schemas: &HashMap<String, Value>,
    last_user_text: Option<&str>,
    repair_enabled: bool,
) -> Option<ContentBlock> {
    if let Some(call) = &part.function_call {
        let input = crate::schema::repair_function_args(
            call.args.clone(),
            tool_schemas.get(&call.name),
            last_user_text,
            repair_enabled,
        );
        return Some(ContentBlock::ToolUse {
            id: call.id.clone().unwrap_or_else(new_tool_use_id),
            name: call.name.clone(),
            input,
        });
    }

    if let Some(text) = &part.text {
        if part.is_thought() {
            return Some(ContentBlock::Thinking {
                thinking: text.clone(),
                signature: part.thought_signature.clone(),
            });
        }
        return Some(ContentBlock::Text { text: text.clone() });
    }

    None
}

/// Translate a complete upstream response into an Anthropic message. The
/// `model` field echoes the client's original alias, never the upstream id.
pub fn translate_response(
    response: &GenerateContentResponse,
    requested_model: &str,
    tool_schemas: &HashMap<String, Value>,
    last_user_text: Option<&str>,
    repair_enabled: bool,
    estimated_input_tokens: i32,
) -> AnthropicMessagesResponse {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut saw_tool_call = false;
    let mut finish_reason = None;

    if let Some(candidate) = response.candidates.first() {
        finish_reason = candidate.finish_reason.clone();
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if part.function_call.is_some() {
                    saw_tool_call = true;
                }
                if let Some(block) =
                    part_to_block(part, tool_schemas, last_user_text, repair_enabled)
                {
                    blocks.push(block);
                }
            }
        }
    }

    let usage = usage_from(response, estimated_input_tokens, &blocks);

    let mut message = AnthropicMessagesResponse::new(
        new_message_id(),
        requested_model.to_string(),
        blocks,
        usage,
    );
    message.stop_reason =
        Some(map_stop_reason(finish_reason.as_deref(), saw_tool_call).to_string());
    message
}

/// Usage from upstream metadata when present, otherwise estimated from the
/// produced blocks.
fn usage_from(
    response: &GenerateContentResponse,
    estimated_input_tokens: i32,
    blocks: &[ContentBlock],
) -> AnthropicUsage {
    let metadata = response.usage_metadata.as_ref();

    let input_tokens = metadata
        .and_then(|m| m.prompt_token_count)
        .unwrap_or(estimated_input_tokens);

    let output_tokens = metadata
        .and_then(|m| m.candidates_token_count)
        .unwrap_or_else(|| estimate_output_tokens(blocks));

    AnthropicUsage {
        input_tokens,
        output_tokens,
    }
}

pub fn estimate_output_tokens(blocks: &[ContentBlock]) -> i32 {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => count_text_tokens(text),
            ContentBlock::Thinking { thinking, .. } => count_text_tokens(thinking),
            ContentBlock::ToolUse { input, .. } => {
                count_text_tokens(&serde_json::to_string(input).unwrap_or_default())
            }
            _ => 0,
        })
        .sum()
}
