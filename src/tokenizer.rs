// Token counting module
// Provides approximate token counting for the count_tokens route and for
// usage fallbacks when the upstream sends no metadata
//
// This is an estimate: the exact upstream tokenizers are not public. Uses
// character-based estimation with a correction factor; Claude-family models
// tokenize roughly 15% denser than the cl100k_base baseline.

use serde_json::Value;

use crate::models::anthropic::{AnthropicMessage, AnthropicTool};

/// Correction coefficient applied for Claude-family counting profiles.
const CLAUDE_CORRECTION_FACTOR: f64 = 1.15;

/// Which correction profile to use, selected by `TOKEN_COUNTER_MODEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterProfile {
    Claude,
    Neutral,
}

impl CounterProfile {
    pub fn from_model(model: &str) -> Self {
        if model.to_lowercase().contains("claude") {
            CounterProfile::Claude
        } else {
            CounterProfile::Neutral
        }
    }

    fn factor(self) -> f64 {
        match self {
            CounterProfile::Claude => CLAUDE_CORRECTION_FACTOR,
            CounterProfile::Neutral => 1.0,
        }
    }
}

/// Approximate token count for a piece of text: ~4 characters per token.
pub fn count_text_tokens(text: &str) -> i32 {
    if text.is_empty() {
        return 0;
    }
    (text.len() / 4 + 1) as i32
}

/// Count input tokens for a request: system prompt, every message block,
/// and tool declarations, plus small per-item structure overheads.
pub fn count_input_tokens(
    messages: &[AnthropicMessage],
    system: Option<&Value>,
    tools: Option<&Vec<AnthropicTool>>,
    profile: CounterProfile,
) -> i32 {
    if messages.is_empty() && system.is_none() && tools.is_none() {
        return 0;
    }

    let mut total = 0;

    if let Some(sys) = system {
        total += 4;
        match sys {
            Value::String(s) => total += count_text_tokens(s),
            Value::Array(blocks) => {
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        total += count_text_tokens(text);
                    }
                }
            }
            _ => {}
        }
    }

    for message in messages {
        // Role plus delimiters
        total += 4;
        total += count_text_tokens(&message.role);
        total += count_content_tokens(&message.content);
    }

    if let Some(tools) = tools {
        for tool in tools {
            total += 4;
            total += count_text_tokens(&tool.name);
            if let Some(desc) = &tool.description {
                total += count_text_tokens(desc);
            }
            let schema = serde_json::to_string(&tool.input_schema).unwrap_or_default();
            total += count_text_tokens(&schema);
        }
    }

    total += 3;

    (total as f64 * profile.factor()) as i32
}

fn count_content_tokens(content: &Value) -> i32 {
    let mut total = 0;

    match content {
        Value::String(s) => total += count_text_tokens(s),
        Value::Array(blocks) => {
            for block in blocks {
                let Some(obj) = block.as_object() else {
                    continue;
                };
                match obj.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                            total += count_text_tokens(text);
                        }
                    }
                    Some("image") => {
                        // Flat rate; actual cost depends on dimensions
                        total += 100;
                    }
                    Some("tool_use") => {
                        total += 4;
                        if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
                            total += count_text_tokens(name);
                        }
                        if let Some(input) = obj.get("input") {
                            let s = serde_json::to_string(input).unwrap_or_default();
                            total += count_text_tokens(&s);
                        }
                    }
                    Some("tool_result") => {
                        total += 4;
                        if let Some(inner) = obj.get("content") {
                            match inner {
                                Value::String(s) => total += count_text_tokens(s),
                                Value::Array(parts) => {
                                    for part in parts {
                                        if let Some(text) =
                                            part.get("text").and_then(|t| t.as_str())
                                        {
                                            total += count_text_tokens(text);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = obj.get("thinking").and_then(|t| t.as_str()) {
                            total += count_text_tokens(text);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    total
}
