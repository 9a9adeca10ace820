// Protocol translation between the Anthropic Messages API and the
// Antigravity upstream envelope

pub mod request;
pub mod response;

use serde_json::Value;

use crate::models::anthropic::AnthropicMessage;

/// Gateway's upstream product version, reported in User-Agent and
/// X-Goog-Api-Client.
pub const ANTIGRAVITY_VERSION: &str = "1.16.5";

/// Extract the system prompt text. Clients send either a plain string or a
/// list of text blocks (possibly carrying cache_control fields we ignore).
pub fn extract_system_prompt(system: &Option<Value>) -> String {
    let Some(system) = system else {
        return String::new();
    };

    if let Some(text) = system.as_str() {
        return text.to_string();
    }

    if let Some(blocks) = system.as_array() {
        let parts: Vec<String> = blocks
            .iter()
            .filter_map(|block| {
                if block.get("type")?.as_str()? == "text" {
                    Some(block.get("text")?.as_str()?.to_string())
                } else {
                    None
                }
            })
            .collect();
        return parts.join("\n");
    }

    system.to_string()
}

/// The most recent plain-text user message; feeds best-effort argument
/// repair. Tool results and images are not user prose and are skipped.
pub fn last_user_text(messages: &[AnthropicMessage]) -> Option<String> {
    messages.iter().rev().find_map(|msg| {
        if msg.role != "user" {
            return None;
        }
        if let Some(text) = msg.content.as_str() {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
        let blocks = msg.content.as_array()?;
        let joined = blocks
            .iter()
            .filter_map(|block| {
                if block.get("type")?.as_str()? == "text" {
                    block.get("text")?.as_str().map(String::from)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
