//! Managed project-id discovery via `loadCodeAssist`.
//!
//! Discovery always targets the production host: the sandbox hosts return
//! inconsistent project metadata. The response is searched depth-first for a
//! managed project id under `cloudaicompanionProject` and nested
//! `allowedIntegrations[*].projectId`; the first non-empty match wins.

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

use crate::endpoints::PRODUCTION_ENDPOINT;

/// Client metadata block sent on discovery and on every generate request.
pub fn client_metadata() -> Value {
    json!({
        "ideType": "ANTIGRAVITY",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI"
    })
}

pub fn discovery_url() -> String {
    format!("https://{}/v1internal:loadCodeAssist", PRODUCTION_ENDPOINT)
}

/// Call `loadCodeAssist` and extract a managed project id, passing the
/// last-known id as a `duetProject` hint when available.
pub async fn discover_project_id(
    client: &Client,
    url: &str,
    access_token: &str,
    duet_hint: Option<&str>,
) -> Result<Option<String>> {
    let mut body = json!({ "metadata": client_metadata() });
    if let Some(hint) = duet_hint {
        body["duetProject"] = json!(hint);
    }

    let response = client
        .post(url)
        .bearer_auth(access_token)
        .json(&body)
        .send()
        .await
        .context("loadCodeAssist request failed")?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("loadCodeAssist returned {}: {}", status, text);
    }

    let parsed: Value = response
        .json()
        .await
        .context("failed to parse loadCodeAssist response")?;

    Ok(find_project_id(&parsed))
}

/// Depth-first search for the managed project id.
pub fn find_project_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(id) = map
                .get("cloudaicompanionProject")
                .and_then(project_id_string)
            {
                return Some(id);
            }
            if let Some(integrations) = map.get("allowedIntegrations").and_then(|v| v.as_array()) {
                for integration in integrations {
                    if let Some(id) = integration.get("projectId").and_then(project_id_string) {
                        return Some(id);
                    }
                }
            }
            map.values().find_map(find_project_id)
        }
        Value::Array(items) => items.iter().find_map(find_project_id),
        _ => None,
    }
}

/// A project field may be a bare string or an object with an `id`.
fn project_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from),
        _ => None,
    }
}

/// Placeholder project id used until discovery succeeds.
pub fn transient_project_id() -> String {
    format!("transient-{}", uuid::Uuid::new_v4())
}
