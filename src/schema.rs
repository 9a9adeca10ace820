//! JSON Schema coercion for tool declarations, plus tool-call argument repair.
//!
//! The upstream accepts a narrow JSON Schema subset. This module strips the
//! keywords it rejects, normalizes object nodes, and recursively cleans
//! nested schemas. It also repairs `functionCall.args` coming back from the
//! model: proto-struct envelopes are decoded, obvious key mismatches are
//! healed via a small alias table, and missing required string parameters can
//! be filled from the latest user text. The last two stages are best-effort
//! heuristics behind a config flag; well-formed clients never need them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Keywords the upstream rejects outright.
const FORBIDDEN_KEYWORDS: &[&str] = &["additionalProperties", "default", "$schema", "$id", "examples"];

/// `format` values the upstream accepts; everything else is dropped.
const ACCEPTED_FORMATS: &[&str] = &["date-time", "enum"];

/// Key aliases healed during argument repair, in both directions.
const ARG_ALIASES: &[(&str, &str)] = &[
    ("url", "link"),
    ("query", "prompt"),
    ("path", "file_path"),
];

// ==================================================================================================
// Schema coercion
// ==================================================================================================

/// Coerce a tool `input_schema` into the subset the upstream accepts.
///
/// The top level must describe an object; anything else cannot be expressed
/// as a function declaration and is rejected.
pub fn coerce_tool_schema(schema: &Value) -> Result<Value, String> {
    let obj = match schema {
        Value::Object(obj) => obj.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(format!(
                "input_schema must be an object, got {}",
                type_name(other)
            ))
        }
    };

    if let Some(t) = obj.get("type").and_then(|v| v.as_str()) {
        if t != "object" {
            return Err(format!(
                "input_schema must describe an object, got type \"{t}\""
            ));
        }
    }

    Ok(coerce_node(&Value::Object(obj), true))
}

/// Recursively clean one schema node.
fn coerce_node(schema: &Value, force_object: bool) -> Value {
    let obj = match schema {
        Value::Object(obj) => obj,
        // Non-object nodes inside composition lists get normalized to objects
        _ => return coerce_node(&Value::Object(Map::new()), force_object),
    };

    let mut result = Map::new();

    for (key, value) in obj {
        if FORBIDDEN_KEYWORDS.contains(&key.as_str()) {
            continue;
        }

        match key.as_str() {
            "format" => {
                if value
                    .as_str()
                    .map(|f| ACCEPTED_FORMATS.contains(&f))
                    .unwrap_or(false)
                {
                    result.insert(key.clone(), value.clone());
                }
            }
            "required" => {
                // Empty required arrays confuse the upstream validator
                if value.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
                    result.insert(key.clone(), value.clone());
                }
            }
            "properties" => {
                let props = value
                    .as_object()
                    .map(|props| {
                        props
                            .iter()
                            .map(|(name, prop)| (name.clone(), coerce_node(prop, false)))
                            .collect::<Map<String, Value>>()
                    })
                    .unwrap_or_default();
                result.insert("properties".to_string(), Value::Object(props));
            }
            "items" => {
                let items = match value {
                    Value::Array(arr) => {
                        Value::Array(arr.iter().map(|v| coerce_node(v, false)).collect())
                    }
                    other => coerce_node(other, false),
                };
                result.insert("items".to_string(), items);
            }
            "oneOf" | "anyOf" | "allOf" => {
                if let Some(members) = value.as_array() {
                    let cleaned: Vec<Value> =
                        members.iter().map(|m| coerce_node(m, false)).collect();
                    result.insert(key.clone(), Value::Array(cleaned));
                }
            }
            _ => {
                result.insert(key.clone(), value.clone());
            }
        }
    }

    // Object nodes always declare their type and a properties map, even empty
    let is_object = force_object
        || result
            .get("type")
            .and_then(|v| v.as_str())
            .map(|t| t == "object")
            .unwrap_or_else(|| result.contains_key("properties"));

    if is_object {
        result.insert("type".to_string(), Value::String("object".to_string()));
        result
            .entry("properties".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    Value::Object(result)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ==================================================================================================
// Argument repair
// ==================================================================================================

/// Repair model-produced function-call arguments against the declared schema.
///
/// `last_user_text` feeds the fill-from-text stage; pass the most recent
/// plain-text user message. `heuristics` gates the alias table and
/// fill-from-text stages; proto-envelope decoding always runs.
pub fn repair_function_args(
    args: Value,
    schema: Option<&Value>,
    last_user_text: Option<&str>,
    heuristics: bool,
) -> Value {
    let mut args = decode_proto_struct(args);

    if !args.is_object() {
        // The upstream occasionally emits a bare string of JSON
        if let Some(s) = args.as_str() {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                if parsed.is_object() {
                    args = parsed;
                }
            }
        }
    }

    if !args.is_object() {
        return Value::Object(Map::new());
    }

    if !heuristics {
        return args;
    }

    let required = schema
        .and_then(|s| s.get("required"))
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if required.is_empty() {
        return args;
    }

    let obj = args.as_object_mut().expect("checked above");

    // Stage 1: alias healing, only toward required keys
    for target in &required {
        if obj.contains_key(target.as_str()) {
            continue;
        }
        for (a, b) in ARG_ALIASES {
            let source = if a == target {
                *b
            } else if b == target {
                *a
            } else {
                continue;
            };
            if let Some(value) = obj.remove(source) {
                tracing::debug!("Repaired tool argument key {} -> {}", source, target);
                obj.insert(target.clone(), value);
                break;
            }
        }
    }

    // Stage 2: fill a missing required string parameter from user text
    if let Some(text) = last_user_text {
        for target in &required {
            if obj.contains_key(target.as_str()) {
                continue;
            }
            if let Some(value) = extract_candidate_from_text(target, text) {
                tracing::debug!("Filled missing tool argument {} from user text", target);
                obj.insert(target.clone(), Value::String(value));
            }
        }
    }

    args
}

/// Decode a protobuf Struct JSON envelope into plain JSON, recursively.
/// Anything that does not look like an envelope passes through unchanged.
pub fn decode_proto_struct(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if map.len() == 1 {
                if let Some(fields) = map.get("fields").and_then(|f| f.as_object()).cloned() {
                    let mut out = Map::new();
                    for (k, v) in fields {
                        out.insert(k, decode_proto_value(v));
                    }
                    return Value::Object(out);
                }
            }
            for (_, v) in map.iter_mut() {
                let taken = std::mem::take(v);
                *v = decode_proto_struct(taken);
            }
            Value::Object(map)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(decode_proto_struct).collect())
        }
        other => other,
    }
}

fn decode_proto_value(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };

    if let Some(s) = map.get("stringValue") {
        return s.clone();
    }
    if let Some(n) = map.get("numberValue") {
        return n.clone();
    }
    if let Some(b) = map.get("boolValue") {
        return b.clone();
    }
    if map.contains_key("nullValue") {
        return Value::Null;
    }
    if let Some(list) = map.get("listValue") {
        let values = list
            .get("values")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        return Value::Array(values.into_iter().map(decode_proto_value).collect());
    }
    if let Some(s) = map.get("structValue") {
        return decode_proto_struct(s.clone());
    }

    Value::Object(map)
}

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)\]>'\x22]+").unwrap());
static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:~?/)?[\w.\-]+(?:/[\w.\-]+)*\.[A-Za-z0-9]{1,8}\b").unwrap());
static QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)"|'([^']+)'"#).unwrap());

/// Pull a single value matching the parameter's declared semantic out of the
/// user text. Requires exactly one match; ambiguity means no repair.
fn extract_candidate_from_text(param: &str, text: &str) -> Option<String> {
    let lower = param.to_lowercase();

    let regex: &Regex = if lower.contains("url") || lower.contains("link") {
        &URL_RE
    } else if lower.contains("path") || lower.contains("file") {
        &PATH_RE
    } else if lower.contains("query") || lower.contains("prompt") {
        &QUOTED_RE
    } else {
        return None;
    };

    let mut matches = regex.find_iter(text);
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }

    let raw = first.as_str();
    // Strip surrounding quotes from the quoted-phrase match
    let cleaned = raw.trim_matches(|c| c == '"' || c == '\'');
    Some(cleaned.to_string())
}
