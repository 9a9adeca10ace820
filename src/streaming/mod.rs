//! Streaming bridge: upstream chunked responses -> Anthropic SSE events.
//!
//! The upstream wire form is either SSE (`data: {...}` events) or
//! newline-delimited / array-framed JSON; both are accepted by the same
//! decoder. Each decoded frame is a generate-content delta whose parts drive
//! an explicit per-request state machine that emits the client event
//! sequence:
//!
//! ```text
//! message_start
//! (content_block_start (content_block_delta | input_json_delta)* content_block_stop)*
//! message_delta
//! message_stop
//! ```
//!
//! Once `message_start` has been written the stream is committed: any later
//! failure degrades to `message_delta {stop_reason:"error"}` followed by
//! `message_stop`, never a dangling stream.

use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ApiError;
use crate::models::anthropic::{AnthropicMessagesResponse, ContentBlock};
use crate::models::antigravity::{unwrap_internal, GenerateContentResponse, Part};
use crate::converters::response::{map_stop_reason, new_message_id, new_tool_use_id};
use crate::tokenizer::count_text_tokens;

// ==================================================================================================
// SSE formatting
// ==================================================================================================

/// Anthropic SSE framing:
/// ```text
/// event: {event_type}
/// data: {json}
///
/// ```
fn format_sse_event(event_type: &str, data: &Value) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string())
    )
}

// ==================================================================================================
// Frame decoder
// ==================================================================================================

/// Rolling-buffer decoder for the upstream chunk stream.
///
/// Frames are top-level JSON objects, possibly prefixed by SSE `data:`
/// markers, separated by newlines, commas or array brackets. A frame that
/// brace-matches but fails to parse is retained for a bounded number of
/// feeds before being discarded to the next framing boundary.
pub struct FrameDecoder {
    buffer: String,
    max_parse_retries: u32,
    parse_failures: u32,
    buffer_limit: usize,
    malformed_count: u64,
}

impl FrameDecoder {
    pub fn new(max_parse_retries: u32, buffer_limit: usize) -> Self {
        Self {
            buffer: String::new(),
            max_parse_retries,
            parse_failures: 0,
            buffer_limit,
            malformed_count: 0,
        }
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    /// Feed raw bytes, returning every complete frame decoded so far.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Value>, ApiError> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        if self.buffer.len() > self.buffer_limit {
            self.malformed_count += 1;
            return Err(ApiError::MalformedChunk(format!(
                "chunk buffer exceeded {} bytes",
                self.buffer_limit
            )));
        }

        let mut frames = Vec::new();

        loop {
            self.skip_framing_noise();

            let Some(start) = self.buffer.find('{') else {
                break;
            };
            // Drop whatever precedes the object; it is framing we ignore
            if start > 0 {
                self.buffer.drain(..start);
            }

            let Some(end) = find_matching_brace(&self.buffer, 0) else {
                // Incomplete frame, wait for more bytes
                break;
            };

            let frame = &self.buffer[..=end];
            match serde_json::from_str::<Value>(frame) {
                Ok(value) => {
                    self.buffer.drain(..=end);
                    self.parse_failures = 0;
                    frames.push(value);
                }
                Err(e) => {
                    self.parse_failures += 1;
                    if self.parse_failures >= self.max_parse_retries {
                        tracing::warn!(
                            "Discarding malformed frame after {} attempts: {}",
                            self.parse_failures,
                            e
                        );
                        self.malformed_count += 1;
                        self.parse_failures = 0;
                        self.discard_to_next_boundary(end);
                        continue;
                    }
                    // Retain and retry once more bytes arrive
                    break;
                }
            }
        }

        Ok(frames)
    }

    /// Skip SSE markers, separators and the DONE sentinel ahead of the next
    /// object.
    fn skip_framing_noise(&mut self) {
        loop {
            let trimmed = self
                .buffer
                .trim_start_matches([' ', '\t', '\r', '\n', ',', '[', ']']);
            let trimmed = trimmed
                .strip_prefix("data:")
                .map(|rest| rest.trim_start_matches(' '))
                .unwrap_or(trimmed);
            let trimmed = trimmed.strip_prefix("[DONE]").unwrap_or(trimmed);

            if trimmed.len() == self.buffer.len() {
                return;
            }
            let cut = self.buffer.len() - trimmed.len();
            self.buffer.drain(..cut);
        }
    }

    fn discard_to_next_boundary(&mut self, failed_frame_end: usize) {
        let rest = &self.buffer[failed_frame_end + 1..];
        let next = rest
            .find('\n')
            .map(|p| failed_frame_end + 1 + p + 1)
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..next);
    }
}

/// Position of the matching closing brace, honoring strings and escapes.
fn find_matching_brace(text: &str, start_pos: usize) -> Option<usize> {
    let bytes = text.as_bytes();

    if start_pos >= bytes.len() || bytes[start_pos] != b'{' {
        return None;
    }

    let mut brace_count = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate().skip(start_pos) {
        if escape_next {
            escape_next = false;
            continue;
        }

        if ch == b'\\' && in_string {
            escape_next = true;
            continue;
        }

        if ch == b'"' {
            in_string = !in_string;
            continue;
        }

        if !in_string {
            if ch == b'{' {
                brace_count += 1;
            } else if ch == b'}' {
                brace_count -= 1;
                if brace_count == 0 {
                    return Some(i);
                }
            }
        }
    }

    None
}

// ==================================================================================================
// Event state machine
// ==================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text(i32),
    Thinking(i32),
}

/// Per-request translator from upstream deltas to client events. Owned
/// exclusively by the request task; no internal locking.
pub struct StreamBridge {
    message_id: String,
    model: String,
    input_tokens: i32,
    tool_schemas: HashMap<String, Value>,
    last_user_text: Option<String>,
    repair_enabled: bool,

    started: bool,
    finished: bool,
    next_index: i32,
    open: OpenBlock,
    saw_tool_call: bool,
    finish_reason: Option<String>,
    reported_output_tokens: Option<i32>,
    output_chars: usize,
}

impl StreamBridge {
    pub fn new(
        model: String,
        input_tokens: i32,
        tool_schemas: HashMap<String, Value>,
        last_user_text: Option<String>,
        repair_enabled: bool,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            model,
            input_tokens,
            tool_schemas,
            last_user_text,
            repair_enabled,
            started: false,
            finished: false,
            next_index: 0,
            open: OpenBlock::None,
            saw_tool_call: false,
            finish_reason: None,
            reported_output_tokens: None,
            output_chars: 0,
        }
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process one decoded frame. The `/v1internal` wrapper is peeled first;
    /// frames that do not parse as generate-content deltas are skipped.
    pub fn on_frame(&mut self, frame: Value) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        let unwrapped = unwrap_internal(frame);
        let response: GenerateContentResponse = match serde_json::from_value(unwrapped) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Skipping non-delta frame: {}", e);
                return out;
            }
        };

        self.ensure_started(&mut out);

        if let Some(metadata) = &response.usage_metadata {
            if let Some(output) = metadata.candidates_token_count {
                self.reported_output_tokens = Some(output);
            }
        }

        let mut finish_reason = None;
        if let Some(candidate) = response.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    self.on_part(part, &mut out);
                }
            }
            finish_reason = candidate.finish_reason.clone();
        }

        if let Some(reason) = finish_reason {
            self.finish_reason = Some(reason);
            out.extend(self.finish());
        }

        out
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;

        let message_start = json!({
            "type": "message_start",
            "message": {
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": 0
                }
            }
        });
        out.push(format_sse_event("message_start", &message_start));
    }

    fn on_part(&mut self, part: &Part, out: &mut Vec<String>) {
        if let Some(call) = &part.function_call {
            self.emit_tool_use(call.clone(), out);
            return;
        }

        let Some(text) = &part.text else {
            return;
        };
        if text.is_empty() {
            return;
        }
        self.output_chars += text.len();

        if part.is_thought() {
            let index = match self.open {
                OpenBlock::Thinking(idx) => idx,
                _ => self.open_block(out, "thinking", json!({"type": "thinking", "thinking": ""})),
            };
            self.open = OpenBlock::Thinking(index);

            let delta = json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "thinking_delta", "thinking": text}
            });
            out.push(format_sse_event("content_block_delta", &delta));
        } else {
            let index = match self.open {
                OpenBlock::Text(idx) => idx,
                _ => self.open_block(out, "text", json!({"type": "text", "text": ""})),
            };
            self.open = OpenBlock::Text(index);

            let delta = json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text}
            });
            out.push(format_sse_event("content_block_delta", &delta));
        }
    }

    /// Close whatever block is open and start a new one of `kind`.
    fn open_block(&mut self, out: &mut Vec<String>, _kind: &str, meta: Value) -> i32 {
        self.close_open(out);

        let index = self.next_index;
        self.next_index += 1;

        let block_start = json!({
            "type": "content_block_start",
            "index": index,
            "content_block": meta
        });
        out.push(format_sse_event("content_block_start", &block_start));
        index
    }

    fn close_open(&mut self, out: &mut Vec<String>) {
        let index = match self.open {
            OpenBlock::None => return,
            OpenBlock::Text(idx) | OpenBlock::Thinking(idx) => idx,
        };
        self.open = OpenBlock::None;

        let block_stop = json!({"type": "content_block_stop", "index": index});
        out.push(format_sse_event("content_block_stop", &block_stop));
    }

    /// A complete tool-use block: start with empty input, the repaired
    /// arguments as one input_json_delta, then stop. The delta is the only
    /// channel by which clients receive the arguments.
    fn emit_tool_use(
        &mut self,
        call: crate::models::antigravity::FunctionCall,
        out: &mut Vec<String>,
    ) {
        self.close_open(out);
        self.saw_tool_call = true;

        let index = self.next_index;
        self.next_index += 1;

        let input = crate::schema::repair_function_args(
            call.args,
            self.tool_schemas.get(&call.name),
            self.last_user_text.as_deref(),
            self.repair_enabled,
        );
        let input_json = serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
        self.output_chars += input_json.len();

        let block_start = json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {
                "type": "tool_use",
                "id": call.id.unwrap_or_else(new_tool_use_id),
                "name": call.name,
                "input": {}
            }
        });
        out.push(format_sse_event("content_block_start", &block_start));

        let delta = json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "input_json_delta", "partial_json": input_json}
        });
        out.push(format_sse_event("content_block_delta", &delta));

        let block_stop = json!({"type": "content_block_stop", "index": index});
        out.push(format_sse_event("content_block_stop", &block_stop));
    }

    fn output_tokens(&self) -> i32 {
        self.reported_output_tokens
            .unwrap_or_else(|| (self.output_chars / 4) as i32)
    }

    /// Normal termination: close any open block, then message_delta and
    /// message_stop.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open(&mut out);

        let stop_reason = map_stop_reason(self.finish_reason.as_deref(), self.saw_tool_call);
        let message_delta = json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"output_tokens": self.output_tokens()}
        });
        out.push(format_sse_event("message_delta", &message_delta));
        out.push(format_sse_event("message_stop", &json!({"type": "message_stop"})));
        out
    }

    /// Mid-stream failure: same tail with stop_reason "error". The stream
    /// still ends with message_stop.
    pub fn finish_with_error(&mut self) -> Vec<String> {
        self.finish_reason = Some("ERROR".to_string());
        self.saw_tool_call = false;
        self.finish()
    }
}

// ==================================================================================================
// Stream driver
// ==================================================================================================

struct DriverState {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: FrameDecoder,
    bridge: StreamBridge,
    idle_timeout: Duration,
    done: bool,
}

/// Drive an upstream response through the bridge, yielding SSE strings.
///
/// Client disconnects drop this stream, which cancels the upstream read.
/// Every other failure mode (read error, idle timeout, framing breakdown)
/// ends with the in-band error tail.
pub fn bridge_stream(
    upstream: reqwest::Response,
    bridge: StreamBridge,
    decoder: FrameDecoder,
    idle_timeout: Duration,
) -> BoxStream<'static, String> {
    let state = DriverState {
        bytes: upstream.bytes_stream().boxed(),
        decoder,
        bridge,
        idle_timeout,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let batch: Vec<String> =
            match tokio::time::timeout(state.idle_timeout, state.bytes.next()).await {
                Err(_) => {
                    tracing::warn!("Upstream read idle timeout, ending stream");
                    state.done = true;
                    state.bridge.finish_with_error()
                }
                Ok(None) => {
                    state.done = true;
                    state.bridge.finish()
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("Upstream read failed mid-stream: {}", e);
                    state.done = true;
                    state.bridge.finish_with_error()
                }
                Ok(Some(Ok(chunk))) => match state.decoder.feed(&chunk) {
                    Ok(frames) => {
                        let mut events = Vec::new();
                        for frame in frames {
                            events.extend(state.bridge.on_frame(frame));
                        }
                        if state.bridge.is_finished() {
                            state.done = true;
                        }
                        events
                    }
                    Err(e) => {
                        tracing::warn!("Stream framing broke: {}", e);
                        state.done = true;
                        state.bridge.finish_with_error()
                    }
                },
            };

        Some((futures::stream::iter(batch), state))
    })
    .flatten()
    .boxed()
}

// ==================================================================================================
// Replay of a completed message
// ==================================================================================================

/// Emit a finished message as the full event sequence. Used when streaming
/// to the upstream is disabled but the client asked for SSE.
pub fn message_to_sse(message: &AnthropicMessagesResponse) -> Vec<String> {
    let mut out = Vec::new();

    let message_start = json!({
        "type": "message_start",
        "message": {
            "id": message.id,
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": message.model,
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": message.usage.input_tokens, "output_tokens": 0}
        }
    });
    out.push(format_sse_event("message_start", &message_start));

    for (index, block) in message.content.iter().enumerate() {
        let index = index as i32;
        match block {
            ContentBlock::Text { text } => {
                out.push(format_sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""}
                    }),
                ));
                out.push(format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }
            ContentBlock::Thinking {
                thinking,
                signature: _,
            } => {
                out.push(format_sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "thinking", "thinking": ""}
                    }),
                ));
                out.push(format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": thinking}
                    }),
                ));
            }
            ContentBlock::ToolUse { id, name, input } => {
                out.push(format_sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {
                            "type": "tool_use", "id": id, "name": name, "input": {}
                        }
                    }),
                ));
                out.push(format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": serde_json::to_string(input)
                                .unwrap_or_else(|_| "{}".to_string())
                        }
                    }),
                ));
            }
            _ => continue,
        }
        out.push(format_sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        ));
    }

    let output_tokens = if message.usage.output_tokens > 0 {
        message.usage.output_tokens
    } else {
        message
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => count_text_tokens(text),
                _ => 0,
            })
            .sum()
    };

    out.push(format_sse_event(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": message.stop_reason.as_deref().unwrap_or("end_turn"),
                "stop_sequence": null
            },
            "usage": {"output_tokens": output_tokens}
        }),
    ));
    out.push(format_sse_event("message_stop", &json!({"type": "message_stop"})));
    out
}
