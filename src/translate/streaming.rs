//! State machines that turn a stream of unified chunks into wire events.
//!
//! Both encoders consume the same input: content deltas, tool-call deltas and
//! exactly one terminal chunk carrying `finish_reason` and `usage`. A tool-call
//! fragment with a non-empty id that differs from the open call starts a new
//! call; an empty id continues the open one.
//!
//! Content blocks are strictly sequential. Text arriving while a tool block is
//! open closes the tool block first, and vice versa, so blocks never overlap.

use std::collections::HashMap;

use crate::error::GatewayError;
use crate::unified::{FinishReason, ToolCall, UnifiedResponse};

use super::anthropic::{new_message_id, stop_reason_to_wire};
use super::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent,
    Usage,
};
use super::openai::{encode_usage, error_response, finish_reason_to_wire, new_completion_id};
use super::openai_types::{
    ChatCompletionChunk, ChatErrorResponse, ChatUsage, ChunkChoice, ChunkDelta, ChunkToolCall,
    ChunkToolCallFunction,
};

/// A tool call whose block is open in the current message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenToolCall {
    pub id: String,
    pub name: String,
    pub partial_arguments: String,
}

/// Per-stream encoder state. Owned by one in-flight call and dropped with it.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub message_id: String,
    pub model: String,
    pub content_block_index: usize,
    pub has_open_text_block: bool,
    pub open_tool_calls: Vec<OpenToolCall>,
}

impl StreamState {
    fn new(message_id: String, model: &str) -> Self {
        Self {
            message_id,
            model: model.to_string(),
            content_block_index: 0,
            has_open_text_block: false,
            open_tool_calls: Vec::new(),
        }
    }

    /// Whether `call` starts a new tool call rather than continuing the open one.
    fn starts_new_call(&self, call: &ToolCall) -> bool {
        if call.id.is_empty() {
            return self.open_tool_calls.is_empty();
        }
        self.open_tool_calls.last().map(|open| open.id != call.id).unwrap_or(true)
    }
}

/// Split a terminal chunk that also carries content into a content chunk
/// followed by an empty terminal chunk.
fn split_terminal(chunk: &UnifiedResponse) -> (Option<UnifiedResponse>, Option<FinishReason>) {
    let has_payload =
        chunk.content.as_deref().is_some_and(|c| !c.is_empty()) || !chunk.tool_calls.is_empty();
    let payload = has_payload.then(|| UnifiedResponse {
        finish_reason: None,
        usage: None,
        ..chunk.clone()
    });
    (payload, chunk.finish_reason)
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

/// Encodes unified chunks as Anthropic Messages SSE events.
///
/// Usage:
///   let mut encoder = AnthropicStreamEncoder::new("claude-sonnet-4-20250514");
///   for chunk in chunks {
///       for event in encoder.process(&chunk) {
///           // send as `event: {event.event_name()}`
///       }
///   }
///   let trailing = encoder.finish();
#[derive(Debug)]
pub struct AnthropicStreamEncoder {
    state: StreamState,
    started: bool,
    closed: bool,
}

impl AnthropicStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::new(new_message_id(), model),
            started: false,
            closed: false,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process one unified chunk, returning zero or more events.
    pub fn process(&mut self, chunk: &UnifiedResponse) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }

        let mut events = Vec::new();

        if !self.started {
            if !chunk.model.is_empty() {
                self.state.model = chunk.model.clone();
            }
            let input_tokens = chunk.usage.map(|u| u.prompt_tokens).unwrap_or(0);
            events.push(self.make_message_start(input_tokens));
            self.started = true;
        }

        if chunk.is_terminal() {
            let (payload, finish) = split_terminal(chunk);
            if let Some(payload) = payload {
                self.push_deltas(&payload, &mut events);
            }
            let input_tokens = chunk.usage.map(|u| u.prompt_tokens);
            let output_tokens = chunk.usage.map(|u| u.completion_tokens).unwrap_or(0);
            let finish = finish.unwrap_or(FinishReason::Completed);
            events.append(&mut self.make_finish_events(finish, input_tokens, output_tokens));
        } else {
            self.push_deltas(chunk, &mut events);
        }

        events
    }

    /// Close the message if no terminal chunk was seen.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !self.started {
            events.push(self.make_message_start(0));
            self.started = true;
        }
        events.append(&mut self.make_finish_events(FinishReason::Completed, None, 0));
        events
    }

    /// A terminal `error` event for a failure after the stream began. An open
    /// content block is stopped first.
    pub fn error(&mut self, err: &GatewayError) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut events = Vec::new();
        self.close_open_block(&mut events);
        events.push(StreamEvent::Error {
            error: ErrorBody {
                error_type: err.kind().to_string(),
                message: err.to_string(),
            },
        });
        events
    }

    fn push_deltas(&mut self, chunk: &UnifiedResponse, events: &mut Vec<StreamEvent>) {
        if let Some(text) = chunk.content.as_deref().filter(|t| !t.is_empty()) {
            if !self.state.open_tool_calls.is_empty() {
                self.close_open_block(events);
            }
            if !self.state.has_open_text_block {
                events.push(StreamEvent::ContentBlockStart {
                    index: self.state.content_block_index,
                    content_block: ResponseContentBlock::Text {
                        text: String::new(),
                    },
                });
                self.state.has_open_text_block = true;
            }
            events.push(StreamEvent::ContentBlockDelta {
                index: self.state.content_block_index,
                delta: Delta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        for call in &chunk.tool_calls {
            if self.state.starts_new_call(call) {
                self.close_open_block(events);
                events.push(StreamEvent::ContentBlockStart {
                    index: self.state.content_block_index,
                    content_block: ResponseContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });
                self.state.open_tool_calls.push(OpenToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    partial_arguments: String::new(),
                });
            }

            if !call.arguments.is_empty() {
                if let Some(open) = self.state.open_tool_calls.last_mut() {
                    open.partial_arguments.push_str(&call.arguments);
                }
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.state.content_block_index,
                    delta: Delta::InputJsonDelta {
                        partial_json: call.arguments.clone(),
                    },
                });
            }
        }
    }

    /// Close whichever block is open and advance the index.
    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        let open = self.state.has_open_text_block || !self.state.open_tool_calls.is_empty();
        if !open {
            return;
        }
        events.push(StreamEvent::ContentBlockStop {
            index: self.state.content_block_index,
        });
        self.state.has_open_text_block = false;
        self.state.open_tool_calls.clear();
        self.state.content_block_index += 1;
    }

    fn make_message_start(&self, input_tokens: u64) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.state.message_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.state.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens,
                    output_tokens: 0,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                },
            },
        }
    }

    fn make_finish_events(
        &mut self,
        finish: FinishReason,
        input_tokens: Option<u64>,
        output_tokens: u64,
    ) -> Vec<StreamEvent> {
        self.closed = true;
        let mut events = Vec::new();
        self.close_open_block(&mut events);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason_to_wire(finish).to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                input_tokens,
                output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

/// Encodes unified chunks as Chat Completions chunks. The reduced case of the
/// Anthropic machine: no block open/close events, tool calls addressed by index.
#[derive(Debug)]
pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: i64,
    started: bool,
    closed: bool,
    tool_indices: HashMap<String, u64>,
    current_tool: Option<u64>,
}

impl OpenAiStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_completion_id(),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            started: false,
            closed: false,
            tool_indices: HashMap::new(),
            current_tool: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn process(&mut self, chunk: &UnifiedResponse) -> Vec<ChatCompletionChunk> {
        if self.closed {
            return Vec::new();
        }
        if !self.started && !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }

        let mut out = Vec::new();

        if chunk.is_terminal() {
            let (payload, finish) = split_terminal(chunk);
            if let Some(delta) = payload.and_then(|p| self.delta_for(&p)) {
                out.push(self.make_chunk(delta, None, None));
            }
            let finish = finish.unwrap_or(FinishReason::Completed);
            let delta = self.take_role_delta();
            out.push(self.make_chunk(
                delta,
                Some(finish_reason_to_wire(finish).to_string()),
                chunk.usage.as_ref().map(encode_usage),
            ));
            self.closed = true;
        } else if let Some(delta) = self.delta_for(chunk) {
            out.push(self.make_chunk(delta, None, None));
        }

        out
    }

    /// Terminal chunk for a stream that ended without one.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let delta = self.take_role_delta();
        vec![self.make_chunk(delta, Some("stop".to_string()), None)]
    }

    pub fn error(&mut self, err: &GatewayError) -> ChatErrorResponse {
        self.closed = true;
        error_response(err)
    }

    fn take_role_delta(&mut self) -> ChunkDelta {
        let mut delta = ChunkDelta::default();
        if !self.started {
            delta.role = Some("assistant".to_string());
            self.started = true;
        }
        delta
    }

    fn delta_for(&mut self, chunk: &UnifiedResponse) -> Option<ChunkDelta> {
        let content = chunk.content.clone().filter(|c| !c.is_empty());

        let mut tool_calls = Vec::new();
        for call in &chunk.tool_calls {
            let known = self.tool_indices.get(&call.id).copied();
            let is_new = !call.id.is_empty() && known.is_none();

            if is_new {
                let index = self.tool_indices.len() as u64;
                self.tool_indices.insert(call.id.clone(), index);
                self.current_tool = Some(index);
                tool_calls.push(ChunkToolCall {
                    index,
                    id: Some(call.id.clone()),
                    call_type: Some("function".to_string()),
                    function: Some(ChunkToolCallFunction {
                        name: Some(call.name.clone()),
                        arguments: Some(call.arguments.clone()),
                    }),
                });
                continue;
            }

            let Some(index) = known.or(self.current_tool) else {
                continue;
            };
            if call.arguments.is_empty() {
                continue;
            }
            tool_calls.push(ChunkToolCall {
                index,
                id: None,
                call_type: None,
                function: Some(ChunkToolCallFunction {
                    name: None,
                    arguments: Some(call.arguments.clone()),
                }),
            });
        }

        if content.is_none() && tool_calls.is_empty() {
            return None;
        }

        let mut delta = self.take_role_delta();
        delta.content = content;
        delta.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
        Some(delta)
    }

    fn make_chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<ChatUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}
