//! Anthropic Messages API: chat with streaming.
//!
//! System prompts are a top-level `system` field rather than a message, and
//! tool results travel as `tool_result` blocks inside a user turn.

use async_trait::async_trait;
use tracing::debug;

use super::openai_compat::chat_payload;
use super::{
    check_status, send_json, sse_data, target_model, unsupported, MappingTables, ProviderAdapter,
    ProviderKind, ResponseStream, RoleTarget,
};
use crate::credentials::Credential;
use crate::error::{GatewayError, Result};
use crate::translate::anthropic::{arguments_value, decode_response, encode_image, encode_tool};
use crate::translate::anthropic_types::{
    ContentBlock, Delta, Message as WireMessage, MessageContent, MessagesRequest, MessagesResponse,
    ResponseContentBlock, Role as WireRole, StreamEvent, SystemContent, ToolChoice as WireToolChoice,
    ToolChoiceAuto, ToolChoiceSpecific, ToolResultContent,
};
use crate::unified::{
    ChatRequest, FinishReason, RequestType, Role, ToolCall, ToolChoice, ToolChoiceMode, UnifiedRequest,
    UnifiedResponse, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub static MAPPINGS: MappingTables = MappingTables {
    roles: &[
        (Role::System, RoleTarget::OutOfBand),
        (Role::Developer, RoleTarget::OutOfBand),
        (Role::User, RoleTarget::Wire("user")),
        (Role::Assistant, RoleTarget::Wire("assistant")),
        (Role::Model, RoleTarget::Wire("assistant")),
        (Role::Tool, RoleTarget::Wire("user")),
        (Role::Function, RoleTarget::Wire("user")),
    ],
    finish_reasons: &[
        ("end_turn", FinishReason::Completed),
        ("stop_sequence", FinishReason::Completed),
        ("pause_turn", FinishReason::Completed),
        ("max_tokens", FinishReason::LengthLimit),
        ("tool_use", FinishReason::ToolCall),
        ("refusal", FinishReason::Filtered),
    ],
    tool_choice: &[
        (ToolChoiceMode::Auto, "auto"),
        (ToolChoiceMode::None, "none"),
        (ToolChoiceMode::Required, "any"),
    ],
};

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_preset(client: reqwest::Client) -> Self {
        Self::new(client, ProviderKind::Anthropic.preset().base_url)
    }

    fn post(&self, credential: &Credential) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &credential.key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }
}

/// Build the upstream request. Consecutive same-role turns are merged, since
/// the Messages API requires user and assistant turns to alternate.
pub(crate) fn build_request(chat: &ChatRequest, model: &str, stream: bool) -> MessagesRequest {
    let mut system_parts: Vec<String> = chat.system_prompt.iter().cloned().collect();
    let mut messages: Vec<WireMessage> = Vec::new();

    for msg in &chat.messages {
        let role = match MAPPINGS.role(msg.role) {
            RoleTarget::OutOfBand => {
                if let Some(text) = &msg.content {
                    system_parts.push(text.clone());
                }
                continue;
            }
            RoleTarget::Wire("assistant") => WireRole::Assistant,
            RoleTarget::Wire(_) => WireRole::User,
        };

        let mut blocks = Vec::new();
        if msg.is_tool_result() {
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: msg.content.clone().map(ToolResultContent::Text),
                is_error: None,
            });
        } else {
            blocks.extend(msg.images.iter().map(encode_image));
            if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                blocks.push(ContentBlock::Text { text: text.clone() });
            }
            blocks.extend(msg.tool_calls.iter().map(|call| ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: arguments_value(&call.arguments),
            }));
        }
        if blocks.is_empty() {
            continue;
        }

        match messages.last_mut() {
            Some(WireMessage {
                role: last_role,
                content: MessageContent::Blocks(existing),
            }) if *last_role == role => existing.extend(blocks),
            _ => messages.push(WireMessage {
                role,
                content: MessageContent::Blocks(blocks),
            }),
        }
    }

    if chat.response_format.is_some() {
        debug!("Anthropic has no native response format; field dropped");
    }

    MessagesRequest {
        model: model.to_string(),
        max_tokens: chat.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_parts.is_empty()).then(|| SystemContent::Text(system_parts.join("\n\n"))),
        stream: stream.then_some(true),
        temperature: chat.temperature,
        top_p: chat.top_p,
        top_k: None,
        tools: chat
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(encode_tool).collect()),
        tool_choice: chat.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Mode(mode) => WireToolChoice::Auto(ToolChoiceAuto {
                choice_type: MAPPINGS.tool_choice(*mode).to_string(),
            }),
            ToolChoice::Function { force_function } => WireToolChoice::Specific(ToolChoiceSpecific {
                choice_type: "tool".to_string(),
                name: force_function.clone(),
            }),
        }),
        metadata: None,
        stop_sequences: chat.stop_sequences.clone(),
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports(&self, request_type: RequestType) -> bool {
        request_type == RequestType::Chat
    }

    async fn call(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse> {
        if request.request_type() != RequestType::Chat {
            return Err(unsupported(self.kind(), request.request_type()));
        }
        let model = target_model(request)?;
        let body = build_request(chat_payload(request)?, model, false);

        debug!(model, "messages request");

        let (resp, raw): (MessagesResponse, _) =
            send_json(self.kind(), self.post(credential).json(&body)).await?;

        let mut unified = decode_response(&resp);
        unified.finish_reason = Some(
            resp.stop_reason
                .as_deref()
                .map(|r| MAPPINGS.finish_reason(r))
                .unwrap_or(FinishReason::Completed),
        );
        unified.raw = Some(raw);
        Ok(unified)
    }

    async fn call_stream(&self, request: &UnifiedRequest, credential: &Credential) -> Result<ResponseStream> {
        if request.request_type() != RequestType::Chat {
            return Err(GatewayError::unsupported(
                self.kind().as_str(),
                format!("streaming {} requests", request.request_type()),
            ));
        }
        let model = target_model(request)?.to_string();
        let body = build_request(chat_payload(request)?, &model, true);

        debug!(model = %model, "messages request (streaming)");

        let response = check_status(self.kind(), self.post(credential).json(&body)).await?;
        let mut events = sse_data(self.kind(), response);

        let stream = async_stream::stream! {
            let mut decoder = EventDecoder::new(&model);
            while let Some(event) = futures::StreamExt::next(&mut events).await {
                let data = match event {
                    Ok((_, data)) => data,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let event: StreamEvent = match serde_json::from_str(&data) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!("Skipping unparseable event: {}", e);
                        continue;
                    }
                };
                match decoder.process(event) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
                if decoder.is_done() {
                    return;
                }
            }
            yield Ok(decoder.terminal());
        };

        Ok(Box::pin(stream))
    }
}

/// Turns upstream Messages stream events into unified chunks.
#[derive(Debug)]
pub(crate) struct EventDecoder {
    model: String,
    current_tool: Option<(String, String)>,
    prompt_tokens: u64,
    completion_tokens: u64,
    stop_reason: Option<String>,
    done: bool,
}

impl EventDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            current_tool: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            stop_reason: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn process(&mut self, event: StreamEvent) -> Result<Vec<UnifiedResponse>> {
        let mut out = Vec::new();
        match event {
            StreamEvent::MessageStart { message } => {
                self.prompt_tokens = message.usage.input_tokens;
                if !message.model.is_empty() {
                    self.model = message.model;
                }
            }
            StreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                ResponseContentBlock::ToolUse { id, name, .. } => {
                    self.current_tool = Some((id.clone(), name.clone()));
                    out.push(UnifiedResponse::tool_call_delta(
                        &self.model,
                        ToolCall {
                            id,
                            name,
                            arguments: String::new(),
                        },
                    ));
                }
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    out.push(UnifiedResponse::content_delta(&self.model, text));
                }
                _ => {}
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                Delta::TextDelta { text } => out.push(UnifiedResponse::content_delta(&self.model, text)),
                Delta::InputJsonDelta { partial_json } => {
                    if let Some((id, name)) = &self.current_tool {
                        out.push(UnifiedResponse::tool_call_delta(
                            &self.model,
                            ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments: partial_json,
                            },
                        ));
                    }
                }
                Delta::ThinkingDelta { .. } | Delta::SignatureDelta { .. } => {}
            },
            StreamEvent::ContentBlockStop { .. } => self.current_tool = None,
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(input) = usage.input_tokens {
                    self.prompt_tokens = input;
                }
                self.completion_tokens = usage.output_tokens;
            }
            StreamEvent::MessageStop => out.push(self.terminal()),
            StreamEvent::Ping => {}
            StreamEvent::Error { error } => {
                return Err(GatewayError::provider(
                    ProviderKind::Anthropic.as_str(),
                    format!("{}: {}", error.error_type, error.message),
                ));
            }
        }
        Ok(out)
    }

    /// The terminal chunk. Marks the decoder done.
    pub fn terminal(&mut self) -> UnifiedResponse {
        self.done = true;
        let finish = self
            .stop_reason
            .as_deref()
            .map(|r| MAPPINGS.finish_reason(r))
            .unwrap_or(FinishReason::Completed);
        let mut chunk = UnifiedResponse::terminal(
            &self.model,
            finish,
            Usage::new(self.prompt_tokens, self.completion_tokens),
        );
        chunk.raw_finish_reason = self.stop_reason.clone();
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified::Message;
    use serde_json::json;

    #[test]
    fn test_system_is_out_of_band() {
        let chat = ChatRequest {
            messages: vec![Message::system("extra rules"), Message::user("hi")],
            system_prompt: Some("base".to_string()),
            ..ChatRequest::default()
        };
        let wire = build_request(&chat, "claude-3-5-haiku-20241022", false);
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.system.unwrap().as_text(), "base\n\nextra rules");
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_consecutive_tool_results_merge_into_one_user_turn() {
        let mut assistant = Message::assistant("");
        assistant.content = None;
        assistant.tool_calls = vec![
            ToolCall {
                id: "t1".to_string(),
                name: "a".to_string(),
                arguments: "{}".to_string(),
            },
            ToolCall {
                id: "t2".to_string(),
                name: "b".to_string(),
                arguments: r#"{"x":1}"#.to_string(),
            },
        ];
        let chat = ChatRequest {
            messages: vec![
                Message::user("go"),
                assistant,
                Message::tool_result("t1", "one"),
                Message::tool_result("t2", "two"),
            ],
            ..ChatRequest::default()
        };
        let wire = build_request(&chat, "m", false);
        assert_eq!(wire.messages.len(), 3);

        let json = serde_json::to_value(&wire.messages[2]).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][1]["tool_use_id"], "t2");

        let assistant_json = serde_json::to_value(&wire.messages[1]).unwrap();
        assert_eq!(assistant_json["content"][1]["input"], json!({"x": 1}));
    }

    #[test]
    fn test_tool_choice_shapes() {
        let mut chat = ChatRequest {
            messages: vec![Message::user("hi")],
            tool_choice: Some(ToolChoice::Mode(ToolChoiceMode::Required)),
            ..ChatRequest::default()
        };
        let wire = build_request(&chat, "m", false);
        assert_eq!(serde_json::to_value(&wire.tool_choice).unwrap(), json!({"type": "any"}));

        chat.tool_choice = Some(ToolChoice::Function {
            force_function: "lookup".to_string(),
        });
        let wire = build_request(&chat, "m", false);
        assert_eq!(
            serde_json::to_value(&wire.tool_choice).unwrap(),
            json!({"type": "tool", "name": "lookup"})
        );
    }

    fn event(value: serde_json::Value) -> StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_event_decoder_sequence() {
        let mut decoder = EventDecoder::new("claude");
        let mut chunks = Vec::new();
        for e in [
            json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant",
                "content": [], "model": "claude-3-5-haiku-20241022", "stop_reason": null,
                "usage": {"input_tokens": 11, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"loc\":"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 9}}),
            json!({"type": "message_stop"}),
        ] {
            chunks.extend(decoder.process(event(e)).unwrap());
        }

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].content.as_deref(), Some("Hi"));
        assert_eq!(chunks[1].tool_calls[0].id, "toolu_1");
        assert_eq!(chunks[2].tool_calls[0].arguments, "{\"loc\":");
        assert_eq!(chunks[2].tool_calls[0].name, "get_weather");

        let terminal = &chunks[3];
        assert_eq!(terminal.finish_reason, Some(FinishReason::ToolCall));
        assert_eq!(terminal.usage, Some(Usage::new(11, 9)));
        assert_eq!(terminal.model, "claude-3-5-haiku-20241022");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_error_event_fails_stream() {
        let mut decoder = EventDecoder::new("claude");
        let err = decoder
            .process(event(json!({"type": "error", "error": {"type": "overloaded_error", "message": "busy"}})))
            .unwrap_err();
        assert!(err.to_string().contains("busy"));
    }
}
