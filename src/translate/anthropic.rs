//! Anthropic Messages ⇄ unified codec.
//!
//! A single Anthropic message can expand into several unified messages: a user
//! turn holding `tool_result` blocks becomes one `tool` message per result.

use crate::error::{GatewayError, Result};
use crate::unified::{
    ChatRequest, FinishReason, ImageInput, Message, Role, Tool, ToolCall, ToolChoice, ToolChoiceMode,
    UnifiedRequest, UnifiedResponse, Usage,
};

use super::anthropic_types::{
    self as wire, ContentBlock, ErrorResponse, ImageSource, MessagesRequest, MessagesResponse,
    ResponseContentBlock, ToolChoiceAuto, ToolChoiceSpecific,
};

// ---------------------------------------------------------------------------
// Request decode
// ---------------------------------------------------------------------------

/// Decode a Messages API request. Gate selection follows the same rule as the
/// OpenAI codec: an explicit `gate_id` wins, otherwise `model` names the gate.
pub fn decode_request(req: MessagesRequest, gate_id: Option<&str>) -> Result<UnifiedRequest> {
    let (gate, model) = match gate_id {
        Some(id) => (id.to_string(), Some(req.model.clone()).filter(|m| !m.is_empty())),
        None => (req.model.clone(), None),
    };

    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        match msg.role {
            wire::Role::User => decode_user_blocks(&msg.content.blocks(), &mut messages),
            wire::Role::Assistant => messages.push(decode_assistant_blocks(&msg.content.blocks())),
        }
    }

    let chat = ChatRequest {
        messages,
        system_prompt: req.system.as_ref().map(|s| s.as_text()),
        temperature: req.temperature,
        max_tokens: Some(req.max_tokens),
        top_p: req.top_p,
        stop_sequences: req.stop_sequences,
        tools: req.tools.map(|tools| {
            tools
                .into_iter()
                .map(|t| Tool {
                    name: t.name,
                    description: t.description,
                    json_schema_parameters: t.input_schema,
                })
                .collect()
        }),
        tool_choice: req.tool_choice.map(decode_tool_choice).transpose()?,
        response_format: None,
        stream: req.stream.unwrap_or(false),
    };

    let mut request = UnifiedRequest::chat(gate, chat);
    request.model = model;
    if let Some(user) = req.metadata.and_then(|m| m.user_id) {
        request.metadata.insert("user".to_string(), serde_json::Value::String(user));
    }
    Ok(request)
}

fn decode_user_blocks(blocks: &[ContentBlock], out: &mut Vec<Message>) {
    let mut text = String::new();
    let mut images = Vec::new();

    let flush = |text: &mut String, images: &mut Vec<ImageInput>, out: &mut Vec<Message>| {
        if text.is_empty() && images.is_empty() {
            return;
        }
        out.push(Message {
            content: (!text.is_empty()).then(|| std::mem::take(text)),
            images: std::mem::take(images),
            ..Message::new(Role::User, "")
        });
    };

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::Image { source } => {
                if let Some(image) = decode_image(source) {
                    images.push(image);
                }
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                flush(&mut text, &mut images, out);
                let result = content.as_ref().map(|c| c.as_text()).unwrap_or_default();
                out.push(Message::tool_result(tool_use_id.clone(), result));
            }
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {}
        }
    }
    flush(&mut text, &mut images, out);
}

fn decode_assistant_blocks(blocks: &[ContentBlock]) -> Message {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.to_string(),
            }),
            _ => {}
        }
    }

    Message {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
        ..Message::new(Role::Assistant, "")
    }
}

fn decode_image(source: &ImageSource) -> Option<ImageInput> {
    match source.source_type.as_str() {
        "url" => source.url.clone().map(|url| ImageInput::Url { url }),
        _ => Some(ImageInput::Inline {
            base64: source.data.clone()?,
            mime_type: source.media_type.clone().unwrap_or_else(|| "image/png".to_string()),
        }),
    }
}

fn decode_tool_choice(choice: wire::ToolChoice) -> Result<ToolChoice> {
    match choice {
        wire::ToolChoice::Specific(ToolChoiceSpecific { name, .. }) => {
            Ok(ToolChoice::Function { force_function: name })
        }
        wire::ToolChoice::Auto(ToolChoiceAuto { choice_type }) => match choice_type.as_str() {
            "auto" => Ok(ToolChoice::Mode(ToolChoiceMode::Auto)),
            "any" => Ok(ToolChoice::Mode(ToolChoiceMode::Required)),
            "none" => Ok(ToolChoice::Mode(ToolChoiceMode::None)),
            other => Err(GatewayError::invalid_request(format!(
                "unsupported tool_choice type '{other}'"
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// Shared wire builders (also used by the Anthropic adapter)
// ---------------------------------------------------------------------------

pub(crate) fn encode_image(image: &ImageInput) -> ContentBlock {
    let source = match image {
        ImageInput::Url { url } => ImageSource {
            source_type: "url".to_string(),
            media_type: None,
            data: None,
            url: Some(url.clone()),
        },
        ImageInput::Inline { base64, mime_type } => ImageSource {
            source_type: "base64".to_string(),
            media_type: Some(mime_type.clone()),
            data: Some(base64.clone()),
            url: None,
        },
    };
    ContentBlock::Image { source }
}

/// Tool arguments as a JSON value. Unparseable fragments become an empty object.
pub(crate) fn arguments_value(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
}

pub(crate) fn encode_tool(tool: &Tool) -> wire::Tool {
    wire::Tool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.json_schema_parameters.clone(),
    }
}

// ---------------------------------------------------------------------------
// Response encode / decode
// ---------------------------------------------------------------------------

pub fn stop_reason_to_wire(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Completed | FinishReason::Error => "end_turn",
        FinishReason::LengthLimit => "max_tokens",
        FinishReason::ToolCall => "tool_use",
        FinishReason::Filtered => "refusal",
    }
}

pub fn stop_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::LengthLimit,
        "tool_use" => FinishReason::ToolCall,
        "refusal" => FinishReason::Filtered,
        _ => FinishReason::Completed,
    }
}

pub(crate) fn new_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4().simple())
}

pub fn encode_response(resp: &UnifiedResponse) -> MessagesResponse {
    let mut content = Vec::new();

    if let Some(text) = resp.content.as_ref().filter(|t| !t.is_empty()) {
        content.push(ResponseContentBlock::Text { text: text.clone() });
    }
    for call in &resp.tool_calls {
        content.push(ResponseContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: arguments_value(&call.arguments),
        });
    }

    // Messages API clients expect at least one block
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let usage = resp.usage.unwrap_or_default();

    MessagesResponse {
        id: resp.id.clone().unwrap_or_else(new_message_id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(stop_reason_to_wire(resp.finish_reason.unwrap_or(FinishReason::Completed)).to_string()),
        stop_sequence: None,
        usage: wire::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

pub fn decode_response(resp: &MessagesResponse) -> UnifiedResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ResponseContentBlock::Text { text: t } => text.push_str(t),
            ResponseContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.to_string(),
            }),
            ResponseContentBlock::Thinking { .. } => {}
        }
    }

    UnifiedResponse {
        id: Some(resp.id.clone()),
        content: (!text.is_empty()).then_some(text),
        tool_calls,
        model: resp.model.clone(),
        finish_reason: Some(
            resp.stop_reason
                .as_deref()
                .map(stop_reason_from_wire)
                .unwrap_or(FinishReason::Completed),
        ),
        raw_finish_reason: resp.stop_reason.clone(),
        usage: Some(Usage::new(resp.usage.input_tokens, resp.usage.output_tokens)),
        ..UnifiedResponse::default()
    }
}

pub fn error_response(err: &GatewayError) -> ErrorResponse {
    ErrorResponse::new(err.kind(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire_request(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_system_param_becomes_system_prompt() {
        let req = wire_request(json!({
            "model": "support",
            "max_tokens": 100,
            "system": [{"type": "text", "text": "Line one"}, {"type": "text", "text": "Line two"}],
            "messages": [{"role": "user", "content": "hello"}]
        }));
        let unified = decode_request(req, None).unwrap();
        let chat = unified.as_chat().unwrap();
        assert_eq!(unified.gate_id, "support");
        assert_eq!(chat.system_prompt.as_deref(), Some("Line one\nLine two"));
        assert_eq!(chat.max_tokens, Some(100));
        assert_eq!(chat.messages[0].content.as_deref(), Some("hello"));
    }

    #[test]
    fn test_tool_result_blocks_split_into_tool_messages() {
        let req = wire_request(json!({
            "model": "g",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"loc": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "sunny"}]},
                    {"type": "text", "text": "thanks"}
                ]}
            ]
        }));
        let unified = decode_request(req, None).unwrap();
        let msgs = &unified.as_chat().unwrap().messages;
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].tool_calls[0].arguments, r#"{"loc":"Paris"}"#);
        assert_eq!(msgs[2].role, Role::Tool);
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(msgs[2].content.as_deref(), Some("sunny"));
        assert_eq!(msgs[3].content.as_deref(), Some("thanks"));
    }

    #[test]
    fn test_tool_choice_variants() {
        let any: wire::ToolChoice = serde_json::from_value(json!({"type": "any"})).unwrap();
        assert_eq!(decode_tool_choice(any).unwrap(), ToolChoice::Mode(ToolChoiceMode::Required));

        let tool: wire::ToolChoice =
            serde_json::from_value(json!({"type": "tool", "name": "lookup"})).unwrap();
        assert_eq!(
            decode_tool_choice(tool).unwrap(),
            ToolChoice::Function {
                force_function: "lookup".to_string()
            }
        );
    }

    #[test]
    fn test_encode_maps_stop_reasons() {
        let mut resp = UnifiedResponse::text("claude", "hi");
        resp.finish_reason = Some(FinishReason::LengthLimit);
        let wire = encode_response(&resp);
        assert!(wire.id.starts_with("msg-"));
        assert_eq!(wire.stop_reason.as_deref(), Some("max_tokens"));

        resp.finish_reason = Some(FinishReason::ToolCall);
        assert_eq!(encode_response(&resp).stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_empty_response_has_one_text_block() {
        let resp = UnifiedResponse {
            model: "m".to_string(),
            ..UnifiedResponse::default()
        };
        assert_eq!(encode_response(&resp).content.len(), 1);
    }

    #[test]
    fn test_round_trip_recovers_content_tools_and_finish() {
        let resp = UnifiedResponse {
            content: Some("Let me check".to_string()),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: "get_weather".to_string(),
                arguments: r#"{"loc":"Paris"}"#.to_string(),
            }],
            model: "claude".to_string(),
            finish_reason: Some(FinishReason::ToolCall),
            ..UnifiedResponse::default()
        };
        let back = decode_response(&encode_response(&resp));
        assert_eq!(back.content, resp.content);
        assert_eq!(back.tool_calls, resp.tool_calls);
        assert_eq!(back.finish_reason, Some(FinishReason::ToolCall));
    }

    #[test]
    fn test_round_trip_keeps_argument_key_order() {
        let resp = UnifiedResponse {
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: "book".to_string(),
                arguments: r#"{"zone":"EU","b":1,"a":{"y":true,"x":[2,1]}}"#.to_string(),
            }],
            model: "claude".to_string(),
            finish_reason: Some(FinishReason::ToolCall),
            ..UnifiedResponse::default()
        };
        let back = decode_response(&encode_response(&resp));
        assert_eq!(back.tool_calls, resp.tool_calls);
    }

    #[test]
    fn test_stop_sequence_collapses_to_completed() {
        assert_eq!(stop_reason_from_wire("stop_sequence"), FinishReason::Completed);
        assert_eq!(stop_reason_from_wire("end_turn"), FinishReason::Completed);
    }
}
