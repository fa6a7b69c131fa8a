//! OpenAI Chat Completions ⇄ unified codec.
//!
//! Pure functions, no I/O. Decoding a caller request flattens system and
//! developer messages into `systemPrompt`; encoding a response synthesizes a
//! `chatcmpl-` id when the unified response has none.

use crate::error::{GatewayError, Result};
use crate::unified::{
    ChatRequest, FinishReason, ImageInput, Message, ResponseFormat, Role, Tool, ToolCall, ToolChoice,
    ToolChoiceMode, UnifiedRequest, UnifiedResponse, Usage,
};

use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatErrorResponse, ChatFunction,
    ChatMessage, ChatResponseFormat, ChatTool, ChatToolCall, ChatToolCallFunction, ChatToolChoice,
    ChatUsage, Choice, ChoiceMessage, ContentPart, ImageUrlDetail, JsonSchemaSpec,
};

// ---------------------------------------------------------------------------
// Request decode
// ---------------------------------------------------------------------------

/// Decode a Chat Completions request.
///
/// With an explicit `gate_id` the wire `model` becomes the requested model
/// override; otherwise the wire `model` names the gate and the model is left
/// for the gate to decide.
pub fn decode_request(req: ChatCompletionRequest, gate_id: Option<&str>) -> Result<UnifiedRequest> {
    let (gate, model) = match gate_id {
        Some(id) => (id.to_string(), Some(req.model.clone()).filter(|m| !m.is_empty())),
        None => (req.model.clone(), None),
    };

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::with_capacity(req.messages.len());

    for (i, msg) in req.messages.into_iter().enumerate() {
        match msg.role.as_str() {
            "system" | "developer" => {
                let (text, _) = split_content(msg.content);
                if let Some(text) = text {
                    system_parts.push(text);
                }
            }
            "user" | "assistant" | "tool" | "function" => messages.push(decode_message(msg)),
            other => {
                return Err(GatewayError::invalid_request(format!(
                    "messages[{i}]: unsupported role '{other}'"
                )))
            }
        }
    }

    let tool_choice = req.tool_choice.map(decode_tool_choice).transpose()?;

    let chat = ChatRequest {
        messages,
        system_prompt: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        temperature: req.temperature,
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        top_p: req.top_p,
        stop_sequences: req.stop.map(|s| s.into_vec()),
        tools: req.tools.map(|tools| tools.into_iter().map(decode_tool).collect()),
        tool_choice,
        response_format: req.response_format.map(decode_response_format),
        stream: req.stream.unwrap_or(false),
    };

    let mut request = UnifiedRequest::chat(gate, chat);
    request.model = model;
    if let Some(user) = req.user {
        request.metadata.insert("user".to_string(), serde_json::Value::String(user));
    }
    Ok(request)
}

fn decode_message(msg: ChatMessage) -> Message {
    let role = match msg.role.as_str() {
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        "function" => Role::Function,
        _ => Role::User,
    };
    let (content, images) = split_content(msg.content);
    let tool_calls = msg
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    Message {
        role,
        content,
        images,
        tool_calls,
        tool_call_id: msg.tool_call_id,
        name: msg.name,
    }
}

/// Concatenate text parts and collect image parts.
fn split_content(content: Option<ChatContent>) -> (Option<String>, Vec<ImageInput>) {
    match content {
        None => (None, Vec::new()),
        Some(ChatContent::Text(text)) => (Some(text), Vec::new()),
        Some(ChatContent::Parts(parts)) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text: t } => text.push_str(&t),
                    ContentPart::ImageUrl { image_url } => images.push(ImageInput::from_url(&image_url.url)),
                }
            }
            ((!text.is_empty()).then_some(text), images)
        }
    }
}

fn decode_tool(tool: ChatTool) -> Tool {
    Tool {
        name: tool.function.name,
        description: tool.function.description,
        json_schema_parameters: tool.function.parameters,
    }
}

fn decode_tool_choice(choice: ChatToolChoice) -> Result<ToolChoice> {
    match choice {
        ChatToolChoice::String(mode) => match mode.as_str() {
            "auto" => Ok(ToolChoice::Mode(ToolChoiceMode::Auto)),
            "none" => Ok(ToolChoice::Mode(ToolChoiceMode::None)),
            "required" | "any" => Ok(ToolChoice::Mode(ToolChoiceMode::Required)),
            other => Err(GatewayError::invalid_request(format!(
                "unsupported tool_choice '{other}'"
            ))),
        },
        ChatToolChoice::Specific(specific) => Ok(ToolChoice::Function {
            force_function: specific.function.name,
        }),
    }
}

fn decode_response_format(format: ChatResponseFormat) -> ResponseFormat {
    match format {
        ChatResponseFormat::Text => ResponseFormat::Text,
        ChatResponseFormat::JsonObject => ResponseFormat::JsonObject,
        ChatResponseFormat::JsonSchema { json_schema } => ResponseFormat::JsonSchema {
            name: Some(json_schema.name),
            schema: json_schema
                .schema
                .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
        },
    }
}

// ---------------------------------------------------------------------------
// Shared wire builders (also used by the OpenAI-wire adapters)
// ---------------------------------------------------------------------------

pub(crate) fn encode_tool(tool: &Tool) -> ChatTool {
    ChatTool {
        tool_type: "function".to_string(),
        function: ChatFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.json_schema_parameters.clone(),
        },
    }
}

pub(crate) fn encode_tool_call(call: &ToolCall) -> ChatToolCall {
    ChatToolCall {
        id: call.id.clone(),
        call_type: "function".to_string(),
        function: ChatToolCallFunction {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

/// Message content as plain text, or as parts when images are attached.
pub(crate) fn encode_content(msg: &Message) -> Option<ChatContent> {
    if msg.images.is_empty() {
        return msg.content.clone().map(ChatContent::Text);
    }
    let mut parts = Vec::with_capacity(msg.images.len() + 1);
    if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
        parts.push(ContentPart::Text { text: text.clone() });
    }
    for image in &msg.images {
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrlDetail {
                url: image.to_url(),
                detail: None,
            },
        });
    }
    Some(ChatContent::Parts(parts))
}

pub(crate) fn encode_response_format(format: &ResponseFormat) -> ChatResponseFormat {
    match format {
        ResponseFormat::Text => ChatResponseFormat::Text,
        ResponseFormat::JsonObject => ChatResponseFormat::JsonObject,
        ResponseFormat::JsonSchema { name, schema } => ChatResponseFormat::JsonSchema {
            json_schema: JsonSchemaSpec {
                name: name.clone().unwrap_or_else(|| "response".to_string()),
                schema: Some(schema.clone()),
                strict: None,
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Response encode / decode
// ---------------------------------------------------------------------------

pub fn finish_reason_to_wire(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Completed => "stop",
        FinishReason::LengthLimit => "length",
        FinishReason::ToolCall => "tool_calls",
        FinishReason::Filtered => "content_filter",
        FinishReason::Error => "error",
    }
}

pub fn finish_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::LengthLimit,
        "tool_calls" | "function_call" => FinishReason::ToolCall,
        "content_filter" => FinishReason::Filtered,
        "error" => FinishReason::Error,
        _ => FinishReason::Completed,
    }
}

pub(crate) fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn encode_usage(usage: &Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

pub fn encode_response(resp: &UnifiedResponse) -> ChatCompletionResponse {
    let tool_calls = (!resp.tool_calls.is_empty())
        .then(|| resp.tool_calls.iter().map(encode_tool_call).collect());

    ChatCompletionResponse {
        id: resp.id.clone().unwrap_or_else(new_completion_id),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: resp.content.clone(),
                reasoning_content: None,
                tool_calls,
            },
            finish_reason: Some(finish_reason_to_wire(resp.finish_reason.unwrap_or(FinishReason::Completed)).to_string()),
        }],
        usage: resp.usage.as_ref().map(encode_usage),
    }
}

pub fn decode_response(resp: &ChatCompletionResponse) -> UnifiedResponse {
    decode_response_with(resp, finish_reason_from_wire)
}

/// Decode with a caller-supplied finish-reason mapping, for OpenAI-wire
/// providers that spell finish reasons differently.
pub(crate) fn decode_response_with(
    resp: &ChatCompletionResponse,
    map_finish: impl Fn(&str) -> FinishReason,
) -> UnifiedResponse {
    let choice = resp.choices.first();

    // Reasoning text never leaks into `content`.
    let content = choice.and_then(|c| c.message.content.clone().filter(|s| !s.is_empty()));

    let tool_calls = choice
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let raw_finish = choice.and_then(|c| c.finish_reason.clone());

    UnifiedResponse {
        id: Some(resp.id.clone()),
        content,
        tool_calls,
        model: resp.model.clone(),
        finish_reason: Some(raw_finish.as_deref().map(&map_finish).unwrap_or(FinishReason::Completed)),
        raw_finish_reason: raw_finish,
        usage: resp
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
        ..UnifiedResponse::default()
    }
}

pub fn error_response(err: &GatewayError) -> ChatErrorResponse {
    let mut body = ChatErrorResponse::new(err.kind(), err.to_string());
    body.error.code = Some(err.status_code().to_string());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(value: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_model_names_gate_without_explicit_id() {
        let req = wire(json!({
            "model": "support",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let unified = decode_request(req, None).unwrap();
        assert_eq!(unified.gate_id, "support");
        assert_eq!(unified.model, None);
    }

    #[test]
    fn test_explicit_gate_keeps_model_override() {
        let req = wire(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let unified = decode_request(req, Some("g-1")).unwrap();
        assert_eq!(unified.gate_id, "g-1");
        assert_eq!(unified.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_system_and_parts_are_flattened() {
        let req = wire(json!({
            "model": "g",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": [
                    {"type": "text", "text": "What is "},
                    {"type": "text", "text": "this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]}
            ],
            "stop": "END",
            "max_completion_tokens": 64
        }));
        let unified = decode_request(req, None).unwrap();
        let chat = unified.as_chat().unwrap();
        assert_eq!(chat.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content.as_deref(), Some("What is this?"));
        assert_eq!(chat.messages[0].images.len(), 1);
        assert_eq!(chat.stop_sequences, Some(vec!["END".to_string()]));
        assert_eq!(chat.max_tokens, Some(64));
    }

    #[test]
    fn test_tool_result_keeps_call_id() {
        let req = wire(json!({
            "model": "g",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "get_weather", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "sunny"}
            ],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
        }));
        let unified = decode_request(req, None).unwrap();
        let chat = unified.as_chat().unwrap();
        assert_eq!(chat.messages[1].tool_calls[0].name, "get_weather");
        assert_eq!(chat.messages[2].role, Role::Tool);
        assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(chat.messages[2].content.as_deref(), Some("sunny"));
        assert_eq!(
            chat.tool_choice,
            Some(ToolChoice::Function {
                force_function: "get_weather".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_role_rejected() {
        let req = wire(json!({
            "model": "g",
            "messages": [{"role": "narrator", "content": "x"}]
        }));
        assert!(decode_request(req, None).unwrap_err().is_caller_error());
    }

    #[test]
    fn test_response_format_schema() {
        let req = wire(json!({
            "model": "g",
            "messages": [{"role": "user", "content": "x"}],
            "response_format": {"type": "json_schema", "json_schema": {"name": "out", "schema": {"type": "object"}}}
        }));
        let unified = decode_request(req, None).unwrap();
        assert!(matches!(
            unified.as_chat().unwrap().response_format,
            Some(ResponseFormat::JsonSchema { .. })
        ));
    }

    #[test]
    fn test_encode_synthesizes_id_and_maps_length() {
        let resp = UnifiedResponse {
            content: Some("partial".to_string()),
            model: "gpt-4o".to_string(),
            finish_reason: Some(FinishReason::LengthLimit),
            usage: Some(Usage::new(10, 5)),
            ..UnifiedResponse::default()
        };
        let wire = encode_response(&resp);
        assert!(wire.id.starts_with("chatcmpl-"));
        assert_eq!(wire.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(wire.usage.unwrap().total_tokens, 15);
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
            model: "gpt-4o".to_string(),
            finish_reason: Some(FinishReason::ToolCall),
            ..UnifiedResponse::default()
        };
        let back = decode_response(&encode_response(&resp));
        assert_eq!(back.content, resp.content);
        assert_eq!(back.tool_calls, resp.tool_calls);
        assert_eq!(back.finish_reason, Some(FinishReason::ToolCall));
    }

    #[test]
    fn test_decode_ignores_reasoning_content() {
        let resp: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "r1",
            "object": "chat.completion",
            "created": 1,
            "model": "o3-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "reasoning_content": "hidden steps"},
                "finish_reason": "length"
            }]
        }))
        .unwrap();
        let unified = decode_response(&resp);
        assert_eq!(unified.content, None);
        assert_eq!(unified.finish_reason, Some(FinishReason::LengthLimit));
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_response(&GatewayError::gate_not_found("nope"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "not_found_error");
        assert_eq!(json["error"]["code"], "404");
    }
}
