//! The provider-agnostic request/response model.
//!
//! Every wire format is decoded into a [`UnifiedRequest`] and every provider
//! answers with a [`UnifiedResponse`] (or a stream of them). The request payload
//! is a sum type over the request `type`, so each modality has a fixed shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{GatewayError, Result};

/// Metadata key carrying the owner of the request.
pub const OWNER_METADATA_KEY: &str = "ownerId";

// ---------------------------------------------------------------------------
// Messages and tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Function,
    Model,
    Developer,
}

/// An image attached to a message: either a URL or inline base64 data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageInput {
    Url {
        url: String,
    },
    Inline {
        base64: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ImageInput {
    /// Render as a URL, using a `data:` URI for inline images.
    pub fn to_url(&self) -> String {
        match self {
            ImageInput::Url { url } => url.clone(),
            ImageInput::Inline { base64, mime_type } => format!("data:{mime_type};base64,{base64}"),
        }
    }

    /// Parse a URL, recognising `data:<mime>;base64,<data>` URIs as inline images.
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((mime_type, data)) = rest.split_once(";base64,") {
                return ImageInput::Inline {
                    base64: data.to_string(),
                    mime_type: mime_type.to_string(),
                };
            }
        }
        ImageInput::Url {
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Serialized JSON. In streamed chunks this is the fragment received so far.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self.role, Role::Tool | Role::Function)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub json_schema_parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
}

/// `"auto" | "none" | "required"` or `{"forceFunction": name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Function {
        #[serde(rename = "forceFunction")]
        force_function: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        schema: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingsRequest {
    pub input: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsRequest {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

/// Type-specific payload, tagged by `type` with the body under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RequestPayload {
    Chat(ChatRequest),
    Image(ImageRequest),
    Embeddings(EmbeddingsRequest),
    Tts(TtsRequest),
    Video(VideoRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Chat,
    Image,
    Embeddings,
    Tts,
    Video,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestType::Chat => "chat",
            RequestType::Image => "image",
            RequestType::Embeddings => "embeddings",
            RequestType::Tts => "tts",
            RequestType::Video => "video",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedRequest {
    pub gate_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub payload: RequestPayload,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl UnifiedRequest {
    pub fn chat(gate_id: impl Into<String>, chat: ChatRequest) -> Self {
        Self {
            gate_id: gate_id.into(),
            model: None,
            payload: RequestPayload::Chat(chat),
            metadata: HashMap::new(),
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self.payload {
            RequestPayload::Chat(_) => RequestType::Chat,
            RequestPayload::Image(_) => RequestType::Image,
            RequestPayload::Embeddings(_) => RequestType::Embeddings,
            RequestPayload::Tts(_) => RequestType::Tts,
            RequestPayload::Video(_) => RequestType::Video,
        }
    }

    pub fn as_chat(&self) -> Option<&ChatRequest> {
        match &self.payload {
            RequestPayload::Chat(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_chat_mut(&mut self) -> Option<&mut ChatRequest> {
        match &mut self.payload {
            RequestPayload::Chat(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.as_chat().map(|c| c.stream).unwrap_or(false)
    }

    /// Caller id used for BYOK credential lookup. The gateway stamps the
    /// authenticated owner here before routing.
    pub fn caller_id(&self) -> Option<&str> {
        self.metadata.get(OWNER_METADATA_KEY).and_then(|v| v.as_str())
    }

    /// Reject malformed input before anything is sent upstream.
    pub fn validate(&self) -> Result<()> {
        if self.gate_id.trim().is_empty() {
            return Err(GatewayError::invalid_request("gateId is required"));
        }
        match &self.payload {
            RequestPayload::Chat(chat) => {
                if chat.messages.is_empty() {
                    return Err(GatewayError::invalid_request("messages must not be empty"));
                }
                for (i, msg) in chat.messages.iter().enumerate() {
                    if msg.is_tool_result() && msg.tool_call_id.as_deref().map_or(true, str::is_empty) {
                        return Err(GatewayError::invalid_request(format!(
                            "messages[{i}]: tool result is missing toolCallId"
                        )));
                    }
                }
            }
            RequestPayload::Image(img) if img.prompt.trim().is_empty() => {
                return Err(GatewayError::invalid_request("prompt must not be empty"));
            }
            RequestPayload::Embeddings(emb) if emb.input.is_empty() => {
                return Err(GatewayError::invalid_request("input must not be empty"));
            }
            RequestPayload::Tts(tts) if tts.input.trim().is_empty() => {
                return Err(GatewayError::invalid_request("input must not be empty"));
            }
            RequestPayload::Video(video) if video.prompt.trim().is_empty() => {
                return Err(GatewayError::invalid_request("prompt must not be empty"));
            }
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    LengthLimit,
    ToolCall,
    Filtered,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

/// Output of the non-chat request types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GeneratedOutput {
    Images { images: Vec<GeneratedImage> },
    Embeddings { vectors: Vec<Vec<f32>> },
    Audio { base64: String, format: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub used_platform_key: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<GeneratedOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl UnifiedResponse {
    pub fn text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            model: model.into(),
            finish_reason: Some(FinishReason::Completed),
            ..Self::default()
        }
    }

    /// A streamed chunk carrying a text fragment.
    pub fn content_delta(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            model: model.into(),
            stream: true,
            ..Self::default()
        }
    }

    /// A streamed chunk carrying a (possibly partial) tool call.
    pub fn tool_call_delta(model: impl Into<String>, call: ToolCall) -> Self {
        Self {
            tool_calls: vec![call],
            model: model.into(),
            stream: true,
            ..Self::default()
        }
    }

    /// The single terminal chunk of a stream.
    pub fn terminal(model: impl Into<String>, finish_reason: FinishReason, usage: Usage) -> Self {
        Self {
            model: model.into(),
            finish_reason: Some(finish_reason),
            usage: Some(usage),
            stream: true,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}
