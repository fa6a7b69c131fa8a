//! Google Gemini `generateContent`: chat with streaming, and embeddings.
//!
//! Gemini differs from the other providers in a few ways:
//! - `contents` of `parts` instead of messages; the assistant role is `model`.
//! - System prompts go to `systemInstruction`.
//! - Function calling mode is an enum (`AUTO`/`ANY`/`NONE`) in `toolConfig`,
//!   and forcing one function means `ANY` plus `allowedFunctionNames`.
//! - Function calls carry no id, so ids are synthesized.
//! - A turn that ends in function calls reports `STOP`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::openai_compat::chat_payload;
use super::{
    check_status, send_json, sse_data, target_model, unsupported, MappingTables, ProviderAdapter,
    ProviderKind, ResponseStream, RoleTarget,
};
use crate::credentials::Credential;
use crate::error::{GatewayError, Result};
use crate::translate::anthropic::arguments_value;
use crate::unified::{
    ChatRequest, EmbeddingsRequest, FinishReason, GeneratedOutput, ImageInput, Message, RequestPayload,
    RequestType, ResponseFormat, Role, ToolCall, ToolChoice, ToolChoiceMode, UnifiedRequest,
    UnifiedResponse, Usage,
};

pub static MAPPINGS: MappingTables = MappingTables {
    roles: &[
        (Role::System, RoleTarget::OutOfBand),
        (Role::Developer, RoleTarget::OutOfBand),
        (Role::User, RoleTarget::Wire("user")),
        (Role::Assistant, RoleTarget::Wire("model")),
        (Role::Model, RoleTarget::Wire("model")),
        (Role::Tool, RoleTarget::Wire("user")),
        (Role::Function, RoleTarget::Wire("user")),
    ],
    finish_reasons: &[
        ("STOP", FinishReason::Completed),
        ("MAX_TOKENS", FinishReason::LengthLimit),
        ("SAFETY", FinishReason::Filtered),
        ("RECITATION", FinishReason::Filtered),
        ("BLOCKLIST", FinishReason::Filtered),
        ("PROHIBITED_CONTENT", FinishReason::Filtered),
        ("SPII", FinishReason::Filtered),
        ("MALFORMED_FUNCTION_CALL", FinishReason::Error),
    ],
    tool_choice: &[
        (ToolChoiceMode::Auto, "AUTO"),
        (ToolChoiceMode::None, "NONE"),
        (ToolChoiceMode::Required, "ANY"),
    ],
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FunctionCallingConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEmbedRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest {
    model: String,
    content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<u32>,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Embedding>,
}

#[derive(Deserialize)]
struct Embedding {
    values: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

fn text_part(text: impl Into<String>) -> Part {
    Part {
        text: Some(text.into()),
        ..Part::default()
    }
}

fn image_part(image: &ImageInput) -> Part {
    match image {
        ImageInput::Inline { base64, mime_type } => Part {
            inline_data: Some(Blob {
                mime_type: mime_type.clone(),
                data: base64.clone(),
            }),
            ..Part::default()
        },
        ImageInput::Url { url } => Part {
            file_data: Some(FileData {
                mime_type: guess_image_mime(url).to_string(),
                file_uri: url.clone(),
            }),
            ..Part::default()
        },
    }
}

fn guess_image_mime(url: &str) -> &'static str {
    let lower = url.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// Name of the function a tool result answers: the message's own name, or
/// the name of the earlier call with the same id.
fn tool_result_name(msg: &Message, history: &[Message]) -> String {
    if let Some(name) = msg.name.as_ref().filter(|n| !n.is_empty()) {
        return name.clone();
    }
    let id = msg.tool_call_id.as_deref().unwrap_or_default();
    history
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .find(|call| call.id == id)
        .map(|call| call.name.clone())
        .unwrap_or_default()
}

fn tool_result_part(msg: &Message, history: &[Message]) -> Part {
    let text = msg.content.clone().unwrap_or_default();
    let content = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .filter(|v| v.is_object())
        .unwrap_or_else(|| serde_json::json!({ "result": text }));
    Part {
        function_response: Some(FunctionResponse {
            name: tool_result_name(msg, history),
            response: content,
        }),
        ..Part::default()
    }
}

pub(crate) fn build_request(chat: &ChatRequest) -> GenerateContentRequest {
    let mut system_parts: Vec<String> = chat.system_prompt.iter().cloned().collect();
    let mut contents: Vec<Content> = Vec::new();

    for (i, msg) in chat.messages.iter().enumerate() {
        let role = match MAPPINGS.role(msg.role) {
            RoleTarget::OutOfBand => {
                if let Some(text) = &msg.content {
                    system_parts.push(text.clone());
                }
                continue;
            }
            RoleTarget::Wire(role) => role,
        };

        let mut parts = Vec::new();
        if msg.is_tool_result() {
            parts.push(tool_result_part(msg, &chat.messages[..i]));
        } else {
            if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                parts.push(text_part(text.clone()));
            }
            parts.extend(msg.images.iter().map(image_part));
            parts.extend(msg.tool_calls.iter().map(|call| Part {
                function_call: Some(FunctionCall {
                    id: None,
                    name: call.name.clone(),
                    args: arguments_value(&call.arguments),
                }),
                ..Part::default()
            }));
        }
        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let tools = chat.tools.as_ref().map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.json_schema_parameters.clone(),
                })
                .collect(),
        }]
    });

    let tool_config = chat.tool_choice.as_ref().map(|choice| {
        let function_calling_config = match choice {
            ToolChoice::Mode(mode) => FunctionCallingConfig {
                mode: MAPPINGS.tool_choice(*mode).to_string(),
                allowed_function_names: None,
            },
            ToolChoice::Function { force_function } => FunctionCallingConfig {
                mode: MAPPINGS.tool_choice(ToolChoiceMode::Required).to_string(),
                allowed_function_names: Some(vec![force_function.clone()]),
            },
        };
        ToolConfig {
            function_calling_config,
        }
    });

    let (response_mime_type, response_schema) = match &chat.response_format {
        Some(ResponseFormat::JsonObject) => (Some("application/json".to_string()), None),
        Some(ResponseFormat::JsonSchema { schema, .. }) => {
            (Some("application/json".to_string()), Some(schema.clone()))
        }
        Some(ResponseFormat::Text) | None => (None, None),
    };

    let generation_config = GenerationConfig {
        temperature: chat.temperature,
        top_p: chat.top_p,
        max_output_tokens: chat.max_tokens,
        stop_sequences: chat.stop_sequences.clone(),
        response_mime_type,
        response_schema,
    };
    let has_generation_config = generation_config.temperature.is_some()
        || generation_config.top_p.is_some()
        || generation_config.max_output_tokens.is_some()
        || generation_config.stop_sequences.is_some()
        || generation_config.response_mime_type.is_some();

    GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: vec![text_part(system_parts.join("\n\n"))],
        }),
        tools,
        tool_config,
        generation_config: has_generation_config.then_some(generation_config),
    }
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn function_call_to_tool_call(call: &FunctionCall) -> ToolCall {
    ToolCall {
        id: call.id.clone().unwrap_or_else(synthesize_call_id),
        name: call.name.clone(),
        arguments: call.args.to_string(),
    }
}

/// Map the raw finish reason, promoting `STOP` to a tool call when the turn
/// produced function calls.
fn finish_reason(raw: Option<&str>, has_tool_calls: bool) -> FinishReason {
    let mapped = raw.map(|r| MAPPINGS.finish_reason(r)).unwrap_or(FinishReason::Completed);
    if has_tool_calls && mapped == FinishReason::Completed {
        FinishReason::ToolCall
    } else {
        mapped
    }
}

pub(crate) fn decode_response(resp: &GenerateContentResponse, model: &str) -> UnifiedResponse {
    let candidate = resp.candidates.first();
    let parts = candidate
        .and_then(|c| c.content.as_ref())
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();

    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    let tool_calls: Vec<ToolCall> = parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .map(function_call_to_tool_call)
        .collect();

    let raw_finish = candidate.and_then(|c| c.finish_reason.clone());
    let usage = resp.usage_metadata.unwrap_or_default();

    UnifiedResponse {
        content: (!text.is_empty()).then_some(text),
        finish_reason: Some(finish_reason(raw_finish.as_deref(), !tool_calls.is_empty())),
        tool_calls,
        model: resp.model_version.clone().unwrap_or_else(|| model.to_string()),
        raw_finish_reason: raw_finish,
        usage: Some(Usage::new(usage.prompt_token_count, usage.candidates_token_count)),
        ..UnifiedResponse::default()
    }
}

/// Gemini streams complete response objects; usage is cumulative, so the last
/// reported value wins.
#[derive(Debug)]
pub(crate) struct ChunkDecoder {
    model: String,
    finish_reason: Option<String>,
    usage: UsageMetadata,
    saw_tool_call: bool,
}

impl ChunkDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finish_reason: None,
            usage: UsageMetadata::default(),
            saw_tool_call: false,
        }
    }

    pub fn process(&mut self, chunk: &GenerateContentResponse) -> Vec<UnifiedResponse> {
        if let Some(usage) = chunk.usage_metadata {
            self.usage = usage;
        }
        if let Some(version) = &chunk.model_version {
            self.model = version.clone();
        }

        let mut out = Vec::new();
        let Some(candidate) = chunk.candidates.first() else {
            return out;
        };
        if let Some(reason) = &candidate.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
        for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
            if let Some(text) = part.text.as_ref().filter(|t| !t.is_empty()) {
                out.push(UnifiedResponse::content_delta(&self.model, text.clone()));
            }
            if let Some(call) = &part.function_call {
                self.saw_tool_call = true;
                out.push(UnifiedResponse::tool_call_delta(
                    &self.model,
                    function_call_to_tool_call(call),
                ));
            }
        }
        out
    }

    pub fn finish(self) -> UnifiedResponse {
        let finish = finish_reason(self.finish_reason.as_deref(), self.saw_tool_call);
        let mut terminal = UnifiedResponse::terminal(
            &self.model,
            finish,
            Usage::new(self.usage.prompt_token_count, self.usage.candidates_token_count),
        );
        terminal.raw_finish_reason = self.finish_reason;
        terminal
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_preset(client: reqwest::Client) -> Self {
        Self::new(client, ProviderKind::Google.preset().base_url)
    }

    fn post(&self, model: &str, method: &str, credential: &Credential) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/models/{}:{}", self.base_url, model, method))
            .header("x-goog-api-key", &credential.key)
            .header("Content-Type", "application/json")
    }

    async fn embed(
        &self,
        request: &UnifiedRequest,
        embeddings: &EmbeddingsRequest,
        credential: &Credential,
    ) -> Result<UnifiedResponse> {
        let model = target_model(request)?;
        let body = BatchEmbedRequest {
            requests: embeddings
                .input
                .iter()
                .map(|text| EmbedContentRequest {
                    model: format!("models/{model}"),
                    content: Content {
                        role: None,
                        parts: vec![text_part(text.clone())],
                    },
                    output_dimensionality: embeddings.dimensions,
                })
                .collect(),
        };

        let (resp, _): (BatchEmbedResponse, _) = send_json(
            ProviderKind::Google,
            self.post(model, "batchEmbedContents", credential).json(&body),
        )
        .await?;

        Ok(UnifiedResponse {
            model: model.to_string(),
            usage: Some(Usage::default()),
            output: Some(GeneratedOutput::Embeddings {
                vectors: resp.embeddings.into_iter().map(|e| e.values).collect(),
            }),
            ..UnifiedResponse::default()
        })
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn supports(&self, request_type: RequestType) -> bool {
        matches!(request_type, RequestType::Chat | RequestType::Embeddings)
    }

    async fn call(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse> {
        match &request.payload {
            RequestPayload::Chat(chat) => {
                let model = target_model(request)?;
                let body = build_request(chat);
                debug!(model, "generateContent");

                let (resp, raw): (GenerateContentResponse, _) = send_json(
                    self.kind(),
                    self.post(model, "generateContent", credential).json(&body),
                )
                .await?;

                let mut unified = decode_response(&resp, model);
                unified.raw = Some(raw);
                Ok(unified)
            }
            RequestPayload::Embeddings(embeddings) => self.embed(request, embeddings, credential).await,
            _ => Err(unsupported(self.kind(), request.request_type())),
        }
    }

    async fn call_stream(&self, request: &UnifiedRequest, credential: &Credential) -> Result<ResponseStream> {
        if request.request_type() != RequestType::Chat {
            return Err(GatewayError::unsupported(
                self.kind().as_str(),
                format!("streaming {} requests", request.request_type()),
            ));
        }
        let model = target_model(request)?.to_string();
        let body = build_request(chat_payload(request)?);

        debug!(model = %model, "streamGenerateContent");

        let response = check_status(
            self.kind(),
            self.post(&model, "streamGenerateContent", credential)
                .query(&[("alt", "sse")])
                .json(&body),
        )
        .await?;
        let mut events = sse_data(self.kind(), response);

        let stream = async_stream::stream! {
            let mut decoder = ChunkDecoder::new(&model);
            while let Some(event) = futures::StreamExt::next(&mut events).await {
                let data = match event {
                    Ok((_, data)) => data,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let chunk: GenerateContentResponse = match serde_json::from_str(&data) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("Skipping unparseable chunk: {}", e);
                        continue;
                    }
                };
                for unified in decoder.process(&chunk) {
                    yield Ok(unified);
                }
            }
            yield Ok(decoder.finish());
        };

        Ok(Box::pin(stream))
    }
}
