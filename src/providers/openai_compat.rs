//! Shared client for providers that speak the Chat Completions wire format.
//!
//! OpenAI and Mistral differ only in their mapping tables and a couple of
//! request flags, so both adapters delegate chat and embeddings here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    check_status, send_json, sse_data, target_model, MappingTables, ProviderKind, ResponseStream,
    RoleTarget,
};
use crate::credentials::Credential;
use crate::error::{GatewayError, Result};
use crate::translate::openai::{
    decode_response_with, encode_content, encode_response_format, encode_tool, encode_tool_call,
};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatMessage,
    ChatToolChoice, StopSequences, StreamOptions,
};
use crate::unified::{
    ChatRequest, EmbeddingsRequest, GeneratedOutput, Role, ToolCall, ToolChoice, UnifiedRequest,
    UnifiedResponse, Usage,
};

#[derive(Debug, Clone)]
pub(crate) struct CompatClient {
    pub kind: ProviderKind,
    pub base_url: String,
    pub tables: &'static MappingTables,
    /// Whether to send `stream_options.include_usage`. Providers that always
    /// report usage on the last chunk reject the field.
    pub stream_usage_option: bool,
    client: reqwest::Client,
}

impl CompatClient {
    pub fn new(
        kind: ProviderKind,
        client: reqwest::Client,
        base_url: impl Into<String>,
        tables: &'static MappingTables,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tables,
            stream_usage_option: true,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn post(&self, path: &str, credential: &Credential) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("Authorization", format!("Bearer {}", credential.key))
            .header("Content-Type", "application/json")
    }

    pub fn build_chat_request(&self, chat: &ChatRequest, model: &str, stream: bool) -> ChatCompletionRequest {
        let tables = self.tables;
        let mut system_parts: Vec<String> = chat.system_prompt.iter().cloned().collect();
        let mut messages = Vec::with_capacity(chat.messages.len() + 1);

        for msg in &chat.messages {
            match tables.role(msg.role) {
                RoleTarget::OutOfBand => {
                    if let Some(text) = &msg.content {
                        system_parts.push(text.clone());
                    }
                }
                RoleTarget::Wire(role) => messages.push(ChatMessage {
                    role: role.to_string(),
                    content: encode_content(msg),
                    tool_calls: (!msg.tool_calls.is_empty())
                        .then(|| msg.tool_calls.iter().map(encode_tool_call).collect()),
                    tool_call_id: msg.tool_call_id.clone(),
                    name: msg.name.clone(),
                }),
            }
        }

        if !system_parts.is_empty() {
            let system_role = match tables.role(Role::System) {
                RoleTarget::Wire(role) => role,
                RoleTarget::OutOfBand => "system",
            };
            messages.insert(
                0,
                ChatMessage {
                    role: system_role.to_string(),
                    content: Some(ChatContent::Text(system_parts.join("\n\n"))),
                    tool_calls: None,
                    tool_call_id: None,
                    name: None,
                },
            );
        }

        let tool_choice = chat.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Mode(mode) => ChatToolChoice::String(tables.tool_choice(*mode).to_string()),
            ToolChoice::Function { force_function } => ChatToolChoice::function(force_function.clone()),
        });

        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            max_tokens: chat.max_tokens,
            temperature: chat.temperature,
            top_p: chat.top_p,
            stream: stream.then_some(true),
            stream_options: (stream && self.stream_usage_option).then_some(StreamOptions {
                include_usage: true,
            }),
            tools: chat
                .tools
                .as_ref()
                .map(|tools| tools.iter().map(encode_tool).collect()),
            tool_choice,
            response_format: chat.response_format.as_ref().map(encode_response_format),
            stop: chat.stop_sequences.clone().map(StopSequences::Many),
            ..ChatCompletionRequest::default()
        }
    }

    pub async fn chat(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse> {
        let chat = chat_payload(request)?;
        let model = target_model(request)?;
        let body = self.build_chat_request(chat, model, false);

        debug!(provider = %self.kind, model, "chat completion");

        let (resp, raw): (ChatCompletionResponse, _) =
            send_json(self.kind, self.post("/chat/completions", credential).json(&body)).await?;

        let tables = self.tables;
        let mut unified = decode_response_with(&resp, |r| tables.finish_reason(r));
        unified.raw = Some(raw);
        Ok(unified)
    }

    pub async fn chat_stream(&self, request: &UnifiedRequest, credential: &Credential) -> Result<ResponseStream> {
        let chat = chat_payload(request)?;
        let model = target_model(request)?.to_string();
        let body = self.build_chat_request(chat, &model, true);

        debug!(provider = %self.kind, model = %model, "chat completion (streaming)");

        let response = check_status(self.kind, self.post("/chat/completions", credential).json(&body)).await?;
        let mut events = sse_data(self.kind, response);
        let tables = self.tables;

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
                if data.trim().is_empty() {
                    continue;
                }
                let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
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
            yield Ok(decoder.finish(tables));
        };

        Ok(Box::pin(stream))
    }

    pub async fn embeddings(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse> {
        let crate::unified::RequestPayload::Embeddings(EmbeddingsRequest { input, dimensions }) =
            &request.payload
        else {
            return Err(GatewayError::invalid_request("expected an embeddings request"));
        };
        let model = target_model(request)?;

        let body = EmbeddingsBody {
            model,
            input,
            dimensions: *dimensions,
        };
        let (resp, _): (EmbeddingsResponse, _) =
            send_json(self.kind, self.post("/embeddings", credential).json(&body)).await?;

        let mut data = resp.data;
        data.sort_by_key(|d| d.index);
        let prompt_tokens = resp.usage.map(|u| u.prompt_tokens).unwrap_or(0);

        Ok(UnifiedResponse {
            model: resp.model.unwrap_or_else(|| model.to_string()),
            usage: Some(Usage::new(prompt_tokens, 0)),
            output: Some(GeneratedOutput::Embeddings {
                vectors: data.into_iter().map(|d| d.embedding).collect(),
            }),
            ..UnifiedResponse::default()
        })
    }
}

pub(crate) fn chat_payload(request: &UnifiedRequest) -> Result<&ChatRequest> {
    request
        .as_chat()
        .ok_or_else(|| GatewayError::invalid_request("expected a chat request"))
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<EmbeddingsUsage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct EmbeddingsUsage {
    #[serde(default)]
    prompt_tokens: u64,
}

// ---------------------------------------------------------------------------
// Upstream chunk decoding
// ---------------------------------------------------------------------------

/// Turns upstream Chat Completions chunks into unified chunks.
///
/// Tool-call fragments are addressed by index upstream; the decoder carries
/// the id and name forward so every unified fragment names its call. The
/// finish reason and usage may arrive on different chunks, so the terminal
/// chunk is only produced by [`ChunkDecoder::finish`].
#[derive(Debug)]
pub(crate) struct ChunkDecoder {
    model: String,
    calls: HashMap<u64, (String, String)>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChunkDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: HashMap::new(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn process(&mut self, chunk: &ChatCompletionChunk) -> Vec<UnifiedResponse> {
        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::new(usage.prompt_tokens, usage.completion_tokens));
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }

        let mut out = Vec::new();
        let Some(choice) = chunk.choices.first() else {
            return out;
        };

        // `reasoning_content` is chain-of-thought, not answer text; it is dropped.
        if let Some(text) = choice.delta.content.as_deref().filter(|s| !s.is_empty()) {
            out.push(UnifiedResponse::content_delta(&self.model, text));
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            let entry = self.calls.entry(tc.index).or_default();
            if let Some(id) = tc.id.as_ref().filter(|id| !id.is_empty()) {
                entry.0 = id.clone();
            }
            if let Some(name) = tc.function.as_ref().and_then(|f| f.name.as_ref()) {
                entry.1 = name.clone();
            }
            let arguments = tc
                .function
                .as_ref()
                .and_then(|f| f.arguments.clone())
                .unwrap_or_default();
            out.push(UnifiedResponse::tool_call_delta(
                &self.model,
                ToolCall {
                    id: entry.0.clone(),
                    name: entry.1.clone(),
                    arguments,
                },
            ));
        }

        if let Some(reason) = &choice.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        out
    }

    pub fn finish(self, tables: &MappingTables) -> UnifiedResponse {
        let finish = self
            .finish_reason
            .as_deref()
            .map(|r| tables.finish_reason(r))
            .unwrap_or(crate::unified::FinishReason::Completed);
        let mut terminal = UnifiedResponse::terminal(&self.model, finish, self.usage.unwrap_or_default());
        terminal.raw_finish_reason = self.finish_reason;
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::{
        ChatUsage, ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
    };
    use crate::unified::FinishReason;

    fn chunk(delta: ChunkDelta, finish: Option<&str>, usage: Option<ChatUsage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "c".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(String::from),
            }],
            usage,
        }
    }

    #[test]
    fn test_decoder_drops_reasoning_text() {
        let mut decoder = ChunkDecoder::new("o3-mini");
        let thinking = decoder.process(&chunk(
            ChunkDelta {
                reasoning_content: Some("The user wants a number".to_string()),
                ..ChunkDelta::default()
            },
            None,
            None,
        ));
        assert!(thinking.is_empty());

        let answer = decoder.process(&chunk(
            ChunkDelta {
                content: Some("42".to_string()),
                reasoning_content: Some("so 42".to_string()),
                ..ChunkDelta::default()
            },
            None,
            None,
        ));
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].content.as_deref(), Some("42"));
    }

    #[test]
    fn test_decoder_carries_tool_id_forward() {
        let mut decoder = ChunkDecoder::new("gpt-4o");
        let first = decoder.process(&chunk(
            ChunkDelta {
                tool_calls: Some(vec![ChunkToolCall {
                    index: 0,
                    id: Some("call_1".to_string()),
                    call_type: Some("function".to_string()),
                    function: Some(ChunkToolCallFunction {
                        name: Some("lookup".to_string()),
                        arguments: Some(String::new()),
                    }),
                }]),
                ..ChunkDelta::default()
            },
            None,
            None,
        ));
        let second = decoder.process(&chunk(
            ChunkDelta {
                tool_calls: Some(vec![ChunkToolCall {
                    index: 0,
                    id: None,
                    call_type: None,
                    function: Some(ChunkToolCallFunction {
                        name: None,
                        arguments: Some("{\"q\":1}".to_string()),
                    }),
                }]),
                ..ChunkDelta::default()
            },
            Some("tool_calls"),
            None,
        ));

        assert_eq!(first[0].tool_calls[0].id, "call_1");
        assert_eq!(second[0].tool_calls[0].id, "call_1");
        assert_eq!(second[0].tool_calls[0].name, "lookup");
        assert!(second.iter().all(|c| !c.is_terminal()));

        let usage_only = ChatCompletionChunk {
            choices: Vec::new(),
            usage: Some(ChatUsage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
            }),
            ..chunk(ChunkDelta::default(), None, None)
        };
        assert!(decoder.process(&usage_only).is_empty());

        let terminal = decoder.finish(&crate::providers::openai::MAPPINGS);
        assert_eq!(terminal.finish_reason, Some(FinishReason::ToolCall));
        assert_eq!(terminal.usage.unwrap().total_tokens, 7);
        assert_eq!(terminal.raw_finish_reason.as_deref(), Some("tool_calls"));
    }
}
