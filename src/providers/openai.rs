//! OpenAI: chat (with streaming), embeddings, image generation and speech.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::openai_compat::CompatClient;
use super::{
    check_status, send_json, target_model, unsupported, MappingTables, ProviderAdapter, ProviderKind,
    ResponseStream, RoleTarget,
};
use crate::credentials::Credential;
use crate::error::{GatewayError, Result};
use crate::unified::{
    FinishReason, GeneratedImage, GeneratedOutput, ImageRequest, RequestPayload, RequestType, Role,
    ToolChoiceMode, TtsRequest, UnifiedRequest, UnifiedResponse,
};

pub static MAPPINGS: MappingTables = MappingTables {
    roles: &[
        (Role::System, RoleTarget::Wire("system")),
        (Role::Developer, RoleTarget::Wire("developer")),
        (Role::User, RoleTarget::Wire("user")),
        (Role::Assistant, RoleTarget::Wire("assistant")),
        (Role::Model, RoleTarget::Wire("assistant")),
        (Role::Tool, RoleTarget::Wire("tool")),
        (Role::Function, RoleTarget::Wire("tool")),
    ],
    finish_reasons: &[
        ("stop", FinishReason::Completed),
        ("length", FinishReason::LengthLimit),
        ("tool_calls", FinishReason::ToolCall),
        ("function_call", FinishReason::ToolCall),
        ("content_filter", FinishReason::Filtered),
    ],
    tool_choice: &[
        (ToolChoiceMode::Auto, "auto"),
        (ToolChoiceMode::None, "none"),
        (ToolChoiceMode::Required, "required"),
    ],
};

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    compat: CompatClient,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            compat: CompatClient::new(ProviderKind::OpenAi, client, base_url, &MAPPINGS),
        }
    }

    pub fn from_preset(client: reqwest::Client) -> Self {
        Self::new(client, ProviderKind::OpenAi.preset().base_url)
    }

    async fn generate_images(
        &self,
        request: &UnifiedRequest,
        image: &ImageRequest,
        credential: &Credential,
    ) -> Result<UnifiedResponse> {
        let model = target_model(request)?;
        let body = ImagesBody {
            model,
            prompt: &image.prompt,
            n: image.n,
            size: image.size.as_deref(),
            quality: image.quality.as_deref(),
        };

        debug!(model, "image generation");

        let (resp, _): (ImagesResponse, _) = send_json(
            ProviderKind::OpenAi,
            self.compat.post("/images/generations", credential).json(&body),
        )
        .await?;

        let images = resp
            .data
            .into_iter()
            .map(|d| GeneratedImage {
                url: d.url,
                base64: d.b64_json,
                revised_prompt: d.revised_prompt,
            })
            .collect();

        Ok(UnifiedResponse {
            model: model.to_string(),
            finish_reason: Some(FinishReason::Completed),
            output: Some(GeneratedOutput::Images { images }),
            ..UnifiedResponse::default()
        })
    }

    async fn synthesize_speech(
        &self,
        request: &UnifiedRequest,
        tts: &TtsRequest,
        credential: &Credential,
    ) -> Result<UnifiedResponse> {
        let model = target_model(request)?;
        let format = tts.format.clone().unwrap_or_else(|| "mp3".to_string());
        let body = SpeechBody {
            model,
            input: &tts.input,
            voice: tts.voice.as_deref().unwrap_or("alloy"),
            response_format: &format,
        };

        debug!(model, format = %format, "speech synthesis");

        let response = check_status(
            ProviderKind::OpenAi,
            self.compat.post("/audio/speech", credential).json(&body),
        )
        .await?;
        let audio = response.bytes().await.map_err(|e| {
            GatewayError::provider(ProviderKind::OpenAi.as_str(), format!("Failed to read audio: {e}"))
        })?;

        Ok(UnifiedResponse {
            model: model.to_string(),
            finish_reason: Some(FinishReason::Completed),
            output: Some(GeneratedOutput::Audio {
                base64: base64::engine::general_purpose::STANDARD.encode(&audio),
                format,
            }),
            ..UnifiedResponse::default()
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn supports(&self, request_type: RequestType) -> bool {
        matches!(
            request_type,
            RequestType::Chat | RequestType::Embeddings | RequestType::Image | RequestType::Tts
        )
    }

    async fn call(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse> {
        match &request.payload {
            RequestPayload::Chat(_) => self.compat.chat(request, credential).await,
            RequestPayload::Embeddings(_) => self.compat.embeddings(request, credential).await,
            RequestPayload::Image(image) => self.generate_images(request, image, credential).await,
            RequestPayload::Tts(tts) => self.synthesize_speech(request, tts, credential).await,
            RequestPayload::Video(_) => Err(unsupported(self.kind(), RequestType::Video)),
        }
    }

    async fn call_stream(&self, request: &UnifiedRequest, credential: &Credential) -> Result<ResponseStream> {
        match request.request_type() {
            RequestType::Chat => self.compat.chat_stream(request, credential).await,
            other => Err(GatewayError::unsupported(
                self.kind().as_str(),
                format!("streaming {other} requests"),
            )),
        }
    }
}

#[derive(Serialize)]
struct ImagesBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
}

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::ChatToolChoice;
    use crate::unified::{ChatRequest, Message, ToolChoice, VideoRequest};

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::from_preset(reqwest::Client::new())
    }

    #[test]
    fn test_role_and_finish_tables() {
        assert_eq!(MAPPINGS.role(Role::Model), RoleTarget::Wire("assistant"));
        assert_eq!(MAPPINGS.role(Role::Function), RoleTarget::Wire("tool"));
        assert_eq!(MAPPINGS.finish_reason("content_filter"), FinishReason::Filtered);
        assert_eq!(MAPPINGS.finish_reason("something_new"), FinishReason::Completed);
    }

    #[test]
    fn test_chat_request_shape() {
        let chat = ChatRequest {
            messages: vec![Message::user("hi")],
            system_prompt: Some("Be kind.".to_string()),
            tool_choice: Some(ToolChoice::Function {
                force_function: "lookup".to_string(),
            }),
            stop_sequences: Some(vec!["END".to_string()]),
            ..ChatRequest::default()
        };
        let wire = adapter().compat.build_chat_request(&chat, "gpt-4o", true);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[1].role, "user");
        assert_eq!(wire.tool_choice, Some(ChatToolChoice::function("lookup")));
        assert!(wire.stream_options.is_some());

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["tool_choice"]["type"], "function");
        assert_eq!(json["stop"][0], "END");
    }

    #[test]
    fn test_required_tool_choice_literal() {
        let chat = ChatRequest {
            messages: vec![Message::user("hi")],
            tool_choice: Some(ToolChoice::Mode(ToolChoiceMode::Required)),
            ..ChatRequest::default()
        };
        let wire = adapter().compat.build_chat_request(&chat, "gpt-4o", false);
        assert_eq!(wire.tool_choice, Some(ChatToolChoice::String("required".to_string())));
        assert!(wire.stream.is_none());
    }

    #[tokio::test]
    async fn test_video_is_unsupported() {
        let adapter = adapter();
        assert!(!adapter.supports(RequestType::Video));

        let request = UnifiedRequest {
            gate_id: "g".to_string(),
            model: Some("gpt-4o".to_string()),
            payload: RequestPayload::Video(VideoRequest {
                prompt: "a cat".to_string(),
                duration_secs: None,
            }),
            metadata: Default::default(),
        };
        let err = adapter
            .call(&request, &Credential::platform("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }
}
