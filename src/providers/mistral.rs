//! Mistral: OpenAI-compatible chat (with streaming) and embeddings.
//!
//! The wire is Chat Completions, but "force any tool" is spelled `any`, the
//! `developer` role does not exist, and two extra finish reasons appear.

use async_trait::async_trait;

use super::openai_compat::CompatClient;
use super::{unsupported, MappingTables, ProviderAdapter, ProviderKind, ResponseStream, RoleTarget};
use crate::credentials::Credential;
use crate::error::{GatewayError, Result};
use crate::unified::{FinishReason, RequestType, Role, ToolChoiceMode, UnifiedRequest, UnifiedResponse};

pub static MAPPINGS: MappingTables = MappingTables {
    roles: &[
        (Role::System, RoleTarget::Wire("system")),
        (Role::Developer, RoleTarget::Wire("system")),
        (Role::User, RoleTarget::Wire("user")),
        (Role::Assistant, RoleTarget::Wire("assistant")),
        (Role::Model, RoleTarget::Wire("assistant")),
        (Role::Tool, RoleTarget::Wire("tool")),
        (Role::Function, RoleTarget::Wire("tool")),
    ],
    finish_reasons: &[
        ("stop", FinishReason::Completed),
        ("length", FinishReason::LengthLimit),
        ("model_length", FinishReason::LengthLimit),
        ("tool_calls", FinishReason::ToolCall),
        ("error", FinishReason::Error),
    ],
    tool_choice: &[
        (ToolChoiceMode::Auto, "auto"),
        (ToolChoiceMode::None, "none"),
        (ToolChoiceMode::Required, "any"),
    ],
};

#[derive(Debug, Clone)]
pub struct MistralAdapter {
    compat: CompatClient,
}

impl MistralAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut compat = CompatClient::new(ProviderKind::Mistral, client, base_url, &MAPPINGS);
        compat.stream_usage_option = false;
        Self { compat }
    }

    pub fn from_preset(client: reqwest::Client) -> Self {
        Self::new(client, ProviderKind::Mistral.preset().base_url)
    }
}

#[async_trait]
impl ProviderAdapter for MistralAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mistral
    }

    fn supports(&self, request_type: RequestType) -> bool {
        matches!(request_type, RequestType::Chat | RequestType::Embeddings)
    }

    async fn call(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse> {
        match request.request_type() {
            RequestType::Chat => self.compat.chat(request, credential).await,
            RequestType::Embeddings => self.compat.embeddings(request, credential).await,
            other => Err(unsupported(self.kind(), other)),
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
