//! The provider adapter contract and the four built-in adapters.
//!
//! Each adapter speaks one upstream API and translates between it and the
//! unified model. Provider asymmetries (which roles exist, how finish reasons
//! are spelled, how tool choice is expressed) live in a per-adapter
//! [`MappingTables`] value rather than in scattered branching.

pub mod anthropic;
pub mod google;
pub mod mistral;
pub mod openai;
mod openai_compat;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use crate::credentials::Credential;
use crate::error::{GatewayError, Result};
use crate::unified::{FinishReason, RequestType, Role, ToolChoiceMode, UnifiedRequest, UnifiedResponse};

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use mistral::MistralAdapter;
pub use openai::OpenAiAdapter;

/// An incremental provider response.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<UnifiedResponse>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "mistral")]
    Mistral,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::Mistral,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Mistral => "mistral",
        }
    }

    pub fn from_name(name: &str) -> Option<ProviderKind> {
        match name.to_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "google" | "gemini" => Some(ProviderKind::Google),
            "mistral" => Some(ProviderKind::Mistral),
            _ => None,
        }
    }

    /// Whether the provider enforces JSON output itself. Providers without it
    /// get JSON-only instructions appended to the system prompt instead.
    pub fn supports_native_response_format(self) -> bool {
        !matches!(self, ProviderKind::Anthropic)
    }

    pub fn preset(self) -> &'static ProviderPreset {
        match self {
            ProviderKind::OpenAi => &PRESETS[0],
            ProviderKind::Anthropic => &PRESETS[1],
            ProviderKind::Google => &PRESETS[2],
            ProviderKind::Mistral => &PRESETS[3],
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in endpoint defaults. The config file can override both fields.
#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub kind: ProviderKind,
    pub base_url: &'static str,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        kind: ProviderKind::OpenAi,
        base_url: "https://api.openai.com/v1",
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        kind: ProviderKind::Anthropic,
        base_url: "https://api.anthropic.com",
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
    ProviderPreset {
        kind: ProviderKind::Google,
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        default_api_key_env: "GEMINI_API_KEY",
    },
    ProviderPreset {
        kind: ProviderKind::Mistral,
        base_url: "https://api.mistral.ai/v1",
        default_api_key_env: "MISTRAL_API_KEY",
    },
];

// ---------------------------------------------------------------------------
// Mapping tables
// ---------------------------------------------------------------------------

/// Where a unified role ends up on the provider's wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTarget {
    /// Sent as a message with this role string.
    Wire(&'static str),
    /// Not a message on this provider; carried in a separate top-level field.
    OutOfBand,
}

#[derive(Debug)]
pub struct MappingTables {
    pub roles: &'static [(Role, RoleTarget)],
    /// Provider finish reason → unified. Unlisted values map to `Completed`.
    pub finish_reasons: &'static [(&'static str, FinishReason)],
    /// Literal tool-choice modes. Forcing a named function is adapter-specific.
    pub tool_choice: &'static [(ToolChoiceMode, &'static str)],
}

impl MappingTables {
    pub fn role(&self, role: Role) -> RoleTarget {
        self.roles
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, target)| *target)
            .unwrap_or(RoleTarget::Wire("user"))
    }

    pub fn finish_reason(&self, raw: &str) -> FinishReason {
        self.finish_reasons
            .iter()
            .find(|(r, _)| *r == raw)
            .map(|(_, reason)| *reason)
            .unwrap_or(FinishReason::Completed)
    }

    pub fn tool_choice(&self, mode: ToolChoiceMode) -> &'static str {
        self.tool_choice
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, wire)| *wire)
            .unwrap_or("auto")
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// One upstream provider.
///
/// Adapters are stateless per call: the credential is resolved by the caller
/// and passed in, and `request.model` already holds the model to use.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Request types this adapter can serve.
    fn supports(&self, request_type: RequestType) -> bool;

    async fn call(&self, request: &UnifiedRequest, credential: &Credential) -> Result<UnifiedResponse>;

    /// Incremental chat output. The stream ends with exactly one terminal
    /// chunk carrying `finish_reason` and `usage`.
    async fn call_stream(
        &self,
        request: &UnifiedRequest,
        credential: &Credential,
    ) -> Result<ResponseStream> {
        let _ = (request, credential);
        Err(GatewayError::unsupported(self.kind().as_str(), "streaming"))
    }
}

/// The model an adapter should call, as set by the routing engine.
pub(crate) fn target_model(request: &UnifiedRequest) -> Result<&str> {
    request
        .model
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::invalid_request("no model resolved for request"))
}

pub(crate) fn unsupported(kind: ProviderKind, request_type: RequestType) -> GatewayError {
    GatewayError::unsupported(kind.as_str(), format!("{request_type} requests"))
}

// ---------------------------------------------------------------------------
// HTTP helpers shared by the adapters
// ---------------------------------------------------------------------------

/// Send a prepared request and decode a JSON body, mapping HTTP failures to
/// provider errors that carry the upstream status.
pub(crate) async fn send_json<T: DeserializeOwned>(
    kind: ProviderKind,
    builder: reqwest::RequestBuilder,
) -> Result<(T, serde_json::Value)> {
    let response = check_status(kind, builder).await?;
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::provider(kind.as_str(), format!("Failed to read response body: {e}")))?;

    let raw: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
        GatewayError::provider(
            kind.as_str(),
            format!("Failed to parse response: {e}. Body: {}", truncate(&body, 300)),
        )
    })?;
    let parsed: T = serde_json::from_value(raw.clone()).map_err(|e| {
        GatewayError::provider(kind.as_str(), format!("Unexpected response shape: {e}"))
    })?;
    Ok((parsed, raw))
}

/// Send a request and fail with the upstream status and error text on 4xx/5xx.
pub(crate) async fn check_status(
    kind: ProviderKind,
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = builder
        .send()
        .await
        .map_err(|e| GatewayError::provider(kind.as_str(), format!("Request failed: {e}")))?;

    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::provider_status(
            kind.as_str(),
            status,
            upstream_error_message(&body),
        ));
    }
    Ok(response)
}

/// Parse an upstream SSE body into `(event, data)` pairs, stopping at `[DONE]`.
pub(crate) fn sse_data(
    kind: ProviderKind,
    response: reqwest::Response,
) -> BoxStream<'static, Result<(String, String)>> {
    response
        .bytes_stream()
        .eventsource()
        .take_while(|event| {
            let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
            futures::future::ready(!done)
        })
        .map(move |event| match event {
            Ok(e) => Ok((e.event, e.data)),
            Err(e) => Err(GatewayError::provider(kind.as_str(), format!("Stream read failed: {e}"))),
        })
        .boxed()
}

/// Pull the human-readable message out of a provider error body.
fn upstream_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| truncate(body, 500).to_string())
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
