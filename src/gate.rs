//! Gates and gate resolution.
//!
//! A gate is a caller-owned routing policy: which model to call, what to fall
//! back to, and which request fields the caller may override. [`resolve`]
//! merges an incoming request with the gate and never fails; unusable
//! overrides silently fall back to the gate's stored values.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::ModelCatalog;
use crate::unified::{ResponseFormat, UnifiedRequest};

/// Metadata key recording how structured output was applied.
pub const STRUCTURED_OUTPUT_METADATA_KEY: &str = "structuredOutput";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStrategy {
    #[default]
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "fallback")]
    Fallback,
    #[serde(rename = "round-robin", alias = "round_robin")]
    RoundRobin,
}

impl RoutingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingStrategy::Single => "single",
            RoutingStrategy::Fallback => "fallback",
            RoutingStrategy::RoundRobin => "round-robin",
        }
    }
}

/// Request fields a gate can let the caller override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideField {
    Model,
    SystemPrompt,
    Temperature,
    MaxTokens,
    TopP,
}

/// Per-field override permissions. A missing key means "not overridable".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_tokens")]
    pub max_tokens: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "top_p")]
    pub top_p: Option<bool>,
}

/// `true`/`false` for every field at once, or a per-field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowOverrides {
    All(bool),
    Fields(OverrideFields),
}

impl AllowOverrides {
    pub fn allows(&self, field: OverrideField) -> bool {
        match self {
            AllowOverrides::All(allowed) => *allowed,
            AllowOverrides::Fields(fields) => {
                let flag = match field {
                    OverrideField::Model => fields.model,
                    OverrideField::Temperature => fields.temperature,
                    OverrideField::MaxTokens => fields.max_tokens,
                    OverrideField::TopP => fields.top_p,
                    OverrideField::SystemPrompt => None,
                };
                flag.unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatType {
    Text,
    JsonObject,
    JsonSchema,
}

fn default_owner() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub id: String,
    #[serde(default = "default_owner", alias = "ownerId")]
    pub owner_id: String,
    pub name: String,
    pub model: String,
    #[serde(default, alias = "fallbackModels")]
    pub fallback_models: Vec<String>,
    #[serde(default, alias = "routingStrategy")]
    pub routing_strategy: RoutingStrategy,
    /// Absent means every field is overridable.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "allowOverrides")]
    pub allow_overrides: Option<AllowOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "topP")]
    pub top_p: Option<f64>,
    #[serde(default, alias = "responseFormatEnabled")]
    pub response_format_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "responseFormatType")]
    pub response_format_type: Option<ResponseFormatType>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "responseFormatSchema")]
    pub response_format_schema: Option<serde_json::Value>,
}

impl Gate {
    pub fn new(id: impl Into<String>, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: default_owner(),
            name: name.into(),
            model: model.into(),
            fallback_models: Vec::new(),
            routing_strategy: RoutingStrategy::Single,
            allow_overrides: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            response_format_enabled: false,
            response_format_type: None,
            response_format_schema: None,
        }
    }

    pub fn allows_override(&self, field: OverrideField) -> bool {
        self.allow_overrides
            .as_ref()
            .map(|policy| policy.allows(field))
            .unwrap_or(true)
    }

    /// The gate's own structured-output setting, if enabled.
    pub fn response_format(&self) -> Option<ResponseFormat> {
        if !self.response_format_enabled {
            return None;
        }
        match (self.response_format_type, &self.response_format_schema) {
            (Some(ResponseFormatType::Text), _) => None,
            (Some(ResponseFormatType::JsonSchema), Some(schema)) | (None, Some(schema)) => {
                Some(ResponseFormat::JsonSchema {
                    name: Some(self.name.clone()),
                    schema: schema.clone(),
                })
            }
            _ => Some(ResponseFormat::JsonObject),
        }
    }
}

/// Keep the caller's value when the gate allows it, otherwise take the gate's.
fn merge<T>(gate: &Gate, field: OverrideField, requested: Option<T>, stored: Option<T>) -> Option<T> {
    match requested {
        Some(value) if gate.allows_override(field) => Some(value),
        _ => stored,
    }
}

/// Merge a request with its gate's policy.
pub fn resolve(gate: &Gate, mut request: UnifiedRequest, catalog: &ModelCatalog) -> UnifiedRequest {
    let gate_model = catalog
        .normalize(&gate.model)
        .unwrap_or_else(|| gate.model.clone());

    let model = match request.model.as_deref() {
        Some(requested) if gate.allows_override(OverrideField::Model) => {
            catalog.normalize(requested).unwrap_or_else(|| {
                debug!(gate = %gate.id, requested, "Unknown override model, using gate model");
                gate_model.clone()
            })
        }
        _ => gate_model,
    };

    request.gate_id = gate.id.clone();
    request.model = Some(model.clone());

    let Some(chat) = request.as_chat_mut() else {
        return request;
    };

    chat.system_prompt = merge(
        gate,
        OverrideField::SystemPrompt,
        chat.system_prompt.take(),
        gate.system_prompt.clone(),
    );
    chat.temperature = merge(gate, OverrideField::Temperature, chat.temperature, gate.temperature);
    chat.max_tokens = merge(gate, OverrideField::MaxTokens, chat.max_tokens, gate.max_tokens);
    chat.top_p = merge(gate, OverrideField::TopP, chat.top_p, gate.top_p);

    let format = gate
        .response_format()
        .or_else(|| chat.response_format.take())
        .filter(|f| *f != ResponseFormat::Text);
    let Some(format) = format else {
        chat.response_format = None;
        return request;
    };

    let mode = if catalog.supports_native_response_format(&model) {
        chat.response_format = Some(format);
        "native"
    } else {
        debug!(gate = %gate.id, model = %model, "No native response format, injecting JSON instructions");
        chat.response_format = None;
        let instructions = json_instructions(&format);
        chat.system_prompt = Some(match chat.system_prompt.take() {
            Some(prompt) if !prompt.is_empty() => format!("{prompt}\n\n{instructions}"),
            _ => instructions,
        });
        "prompt"
    };
    request.metadata.insert(
        STRUCTURED_OUTPUT_METADATA_KEY.to_string(),
        serde_json::Value::String(mode.to_string()),
    );
    request
}

fn json_instructions(format: &ResponseFormat) -> String {
    let mut text = String::from(
        "Respond only with valid JSON. Do not include any explanation, markdown code fences, \
         or other text before or after the JSON.",
    );
    if let ResponseFormat::JsonSchema { schema, .. } = format {
        let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        text.push_str("\n\nThe JSON must conform to this JSON Schema:\n");
        text.push_str(&pretty);
    }
    text
}
