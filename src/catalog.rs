//! The model catalog: which provider serves a model, what it costs, and
//! whether the provider can enforce a response format natively.
//!
//! The catalog is built once at startup (built-in table plus any `[[models]]`
//! entries from the config) and is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::providers::ProviderKind;
use crate::unified::Usage;

/// One entry of the catalog. Prices are USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, provider: ProviderKind, input: f64, output: f64) -> Self {
        Self {
            id: id.into(),
            provider,
            input_per_million: input,
            output_per_million: output,
        }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.input_per_million
            + completion_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

const BUILTIN_MODELS: &[(&str, ProviderKind, f64, f64)] = &[
    ("gpt-4o", ProviderKind::OpenAi, 2.5, 10.0),
    ("gpt-4o-mini", ProviderKind::OpenAi, 0.15, 0.6),
    ("gpt-4.1", ProviderKind::OpenAi, 2.0, 8.0),
    ("gpt-4.1-mini", ProviderKind::OpenAi, 0.4, 1.6),
    ("o3-mini", ProviderKind::OpenAi, 1.1, 4.4),
    ("text-embedding-3-small", ProviderKind::OpenAi, 0.02, 0.0),
    ("text-embedding-3-large", ProviderKind::OpenAi, 0.13, 0.0),
    ("dall-e-3", ProviderKind::OpenAi, 0.0, 0.0),
    ("tts-1", ProviderKind::OpenAi, 0.0, 0.0),
    ("claude-3-5-sonnet-20241022", ProviderKind::Anthropic, 3.0, 15.0),
    ("claude-3-5-haiku-20241022", ProviderKind::Anthropic, 0.8, 4.0),
    ("claude-3-7-sonnet-20250219", ProviderKind::Anthropic, 3.0, 15.0),
    ("claude-sonnet-4-20250514", ProviderKind::Anthropic, 3.0, 15.0),
    ("claude-opus-4-20250514", ProviderKind::Anthropic, 15.0, 75.0),
    ("gemini-1.5-pro", ProviderKind::Google, 1.25, 5.0),
    ("gemini-1.5-flash", ProviderKind::Google, 0.075, 0.3),
    ("gemini-2.0-flash", ProviderKind::Google, 0.1, 0.4),
    ("text-embedding-004", ProviderKind::Google, 0.0, 0.0),
    ("mistral-large-latest", ProviderKind::Mistral, 2.0, 6.0),
    ("mistral-small-latest", ProviderKind::Mistral, 0.2, 0.6),
    ("codestral-latest", ProviderKind::Mistral, 0.3, 0.9),
    ("mistral-embed", ProviderKind::Mistral, 0.1, 0.0),
];

const ALIASES: &[(&str, &str)] = &[
    ("claude-3-5-sonnet-latest", "claude-3-5-sonnet-20241022"),
    ("claude-3-5-haiku-latest", "claude-3-5-haiku-20241022"),
    ("claude-3-7-sonnet-latest", "claude-3-7-sonnet-20250219"),
    ("claude-sonnet-4-0", "claude-sonnet-4-20250514"),
    ("claude-opus-4-0", "claude-opus-4-20250514"),
    ("gemini-2.0-flash-001", "gemini-2.0-flash"),
    ("mistral-large", "mistral-large-latest"),
    ("mistral-small", "mistral-small-latest"),
];

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelInfo>,
    aliases: HashMap<String, String>,
}

impl ModelCatalog {
    /// An empty catalog with no aliases.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in table for the four supported providers.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for &(id, provider, input, output) in BUILTIN_MODELS {
            catalog.insert(ModelInfo::new(id, provider, input, output));
        }
        for &(alias, target) in ALIASES {
            catalog.aliases.insert(alias.to_string(), target.to_string());
        }
        catalog
    }

    pub fn with_model(mut self, info: ModelInfo) -> Self {
        self.insert(info);
        self
    }

    pub fn insert(&mut self, mut info: ModelInfo) {
        info.id = info.id.trim().to_lowercase();
        self.models.insert(info.id.clone(), info);
    }

    /// Map a caller-supplied model id to its canonical catalog id.
    ///
    /// Accepts surrounding whitespace, any casing, a `provider/` prefix, and
    /// known aliases. Returns `None` for ids the catalog does not know.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let id = raw.trim().to_lowercase();
        if id.is_empty() {
            return None;
        }
        if self.models.contains_key(&id) {
            return Some(id);
        }
        if let Some(target) = self.aliases.get(&id) {
            return Some(target.clone());
        }
        if let Some((prefix, rest)) = id.split_once('/') {
            if ProviderKind::from_name(prefix).is_some() {
                return self.normalize(rest);
            }
        }
        None
    }

    pub fn get(&self, model: &str) -> Option<&ModelInfo> {
        self.normalize(model).and_then(|id| self.models.get(&id))
    }

    pub fn provider_for(&self, model: &str) -> Option<ProviderKind> {
        self.get(model).map(|m| m.provider)
    }

    /// Whether the provider serving `model` can enforce a response format itself.
    /// Unknown models are treated as lacking native support.
    pub fn supports_native_response_format(&self, model: &str) -> bool {
        self.provider_for(model)
            .map(ProviderKind::supports_native_response_format)
            .unwrap_or(false)
    }

    /// USD cost of a call. Unknown or unpriced models cost nothing.
    pub fn cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.get(model)
            .map(|m| m.cost(prompt_tokens, completion_tokens))
            .unwrap_or(0.0)
    }

    pub fn cost_for_usage(&self, model: &str, usage: &Usage) -> f64 {
        self.cost(model, usage.prompt_tokens, usage.completion_tokens)
    }

    /// All models, sorted by provider then id.
    pub fn models(&self) -> Vec<&ModelInfo> {
        let mut models: Vec<&ModelInfo> = self.models.values().collect();
        models.sort_by(|a, b| {
            a.provider
                .as_str()
                .cmp(b.provider.as_str())
                .then_with(|| a.id.cmp(&b.id))
        });
        models
    }
}
