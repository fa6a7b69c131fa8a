use crate::catalog::{ModelCatalog, ModelInfo};
use crate::credentials::EnvCredentialResolver;
use crate::error::{GatewayError, Result};
use crate::gate::Gate;
use crate::providers::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "llm-gateway.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Owner assumed when a request carries no `x-owner-id` header.
    #[serde(default = "default_owner")]
    pub default_owner: String,
    /// Per-provider overrides of the built-in presets, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverride>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub keys: Vec<CallerKeyConfig>,
    #[serde(default)]
    pub gates: Vec<Gate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageConfig {
    /// JSONL file for usage outcomes. Unset disables the file sink.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// A caller-supplied provider key, read from an environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerKeyConfig {
    pub owner_id: String,
    pub provider: ProviderKind,
    pub key_env: String,
}

fn default_port() -> u16 {
    4222
}

fn default_owner() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_max_entries() -> usize {
    1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            default_owner: default_owner(),
            providers: HashMap::new(),
            cache: CacheConfig::default(),
            usage: UsageConfig::default(),
            models: Vec::new(),
            keys: Vec::new(),
            gates: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(GatewayError::config(format!(
            "No config file found. Searched: {}. Create one from config.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    fn validate(&self) -> Result<()> {
        for name in self.providers.keys() {
            if ProviderKind::from_name(name).is_none() {
                return Err(GatewayError::config(format!(
                    "Unknown provider '{name}'. Known providers: openai, anthropic, google, mistral"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for gate in &self.gates {
            if gate.id.trim().is_empty() || gate.model.trim().is_empty() {
                return Err(GatewayError::config(format!(
                    "Gate '{}' needs both an id and a model",
                    gate.name
                )));
            }
            if !seen.insert((gate.owner_id.as_str(), gate.id.as_str())) {
                return Err(GatewayError::config(format!(
                    "Duplicate gate id '{}' for owner '{}'",
                    gate.id, gate.owner_id
                )));
            }
        }
        Ok(())
    }

    fn provider_override(&self, kind: ProviderKind) -> Option<&ProviderOverride> {
        self.providers
            .iter()
            .find(|(name, _)| ProviderKind::from_name(name) == Some(kind))
            .map(|(_, o)| o)
    }

    /// Effective base URL per provider (config override or preset default).
    pub fn base_urls(&self) -> HashMap<ProviderKind, String> {
        ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let url = self
                    .provider_override(kind)
                    .and_then(|o| o.base_url.clone())
                    .unwrap_or_else(|| kind.preset().base_url.to_string());
                (kind, url)
            })
            .collect()
    }

    /// Built-in catalog plus the `[[models]]` entries.
    pub fn catalog(&self) -> ModelCatalog {
        self.models
            .iter()
            .cloned()
            .fold(ModelCatalog::builtin(), ModelCatalog::with_model)
    }

    pub fn credential_resolver(&self) -> EnvCredentialResolver {
        let mut resolver = EnvCredentialResolver::from_presets();
        for kind in ProviderKind::ALL {
            if let Some(var) = self.provider_override(kind).and_then(|o| o.api_key_env.clone()) {
                resolver = resolver.with_platform_env(kind, var);
            }
        }
        for key in &self.keys {
            resolver = resolver.with_caller_env(key.owner_id.clone(), key.provider, key.key_env.clone());
        }
        resolver
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from(CONFIG_FILE_NAME));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("llm-gateway")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("llm-gateway").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("llm-gateway").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".llm-gateway.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{OverrideField, RoutingStrategy};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
port = 5000

[providers.openai]
base_url = "http://localhost:9999/v1"
api_key_env = "MY_OPENAI_KEY"

[cache]
ttl_secs = 5

[usage]
log_file = "usage.jsonl"

[[models]]
id = "my-finetune"
provider = "openai"
input_per_million = 3.0
output_per_million = 12.0

[[keys]]
owner_id = "acme"
provider = "anthropic"
key_env = "ACME_ANTHROPIC_KEY"

[[gates]]
id = "g-support"
owner_id = "acme"
name = "support"
model = "gpt-4o-mini"
fallback_models = ["claude-3-5-haiku-20241022"]
routing_strategy = "fallback"
allow_overrides = { temperature = true }
temperature = 0.3
"#;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{SAMPLE}").unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.default_owner, "default");
        assert_eq!(config.cache.ttl_secs, 5);
        assert!(config.cache.enabled);
        assert_eq!(config.usage.log_file, Some(PathBuf::from("usage.jsonl")));
        assert_eq!(config.keys[0].provider, ProviderKind::Anthropic);

        let gate = &config.gates[0];
        assert_eq!(gate.routing_strategy, RoutingStrategy::Fallback);
        assert!(gate.allows_override(OverrideField::Temperature));
        assert!(!gate.allows_override(OverrideField::Model));
    }

    #[test]
    fn test_base_urls_from_override_and_preset() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        let urls = config.base_urls();
        assert_eq!(urls[&ProviderKind::OpenAi], "http://localhost:9999/v1");
        assert_eq!(urls[&ProviderKind::Mistral], "https://api.mistral.ai/v1");
    }

    #[test]
    fn test_catalog_includes_custom_models() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        let catalog = config.catalog();
        assert_eq!(catalog.provider_for("my-finetune"), Some(ProviderKind::OpenAi));
        assert!(catalog.get("gpt-4o").is_some());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = GatewayConfig::parse("[providers.nope]\nbase_url = \"http://x\"").unwrap_err();
        assert!(err.to_string().contains("Unknown provider 'nope'"));
    }

    #[test]
    fn test_duplicate_gate_rejected() {
        let toml = r#"
[[gates]]
id = "g"
name = "a"
model = "gpt-4o"

[[gates]]
id = "g"
name = "b"
model = "gpt-4o"
"#;
        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::parse("").unwrap();
        assert_eq!(config.port, 4222);
        assert!(config.gates.is_empty());
        assert_eq!(config.cache.max_entries, 1024);
    }
}
