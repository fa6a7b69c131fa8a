//! Upstream credential resolution.
//!
//! A caller may bring their own key for a provider (BYOK); otherwise the
//! platform key is used. Keys are resolved on every adapter call and never
//! cached by the gateway.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{GatewayError, Result};
use crate::providers::ProviderKind;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub used_platform_key: bool,
}

impl Credential {
    pub fn platform(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            used_platform_key: true,
        }
    }

    pub fn caller(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            used_platform_key: false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key", &"<redacted>")
            .field("used_platform_key", &self.used_platform_key)
            .finish()
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, provider: ProviderKind, caller_id: Option<&str>) -> Result<Credential>;
}

/// Reads keys from environment variables at call time.
///
/// Platform keys come from one variable per provider; caller keys from a
/// variable registered per `(caller, provider)`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialResolver {
    platform_env: HashMap<ProviderKind, String>,
    caller_env: HashMap<(String, ProviderKind), String>,
}

impl EnvCredentialResolver {
    /// Platform keys from each provider preset's default variable.
    pub fn from_presets() -> Self {
        let mut resolver = Self::default();
        for kind in ProviderKind::ALL {
            resolver
                .platform_env
                .insert(kind, kind.preset().default_api_key_env.to_string());
        }
        resolver
    }

    pub fn with_platform_env(mut self, provider: ProviderKind, var: impl Into<String>) -> Self {
        self.platform_env.insert(provider, var.into());
        self
    }

    pub fn with_caller_env(
        mut self,
        caller_id: impl Into<String>,
        provider: ProviderKind,
        var: impl Into<String>,
    ) -> Self {
        self.caller_env.insert((caller_id.into(), provider), var.into());
        self
    }
}

fn read_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, provider: ProviderKind, caller_id: Option<&str>) -> Result<Credential> {
        if let Some(caller) = caller_id {
            let var = self.caller_env.get(&(caller.to_string(), provider));
            if let Some(key) = var.and_then(|v| read_env(v)) {
                return Ok(Credential::caller(key));
            }
        }

        let var = self
            .platform_env
            .get(&provider)
            .map(String::as_str)
            .unwrap_or(provider.preset().default_api_key_env);

        read_env(var).map(Credential::platform).ok_or_else(|| {
            GatewayError::config(format!(
                "No API key for {provider}: environment variable '{var}' not set"
            ))
        })
    }
}

/// Fixed keys held in memory; useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialResolver {
    platform: HashMap<ProviderKind, String>,
    caller: HashMap<(String, ProviderKind), String>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform_key(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.platform.insert(provider, key.into());
        self
    }

    pub fn with_caller_key(
        mut self,
        caller_id: impl Into<String>,
        provider: ProviderKind,
        key: impl Into<String>,
    ) -> Self {
        self.caller.insert((caller_id.into(), provider), key.into());
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, provider: ProviderKind, caller_id: Option<&str>) -> Result<Credential> {
        if let Some(key) = caller_id.and_then(|c| self.caller.get(&(c.to_string(), provider))) {
            return Ok(Credential::caller(key.clone()));
        }
        self.platform
            .get(&provider)
            .map(|k| Credential::platform(k.clone()))
            .ok_or_else(|| GatewayError::config(format!("No API key configured for {provider}")))
    }
}
