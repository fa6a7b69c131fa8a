//! Error types for the gateway.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Gate not found: {gate}")]
    GateNotFound { gate: String },

    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    #[error("{provider} error: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("All {attempted} models failed; last error: {last}")]
    AllModelsFailed {
        attempted: usize,
        last: Box<GatewayError>,
    },

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: String,
    },

    #[error("Stream error: {message}")]
    Stream { message: String },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn gate_not_found(gate: impl Into<String>) -> Self {
        Self::GateNotFound { gate: gate.into() }
    }

    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel {
            model: model.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            status: None,
            message: msg.into(),
        }
    }

    pub fn provider_status(provider: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            status: Some(status),
            message: msg.into(),
        }
    }

    pub fn unsupported(provider: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            capability: capability.into(),
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    /// Caller input errors are reported before any upstream call is made.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. } | Self::GateNotFound { .. } | Self::UnknownModel { .. }
        )
    }

    /// HTTP status the host should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } | Self::UnknownModel { .. } | Self::Json(_) => 400,
            Self::GateNotFound { .. } => 404,
            Self::Unsupported { .. } => 501,
            Self::Provider {
                status: Some(s), ..
            } if (400..600).contains(s) => *s,
            Self::AllModelsFailed { last, .. } => last.status_code(),
            Self::Config { .. } | Self::Io(_) | Self::Toml(_) => 500,
            _ => 502,
        }
    }

    /// Short machine-readable kind used in wire error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } | Self::UnknownModel { .. } | Self::Json(_) => {
                "invalid_request_error"
            }
            Self::GateNotFound { .. } => "not_found_error",
            Self::Unsupported { .. } => "unsupported_error",
            Self::Provider {
                status: Some(429), ..
            } => "rate_limit_error",
            Self::AllModelsFailed { last, .. } => last.kind(),
            _ => "api_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
