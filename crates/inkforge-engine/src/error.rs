use std::time::Duration;

use inkforge_contracts::{Mode, ProviderKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Everything that can end a dispatch. The host shows `Display` text to the user.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(
        "No API key found for {provider}. Enter it in the API Key field, set {env_key}, \
         or add \"{config_key}\" to config.json."
    )]
    MissingApiKey {
        provider: &'static str,
        env_key: &'static str,
        config_key: &'static str,
    },

    #[error("{provider} rejected the API key: {message}")]
    Authentication { provider: ProviderKind, message: String },

    #[error("{provider} does not support {mode} requests")]
    UnsupportedMode { provider: ProviderKind, mode: Mode },

    #[error("Cannot build mask: {0}")]
    UnsupportedMask(String),

    #[error("{provider} rate limit hit: {body}")]
    RateLimit {
        provider: ProviderKind,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("{provider} request failed ({status}): {body}")]
    ProviderHttp {
        provider: ProviderKind,
        status: u16,
        body: String,
    },

    #[error("Connection to {provider} failed: {message}")]
    Network {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} job did not finish within {}s", .waited.as_secs())]
    Timeout {
        provider: ProviderKind,
        waited: Duration,
    },

    #[error("Could not decode {provider} response: {message}")]
    Decode {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} generation failed: {message}")]
    JobFailed {
        provider: ProviderKind,
        message: String,
    },

    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn missing_api_key(provider: ProviderKind) -> Self {
        let config = provider.config();
        GenerationError::MissingApiKey {
            provider: config.display_name,
            env_key: config.env_key_name.unwrap_or("N/A"),
            config_key: config.config_key_name.unwrap_or("api_key"),
        }
    }

    pub fn decode(provider: ProviderKind, message: impl Into<String>) -> Self {
        GenerationError::Decode {
            provider,
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimit { .. } | GenerationError::Network { .. }
        )
    }

    /// Stable label stored in history entries.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Validation(_) => "validation",
            GenerationError::MissingApiKey { .. } => "missing_api_key",
            GenerationError::Authentication { .. } => "authentication",
            GenerationError::UnsupportedMode { .. } => "unsupported_mode",
            GenerationError::UnsupportedMask(_) => "unsupported_mask",
            GenerationError::RateLimit { .. } => "rate_limit",
            GenerationError::ProviderHttp { .. } => "provider_http",
            GenerationError::Network { .. } => "network",
            GenerationError::Timeout { .. } => "timeout",
            GenerationError::Decode { .. } => "decode",
            GenerationError::JobFailed { .. } => "job_failed",
            GenerationError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use inkforge_contracts::ProviderKind;

    use super::GenerationError;

    #[test]
    fn only_rate_limit_and_network_are_retryable() {
        let rate = GenerationError::RateLimit {
            provider: ProviderKind::OpenAi,
            retry_after: None,
            body: String::new(),
        };
        let network = GenerationError::Network {
            provider: ProviderKind::Replicate,
            message: "connection reset".to_string(),
        };
        let http = GenerationError::ProviderHttp {
            provider: ProviderKind::Stability,
            status: 500,
            body: "oops".to_string(),
        };
        assert!(rate.is_retryable());
        assert!(network.is_retryable());
        assert!(!http.is_retryable());
        assert!(!GenerationError::decode(ProviderKind::Local, "bad").is_retryable());
    }

    #[test]
    fn missing_key_message_names_every_source() {
        let message = GenerationError::missing_api_key(ProviderKind::Replicate).to_string();
        assert!(message.contains("Replicate"));
        assert!(message.contains("REPLICATE_API_TOKEN"));
        assert!(message.contains("replicate_api_key"));
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = GenerationError::Timeout {
            provider: ProviderKind::Replicate,
            waited: Duration::from_secs(180),
        };
        assert_eq!(err.to_string(), "replicate job did not finish within 180s");
        assert_eq!(err.kind(), "timeout");
    }
}
