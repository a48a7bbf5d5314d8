use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::providers::ProviderKind;
use crate::store::write_json_atomic;

pub const CONFIG_FILENAME: &str = "config.json";

/// Values that ship in the sample config and must never be sent as credentials.
pub const PLACEHOLDER_KEYS: &[&str] = &["sk-...", "sk-your-key-here", "r8_your-token-here"];

#[derive(Debug, Error)]
pub enum ConfigReadError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted plugin settings. Unknown keys are ignored; missing or invalid keys default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openai_api_key: String,
    pub stability_api_key: String,
    pub replicate_api_key: String,
    #[serde(deserialize_with = "provider_any_case")]
    pub default_provider: ProviderKind,
    pub default_model: String,
    pub default_size: String,
    pub default_quality: String,
    pub default_save_directory: PathBuf,
    pub local_endpoint: String,
    pub use_proxy: bool,
    pub proxy_url: String,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            stability_api_key: String::new(),
            replicate_api_key: String::new(),
            default_provider: ProviderKind::OpenAi,
            default_model: "dall-e-3".to_string(),
            default_size: "1024x1024".to_string(),
            default_quality: "standard".to_string(),
            default_save_directory: default_save_directory(),
            local_endpoint: "http://127.0.0.1:7860".to_string(),
            use_proxy: false,
            proxy_url: String::new(),
            request_timeout_secs: 120,
        }
    }
}

impl Config {
    pub fn file_api_key(&self, provider: ProviderKind) -> Option<&str> {
        let value = match provider {
            ProviderKind::OpenAi => &self.openai_api_key,
            ProviderKind::Stability => &self.stability_api_key,
            ProviderKind::Replicate => &self.replicate_api_key,
            ProviderKind::Local => return None,
        };
        Some(value.as_str())
    }

    /// Resolves a provider key: direct input, then environment, then config file.
    pub fn resolve_api_key<F>(
        &self,
        provider: ProviderKind,
        input: &KeyInput,
        env_lookup: F,
    ) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider_config = provider.config();
        if !provider_config.requires_api_key() {
            return None;
        }
        let env_value = if input.use_env {
            provider_config.env_key_name.and_then(|name| env_lookup(name))
        } else {
            None
        };
        let file_value = if input.use_config {
            self.file_api_key(provider)
        } else {
            None
        };
        resolve_secret(input.direct.as_deref(), env_value.as_deref(), file_value)
    }

    pub fn proxy(&self) -> Option<&str> {
        let url = self.proxy_url.trim();
        if self.use_proxy && !url.is_empty() {
            Some(url)
        } else {
            None
        }
    }

    /// Copy safe to print: secrets reduced to a short prefix.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        for key in [
            &mut copy.openai_api_key,
            &mut copy.stability_api_key,
            &mut copy.replicate_api_key,
        ] {
            if !key.is_empty() {
                let prefix: String = key.chars().take(4).collect();
                *key = format!("{prefix}…");
            }
        }
        copy
    }
}

/// Request-scoped key sources chosen in the host form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInput {
    pub direct: Option<String>,
    pub use_env: bool,
    pub use_config: bool,
}

impl Default for KeyInput {
    fn default() -> Self {
        Self {
            direct: None,
            use_env: true,
            use_config: true,
        }
    }
}

/// First usable value in precedence order `direct > env > file`.
pub fn resolve_secret(
    direct: Option<&str>,
    env: Option<&str>,
    file: Option<&str>,
) -> Option<String> {
    [direct, env, file]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty() && !PLACEHOLDER_KEYS.contains(value))
        .map(str::to_string)
}

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `config.json` next to the running executable.
    pub fn beside_executable() -> Self {
        Self::new(install_dir().join(CONFIG_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_load(&self) -> Result<Config, ConfigReadError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigReadError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let stored: Value = serde_json::from_str(&raw).map_err(|source| ConfigReadError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(merge_with_defaults(stored))
    }

    /// Never fails: an unreadable file is logged and built-in defaults are used.
    pub fn load(&self) -> Config {
        match self.try_load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load config; using defaults");
                Config::default()
            }
        }
    }

    pub fn save(&self, config: &Config) -> anyhow::Result<()> {
        let payload: Value = serde_json::to_value(config)?;
        write_json_atomic(&self.path, &payload)?;
        tracing::debug!(path = %self.path.display(), "config saved");
        Ok(())
    }
}

/// Overlays stored keys onto the defaults one at a time, so a bad value only
/// costs its own key.
fn merge_with_defaults(stored: Value) -> Config {
    let defaults = Config::default();
    let Value::Object(stored) = stored else {
        tracing::warn!("config file is not a JSON object; using defaults");
        return defaults;
    };
    let mut merged = match serde_json::to_value(&defaults) {
        Ok(Value::Object(map)) => map,
        _ => return defaults,
    };
    for (key, value) in stored {
        if !merged.contains_key(&key) {
            continue;
        }
        let mut candidate: Map<String, Value> = merged.clone();
        candidate.insert(key.clone(), value);
        match serde_json::from_value::<Config>(Value::Object(candidate.clone())) {
            Ok(_) => merged = candidate,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "ignoring invalid config value");
            }
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
}

fn provider_any_case<'de, D>(deserializer: D) -> Result<ProviderKind, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_save_directory() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Pictures")
        .join("AI_Images")
}
