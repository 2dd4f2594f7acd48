//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so a partial file (or no file
//! at all) yields a usable configuration.
//!
//! # Sections
//!
//! - **generator**: image service endpoint, model, quality, credentials
//! - **rate_limit**: requests per minute and token acquire timeout
//! - **retry**: attempts, backoff and per-attempt timeout
//! - **orchestrator**: worker count, fail-fast, cancellation grace
//! - **fingerprint**: which parameters feed the asset key
//! - **storage**: cache, input, output and report directories
//! - **logging**: default log level
//!
//! `${VAR}` references are replaced with environment values before parsing.
//! Unset variables are left as written.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::generation::RetryPolicy;
use crate::governor::{GovernorConfig, MAX_ACQUIRE_TIMEOUT_MS};
use crate::orchestrator::OrchestratorConfig;
use crate::resolver::KeyPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("API key not found: set {0}")]
    MissingApiKey(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub generator: GeneratorConfig,
    pub rate_limit: GovernorConfig,
    pub retry: RetryPolicy,
    pub orchestrator: OrchestratorConfig,
    pub fingerprint: FingerprintConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Image generation service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,
    pub model: String,
    /// "standard" or "hd"
    pub quality: String,
    /// Fixed output size for every ratio; per-ratio native sizes when unset
    pub size: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Explicit key; takes precedence over `api_key_env`
    pub api_key: Option<String>,
    /// Overrides the per-quality price
    pub cost_per_call: Option<f64>,
    /// HTTP client timeout, independent of the per-attempt limit
    pub request_timeout_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "dall-e-3".to_string(),
            quality: "hd".to_string(),
            size: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            cost_per_call: None,
            request_timeout_ms: 180_000,
        }
    }
}

impl GeneratorConfig {
    /// Price of one image call.
    pub fn cost_per_call(&self) -> f64 {
        self.cost_per_call.unwrap_or(match self.quality.as_str() {
            "standard" => 0.04,
            _ => 0.08,
        })
    }

    /// Identity of the generation service as it affects output bytes.
    pub fn profile(&self) -> String {
        format!(
            "{}:{}:{}",
            self.model,
            self.quality,
            self.size.as_deref().unwrap_or("native")
        )
    }

    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey(self.api_key_env.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Generate separate assets per locale
    pub locale_in_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            input_dir: PathBuf::from("input_assets"),
            output_dir: PathBuf::from("output"),
            report_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::from_toml_str(&interpolate_env(&content))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_workers == 0 {
            return Err(ConfigError::Invalid("orchestrator.max_workers must be at least 1".into()));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.requests_per_minute must be at least 1".into(),
            ));
        }
        if self.rate_limit.acquire_timeout_ms > MAX_ACQUIRE_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.acquire_timeout_ms must be at most {MAX_ACQUIRE_TIMEOUT_MS}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry.attempt_timeout_ms must be positive".into()));
        }
        if !matches!(self.generator.quality.as_str(), "standard" | "hd") {
            return Err(ConfigError::Invalid(format!(
                "generator.quality must be 'standard' or 'hd', got '{}'",
                self.generator.quality
            )));
        }
        if self.generator.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("generator.endpoint is empty".into()));
        }
        Ok(())
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            locale_in_key: self.fingerprint.locale_in_key,
            generator_profile: self.generator.profile(),
        }
    }
}

/// Replace `${VAR}` with the value of `VAR`. Unset variables stay verbatim.
pub fn interpolate_env(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env::var(name) {
                    Ok(value) if !name.is_empty() => out.push_str(&value),
                    _ => out.push_str(&rest[start..start + 3 + end]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
