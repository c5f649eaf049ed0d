use crate::adapters::router::{Protocol, ProviderDescriptor};
use crate::domain::agent::LoopConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Default model to use
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Provider used when neither the CLI nor the config names one
pub const DEFAULT_PROVIDER: &str = "openai";

/// Provider configuration. Every field is optional so a known provider can be
/// configured with nothing more than an `api_key`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub protocol: Option<Protocol>,
    pub base_url: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub supports_tools: Option<bool>,
    #[serde(default)]
    pub no_tool_models: Vec<String>,
}

/// Agentic loop tuning
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AgentConfig {
    pub max_iterations: Option<u32>,
    pub max_tool_result_chars: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl AgentConfig {
    fn overlay(&self, local: &AgentConfig) -> AgentConfig {
        AgentConfig {
            max_iterations: local.max_iterations.or(self.max_iterations),
            max_tool_result_chars: local.max_tool_result_chars.or(self.max_tool_result_chars),
            max_tokens: local.max_tokens.or(self.max_tokens),
            temperature: local.temperature.or(self.temperature),
        }
    }

    pub fn loop_config(&self, model: impl Into<String>) -> LoopConfig {
        let defaults = LoopConfig::new(model);
        LoopConfig {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.or(defaults.temperature),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations).max(1),
            max_tool_result_chars: self
                .max_tool_result_chars
                .unwrap_or(defaults.max_tool_result_chars),
            ..defaults
        }
    }
}

/// Resolve environment variable placeholders like {env:VAR_NAME}
fn resolve_env_var(value: &str) -> String {
    match value.strip_prefix("{env:").and_then(|rest| rest.strip_suffix('}')) {
        Some(var_name) => std::env::var(var_name).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

/// `OPENROUTER_API_KEY` for `openrouter`, `MY_LLM_API_KEY` for `my-llm`.
fn api_key_env_name(provider: &str) -> String {
    let stem: String = provider
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_API_KEY", stem)
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Default model for the agent
    pub model: Option<String>,

    /// Provider used for completions
    pub active_provider: Option<String>,

    /// Provider configurations
    #[serde(default)]
    pub provider: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub agent: AgentConfig,

    /// Prepended to every conversation as a system message
    pub system_prompt: Option<String>,
}

/// Provider descriptor plus the key to authenticate with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub descriptor: ProviderDescriptor,
    pub api_key: String,
}

/// Configuration manager that handles loading and merging configs
pub struct ConfigManager {
    global_path: Option<PathBuf>,
    global_config: Option<Config>,
    local_config: Option<Config>,
    merged_config: Config,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::with_global_path(Self::global_config_path())
    }

    /// Use `path` in place of the per-user config file.
    pub fn with_global_path(path: Option<PathBuf>) -> Self {
        Self {
            global_path: path,
            global_config: None,
            local_config: None,
            merged_config: Config::default(),
        }
    }

    /// Load configuration from both global and local sources
    pub fn load(&mut self, workspace_path: Option<&Path>) -> Result<(), ConfigError> {
        self.global_config = match &self.global_path {
            Some(path) => Self::read_config(path)?,
            None => None,
        };

        self.local_config = match workspace_path {
            Some(path) => Self::read_config(&Self::local_config_path(path))?,
            None => None,
        };

        self.merged_config = self.merge_configs();
        Ok(())
    }

    /// Get the merged configuration
    pub fn config(&self) -> &Config {
        &self.merged_config
    }

    /// ~/.config/plotline/plotline.json
    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("plotline").join("plotline.json"))
    }

    /// .plotline/plotline.json
    fn local_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".plotline").join("plotline.json")
    }

    fn read_config(path: &Path) -> Result<Option<Config>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "loading config");
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.kind()))?;
        let config = serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(Some(config))
    }

    /// Merge global and local configs (local takes precedence)
    fn merge_configs(&self) -> Config {
        let mut merged = self.global_config.clone().unwrap_or_default();

        if let Some(ref local) = self.local_config {
            if local.model.is_some() {
                merged.model = local.model.clone();
            }
            if local.active_provider.is_some() {
                merged.active_provider = local.active_provider.clone();
            }
            if local.system_prompt.is_some() {
                merged.system_prompt = local.system_prompt.clone();
            }

            // Local overrides per provider, not per field
            for (key, value) in &local.provider {
                merged.provider.insert(key.clone(), value.clone());
            }

            merged.agent = merged.agent.overlay(&local.agent);
        }

        if merged.model.is_none() {
            merged.model = Some(DEFAULT_MODEL.to_string());
        }

        merged
    }

    /// Build the descriptor for `name`, or the configured active provider.
    /// Known provider names start from their preset; anything else needs at
    /// least a `base_url`.
    pub fn resolve_provider(&self, name: Option<&str>) -> Result<ResolvedProvider, ConfigError> {
        let config = &self.merged_config;
        let name = name
            .or(config.active_provider.as_deref())
            .unwrap_or(DEFAULT_PROVIDER);
        let settings = config.provider.get(name);

        let mut descriptor = match (ProviderDescriptor::preset(name), settings) {
            (Some(preset), _) => preset,
            (None, Some(settings)) => {
                let base_url = settings
                    .base_url
                    .clone()
                    .ok_or_else(|| ConfigError::MissingBaseUrl(name.to_string()))?;
                ProviderDescriptor::new(name, settings.protocol.unwrap_or_default(), base_url)
            }
            (None, None) => return Err(ConfigError::UnknownProvider(name.to_string())),
        };

        let mut api_key = None;
        if let Some(settings) = settings {
            if let Some(protocol) = settings.protocol.filter(|p| *p != descriptor.protocol) {
                descriptor = ProviderDescriptor::new(name, protocol, descriptor.base_url);
            }
            if let Some(base_url) = &settings.base_url {
                descriptor.base_url = base_url.clone();
            }
            if let Some(endpoint) = &settings.endpoint {
                descriptor.endpoint = endpoint.clone();
            }
            if let Some(supports_tools) = settings.supports_tools {
                descriptor.supports_tools = supports_tools;
            }
            descriptor
                .no_tool_models
                .extend(settings.no_tool_models.iter().cloned());
            for (header, value) in &settings.headers {
                descriptor.extra_headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(header));
                descriptor.extra_headers.push((header.clone(), resolve_env_var(value)));
            }
            api_key = settings.api_key.as_deref().map(resolve_env_var);
        }

        url::Url::parse(&descriptor.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            provider: name.to_string(),
            reason: e.to_string(),
        })?;

        let api_key = api_key
            .or_else(|| std::env::var(api_key_env_name(name)).ok())
            .unwrap_or_default();

        Ok(ResolvedProvider {
            descriptor,
            api_key,
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("IO error: {0:?}")]
    IoError(std::io::ErrorKind),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider {0} has no base_url")]
    MissingBaseUrl(String),

    #[error("Invalid base_url for provider {provider}: {reason}")]
    InvalidBaseUrl { provider: String, reason: String },
}
