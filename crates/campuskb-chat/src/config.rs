//! LLM configuration persistence and provider selection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use campuskb_core::{Error, Result};

use crate::types::{LLMConfigResponse, LLMConfigUpdate, LLMProvider};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-20241022";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";

pub const OPENAI_URL: &str = "https://api.openai.com/v1";
pub const GROQ_URL: &str = "https://api.groq.com/openai/v1";
pub const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";

pub const OPENAI_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo"];
pub const ANTHROPIC_MODELS: &[&str] = &["claude-3-5-sonnet-20241022", "claude-3-5-haiku-20241022"];
pub const GROQ_MODELS: &[&str] = &["llama-3.3-70b-versatile", "llama-3.1-8b-instant"];

/// Stored LLM configuration (`llm-config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    #[serde(default = "default_preferred")]
    pub preferred_provider: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
    /// Replaces the OpenAI endpoint, e.g. a local OpenAI-compatible server.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_preferred() -> String {
    "auto".into()
}
fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.into()
}
fn default_anthropic_model() -> String {
    DEFAULT_ANTHROPIC_MODEL.into()
}
fn default_groq_model() -> String {
    DEFAULT_GROQ_MODEL.into()
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            preferred_provider: default_preferred(),
            openai_api_key: None,
            anthropic_api_key: None,
            groq_api_key: None,
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            groq_model: default_groq_model(),
            base_url: None,
            config_path: PathBuf::new(),
        }
    }
}

/// A provider ready to be called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub provider: LLMProvider,
    pub model: String,
    pub api_key: String,
    /// API root without a trailing slash.
    pub base_url: String,
}

impl LLMConfig {
    /// Load from file, then fill missing API keys from the environment.
    pub fn load(config_path: &Path) -> Self {
        let mut config = Self::read(config_path);
        config.apply_env_fallback();
        config
    }

    /// Load from file only. A missing or unreadable file yields defaults.
    pub fn read(config_path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(config_path) {
            Ok(data) => serde_json::from_str::<LLMConfig>(&data).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", config_path.display(), e);
                LLMConfig::default()
            }),
            Err(_) => LLMConfig::default(),
        };
        config.config_path = config_path.to_path_buf();
        config
    }

    fn apply_env_fallback(&mut self) {
        if self.openai_api_key.is_none() {
            self.openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if self.anthropic_api_key.is_none() {
            self.anthropic_api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        }
        if self.groq_api_key.is_none() {
            self.groq_api_key = std::env::var("GROQ_API_KEY").ok();
        }
        if self.base_url.is_none() {
            self.base_url = std::env::var("CAMPUSKB_LLM_BASE_URL").ok();
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.config_path, json)?;
        info!("Saved LLM config to {}", self.config_path.display());
        Ok(())
    }

    /// Merge an update. Empty strings clear keys.
    pub fn apply_update(&mut self, update: &LLMConfigUpdate) -> Result<()> {
        if let Some(p) = &update.preferred_provider {
            match p.as_str() {
                "auto" | "openai" | "anthropic" | "groq" => self.preferred_provider = p.clone(),
                other => {
                    return Err(Error::InvalidConfig(format!("unknown provider: {}", other)));
                }
            }
        }
        set_key(&mut self.openai_api_key, &update.openai_api_key);
        set_key(&mut self.anthropic_api_key, &update.anthropic_api_key);
        set_key(&mut self.groq_api_key, &update.groq_api_key);
        set_key(&mut self.base_url, &update.base_url);
        if let Some(m) = &update.openai_model {
            self.openai_model = m.clone();
        }
        if let Some(m) = &update.anthropic_model {
            self.anthropic_model = m.clone();
        }
        if let Some(m) = &update.groq_model {
            self.groq_model = m.clone();
        }
        Ok(())
    }

    /// Resolve which provider and model to use.
    ///
    /// An explicit preference must have its key configured. In auto mode the
    /// order is Anthropic > Groq > OpenAI.
    pub fn resolve_provider(&self) -> Option<ResolvedProvider> {
        let order: &[LLMProvider] = match self.preferred_provider.as_str() {
            "openai" => &[LLMProvider::OpenAI],
            "anthropic" => &[LLMProvider::Anthropic],
            "groq" => &[LLMProvider::Groq],
            "auto" => &[LLMProvider::Anthropic, LLMProvider::Groq, LLMProvider::OpenAI],
            _ => &[],
        };
        order.iter().find_map(|&p| self.target(p))
    }

    fn target(&self, provider: LLMProvider) -> Option<ResolvedProvider> {
        let (key, model, url) = match provider {
            LLMProvider::OpenAI => (
                &self.openai_api_key,
                &self.openai_model,
                self.base_url.as_deref().unwrap_or(OPENAI_URL),
            ),
            LLMProvider::Anthropic => (&self.anthropic_api_key, &self.anthropic_model, ANTHROPIC_URL),
            LLMProvider::Groq => (&self.groq_api_key, &self.groq_model, GROQ_URL),
        };
        key.as_ref().map(|k| ResolvedProvider {
            provider,
            model: model.clone(),
            api_key: k.clone(),
            base_url: url.trim_end_matches('/').to_string(),
        })
    }

    /// Public view of the config; never includes API keys.
    pub fn to_response(&self) -> LLMConfigResponse {
        LLMConfigResponse {
            preferred_provider: self.preferred_provider.clone(),
            openai_configured: self.openai_api_key.is_some(),
            anthropic_configured: self.anthropic_api_key.is_some(),
            groq_configured: self.groq_api_key.is_some(),
            openai_model: self.openai_model.clone(),
            anthropic_model: self.anthropic_model.clone(),
            groq_model: self.groq_model.clone(),
            base_url: self.base_url.clone(),
            active_provider: self.resolve_provider().map(|r| r.provider.to_string()),
            available_models: self.available_models(),
        }
    }

    pub fn available_models(&self) -> Vec<String> {
        let models = match self.resolve_provider().map(|r| r.provider) {
            Some(LLMProvider::OpenAI) => OPENAI_MODELS,
            Some(LLMProvider::Anthropic) => ANTHROPIC_MODELS,
            Some(LLMProvider::Groq) => GROQ_MODELS,
            None => &[],
        };
        models.iter().map(|s| s.to_string()).collect()
    }
}

fn set_key(slot: &mut Option<String>, update: &Option<String>) {
    if let Some(value) = update {
        let value = value.trim();
        *slot = (!value.is_empty()).then(|| value.to_string());
    }
}
