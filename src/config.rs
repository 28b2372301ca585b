//! Agent configuration, parsed from TOML.
//!
//! Sections map onto the crate's collaborators: `[provider]` selects and
//! keys the AI backend, `[endpoints]` names the storefront and customer
//! capability endpoints, `[rpc]` tunes retry and timeout policy, and
//! `[chat]` carries turn-level generation settings. Everything except the
//! provider and the primary endpoint has defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::core::orchestrator::{OrchestratorSettings, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::error::ConfigError;
use crate::mcp::client::EndpointConfig;
use crate::mcp::rpc::{
    RpcCallOptions, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY, DEFAULT_TIMEOUT,
};
use crate::providers::{ProviderConfig, ProviderKind};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub provider: ProviderSection,
    pub endpoints: EndpointsSection,
    #[serde(default)]
    pub rpc: RpcSection,
    #[serde(default)]
    pub chat: ChatSection,
}

impl AgentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub kind: ProviderKind,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderSection {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsSection {
    pub primary: EndpointSection,
    #[serde(default)]
    pub scoped: Option<EndpointSection>,
}

impl EndpointsSection {
    pub fn primary_endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            url: self.primary.url.clone(),
            requires_auth: false,
            access_token: None,
        }
    }

    /// The customer endpoint always authenticates; the raw access token is
    /// supplied here or injected later when the shopper grants access.
    pub fn scoped_endpoint(&self) -> Option<EndpointConfig> {
        self.scoped.as_ref().map(|section| EndpointConfig {
            url: section.url.clone(),
            requires_auth: true,
            access_token: section.access_token.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    pub url: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSection {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY.as_millis() as u64
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl RpcSection {
    pub fn call_options(&self) -> RpcCallOptions {
        RpcCallOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RpcCallOptions::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl ChatSection {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            system_prompt: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}
