//! Startup configuration read from the environment

use crate::adapter::SystemMessagePolicy;
use crate::checkpoint::EvictionPolicy;
use crate::graph::DEFAULT_MAX_STEPS;
use crate::llm::OpenAIConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "llama-3.3-70b-specdec";
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

const LLM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: OpenAIConfig,
    pub port: u16,
    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub contracts_dir: String,
    pub max_graph_steps: usize,
    /// How the voice adapter treats system messages in its chat context
    pub system_messages: SystemMessagePolicy,
}

impl AppConfig {
    /// Fails when `GROQ_API_KEY` is unset or empty
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("GROQ_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("GROQ_API_KEY"))?;

        Ok(Self {
            llm: OpenAIConfig {
                api_key,
                model: lookup("MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                base_url: lookup("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                timeout: LLM_TIMEOUT,
            },
            port: parse_or(&lookup, "INKIT_PORT", 8000)?,
            session_ttl: Duration::from_secs(parse_or(&lookup, "INKIT_SESSION_TTL_SECS", 3600)?),
            max_sessions: parse_or(&lookup, "INKIT_MAX_SESSIONS", 1000)?,
            contracts_dir: lookup("INKIT_CONTRACTS_DIR").unwrap_or_else(|| "contracts".to_string()),
            max_graph_steps: parse_or(&lookup, "INKIT_MAX_GRAPH_STEPS", DEFAULT_MAX_STEPS)?,
            system_messages: parse_or(
                &lookup,
                "INKIT_SYSTEM_MESSAGES",
                SystemMessagePolicy::Forward,
            )?,
        })
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            idle_ttl: self.session_ttl,
            max_threads: self.max_sessions,
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
