//! Process configuration.
//!
//! Everything is read once at startup from environment variables. Missing
//! credentials are reported here, before any run starts.

use std::path::PathBuf;
use std::time::Duration;

/// Default moderation endpoint.
pub const DEFAULT_MODERATION_URL: &str = "https://api.pillar.security/api/v0/sessions";

/// Configuration errors. These are fatal at startup and never surface mid-run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing {name}: set `{env}` in the environment")]
    MissingCredential { name: &'static str, env: &'static str },

    #[error("invalid value for `{env}`: {value}")]
    InvalidValue { env: &'static str, value: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// What to do when the moderation service itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutagePolicy {
    /// Moderation errors abort the run.
    #[default]
    FailClosed,
    /// Moderation errors are logged and the checkpoint is treated as allow.
    FailOpen,
}

/// Settings for the moderation service.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub app_id: Option<String>,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout: Duration,
    /// Provider label reported to the moderation service.
    pub service: String,
    /// Model label reported to the moderation service.
    pub model: String,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            api_key: None,
            endpoint: DEFAULT_MODERATION_URL.to_string(),
            timeout: Duration::from_secs(30),
            service: "openai".to_string(),
            model: "gpt-4o".to_string(),
        }
    }
}

impl ModerationConfig {
    /// Read credentials and endpoint from the environment.
    ///
    /// - `MODERATION_APP_ID` (legacy `PILLAR_APP_ID`)
    /// - `MODERATION_API_KEY` (legacy `PILLAR_API_KEY`)
    /// - `MODERATION_API_URL` (legacy `PILLAR_API_URL`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            app_id: env_with_legacy("MODERATION_APP_ID", "PILLAR_APP_ID"),
            api_key: env_with_legacy("MODERATION_API_KEY", "PILLAR_API_KEY"),
            endpoint: env_with_legacy("MODERATION_API_URL", "PILLAR_API_URL")
                .unwrap_or(defaults.endpoint),
            ..defaults
        }
    }
}

/// Top-level configuration for the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub model: String,
    pub max_hops: usize,
    pub max_turns: usize,
    pub recheck_on_handoff: bool,
    pub outage_policy: OutagePolicy,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub moderation: ModerationConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `workspace_root` is supplied by the caller; everything else comes from
    /// `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `LATIO_MODEL`, `LATIO_MAX_HOPS`,
    /// `LATIO_MAX_TURNS`, `LATIO_RECHECK_ON_HANDOFF`, `MODERATION_FAIL_OPEN`
    /// and the moderation variables.
    pub fn from_env(workspace_root: PathBuf) -> Result<Self, ConfigError> {
        let openai_api_key = non_empty_env("OPENAI_API_KEY").ok_or(ConfigError::MissingCredential {
            name: "backend API key",
            env: "OPENAI_API_KEY",
        })?;

        let model = non_empty_env("LATIO_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let mut moderation = ModerationConfig::from_env();
        moderation.model = model.clone();

        let outage_policy = if parse_bool_env("MODERATION_FAIL_OPEN")? {
            tracing::warn!("MODERATION_FAIL_OPEN is set: moderation outages will not block runs");
            OutagePolicy::FailOpen
        } else {
            OutagePolicy::FailClosed
        };

        Ok(Self {
            workspace_root,
            model,
            max_hops: parse_usize_env("LATIO_MAX_HOPS", 4)?,
            max_turns: parse_usize_env("LATIO_MAX_TURNS", 10)?,
            recheck_on_handoff: parse_bool_env("LATIO_RECHECK_ON_HANDOFF")?,
            outage_policy,
            openai_api_key,
            openai_base_url: non_empty_env("OPENAI_BASE_URL"),
            moderation,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_with_legacy(name: &str, legacy: &str) -> Option<String> {
    non_empty_env(name).or_else(|| non_empty_env(legacy))
}

fn parse_usize_env(env: &'static str, default: usize) -> Result<usize, ConfigError> {
    match non_empty_env(env) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { env, value }),
    }
}

fn parse_bool_env(env: &'static str) -> Result<bool, ConfigError> {
    match non_empty_env(env) {
        None => Ok(false),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { env, value }),
        },
    }
}
