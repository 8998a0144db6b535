use crate::capture::{DEFAULT_VOLUME_CEILING, DEFAULT_VOLUME_SCALE, VolumeMeter};
use gemini_live::protocol::{DEFAULT_LIVE_URL, DEFAULT_MODEL};
use octn_core::tools::DEFAULT_RECRUITER_EMAIL;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

const DEFAULT_SETUP_TIMEOUT_SECS: u64 = 10;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub gemini_api_key: String,
    pub live_url: String,
    pub model: String,
    pub log_level: Level,
    /// Optional directory of `<agent>.md` instruction overrides.
    pub prompts_path: Option<PathBuf>,
    pub recruiter_email: String,
    pub volume_scale: f32,
    pub volume_ceiling: f32,
    pub setup_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_url =
            std::env::var("GEMINI_LIVE_URL").unwrap_or_else(|_| DEFAULT_LIVE_URL.to_string());
        if !live_url.starts_with("ws://") && !live_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "GEMINI_LIVE_URL".to_string(),
                format!("'{}' is not a WebSocket URL", live_url),
            ));
        }

        let model =
            std::env::var("GEMINI_LIVE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH").ok().map(PathBuf::from);

        let recruiter_email = std::env::var("RECRUITER_EMAIL")
            .unwrap_or_else(|_| DEFAULT_RECRUITER_EMAIL.to_string());
        if !recruiter_email.contains('@') {
            return Err(ConfigError::InvalidValue(
                "RECRUITER_EMAIL".to_string(),
                format!("'{}' is not an e-mail address", recruiter_email),
            ));
        }

        let volume_scale = parse_positive("VOLUME_SCALE", DEFAULT_VOLUME_SCALE)?;
        let volume_ceiling = parse_positive("VOLUME_CEILING", DEFAULT_VOLUME_CEILING)?;

        let setup_timeout_secs = match std::env::var("SETUP_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "SETUP_TIMEOUT_SECS".to_string(),
                    format!("'{}' is not a positive number of seconds", raw),
                )
            })?,
            Err(_) => DEFAULT_SETUP_TIMEOUT_SECS,
        };

        Ok(Self {
            gemini_api_key,
            live_url,
            model,
            log_level,
            prompts_path,
            recruiter_email,
            volume_scale,
            volume_ceiling,
            setup_timeout: Duration::from_secs(setup_timeout_secs),
        })
    }

    pub fn volume_meter(&self) -> VolumeMeter {
        VolumeMeter {
            scale: self.volume_scale,
            ceiling: self.volume_ceiling,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("gemini_api_key", &"<redacted>")
            .field("live_url", &self.live_url)
            .field("model", &self.model)
            .field("log_level", &self.log_level)
            .field("prompts_path", &self.prompts_path)
            .field("recruiter_email", &self.recruiter_email)
            .field("volume_scale", &self.volume_scale)
            .field("volume_ceiling", &self.volume_ceiling)
            .field("setup_timeout", &self.setup_timeout)
            .finish()
    }
}

fn parse_positive(var: &str, default: f32) -> Result<f32, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    var.to_string(),
                    format!("'{}' is not a positive number", raw),
                )
            }),
        Err(_) => Ok(default),
    }
}
