use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub realtime_url: String,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub advisor_model: String,
    pub workspace_root: PathBuf,
    pub prompts_path: PathBuf,
    pub rollback_window: Duration,
    pub upstream_ready_timeout: Duration,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn seconds_var(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_url = var_or("REALTIME_URL", "wss://api.openai.com/v1/realtime");
        let realtime_model = var_or("REALTIME_MODEL", "gpt-4o-realtime-preview-2024-10-01");
        let realtime_voice = var_or("REALTIME_VOICE", "alloy");
        let advisor_model = var_or("ADVISOR_MODEL", "gpt-4o");
        let workspace_root = PathBuf::from(var_or("WORKSPACE_ROOT", "."));
        let prompts_path = PathBuf::from(var_or("PROMPTS_PATH", "./prompts"));

        let rollback_window = seconds_var("ROLLBACK_WINDOW_SECS", 5)?;
        let upstream_ready_timeout = seconds_var("UPSTREAM_READY_TIMEOUT_SECS", 10)?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_url,
            realtime_model,
            realtime_voice,
            advisor_model,
            workspace_root,
            prompts_path,
            rollback_window,
            upstream_ready_timeout,
            log_level,
        })
    }
}
