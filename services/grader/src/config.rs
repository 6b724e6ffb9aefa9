//! services/grader/src/config.rs
//!
//! Defines the service configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use crate::pipeline::{
    admission::AdmissionSettings, lifecycle::LifecycleSettings, notifications::HubSettings,
    presence::PresenceSettings, sandbox::SandboxSettings, PipelineSettings,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub submissions_dir: PathBuf,
    // --- Sandbox ---
    pub sandbox_memory_bytes: i64,
    pub sandbox_hard_time_limit: Duration,
    pub sandbox_log_lines: usize,
    pub sandbox_network_disabled: bool,
    // --- Admission queue ---
    pub queue_cpu_threshold: f64,
    pub queue_max_concurrent: usize,
    pub queue_cooldown: Duration,
    pub queue_max_retries: u32,
    pub queue_shutdown_grace: Duration,
    // --- Notifications & presence ---
    pub heartbeat_timeout: Duration,
    pub channel_sweep_interval: Duration,
    pub presence_cache_ttl: Duration,
    // --- Interactive exercises ---
    pub reset_drain_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address: SocketAddr = var_or("BIND_ADDRESS", "0.0.0.0:3000".parse().ok())?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let submissions_dir = std::env::var("SUBMISSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./submissions"));

        // --- Load Pipeline Settings ---
        let config = Self {
            bind_address,
            database_url,
            log_level,
            submissions_dir,
            sandbox_memory_bytes: memory_bytes(var_or("SANDBOX_MEMORY_MB", Some(512))?)?,
            sandbox_hard_time_limit: secs_or("SANDBOX_HARD_TIME_LIMIT_SECS", 180)?,
            sandbox_log_lines: var_or("SANDBOX_LOG_LINES", Some(50))?,
            sandbox_network_disabled: var_or("SANDBOX_NETWORK_DISABLED", Some(true))?,
            queue_cpu_threshold: var_or("QUEUE_CPU_THRESHOLD", Some(0.8))?,
            queue_max_concurrent: var_or("QUEUE_MAX_CONCURRENT", Some(4))?,
            queue_cooldown: Duration::from_millis(var_or("QUEUE_COOLDOWN_MS", Some(500))?),
            queue_max_retries: var_or("QUEUE_MAX_RETRIES", Some(2))?,
            queue_shutdown_grace: secs_or("QUEUE_SHUTDOWN_GRACE_SECS", 30)?,
            heartbeat_timeout: secs_or("HEARTBEAT_TIMEOUT_SECS", 30)?,
            channel_sweep_interval: secs_or("CHANNEL_SWEEP_SECS", 10)?,
            presence_cache_ttl: secs_or("PRESENCE_CACHE_SECS", 60)?,
            reset_drain_timeout: secs_or("RESET_DRAIN_TIMEOUT_SECS", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "QUEUE_MAX_CONCURRENT".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.queue_cpu_threshold) {
            return Err(ConfigError::InvalidValue(
                "QUEUE_CPU_THRESHOLD".to_string(),
                "must be a fraction between 0 and 1".to_string(),
            ));
        }
        if self.channel_sweep_interval >= self.heartbeat_timeout {
            return Err(ConfigError::InvalidValue(
                "CHANNEL_SWEEP_SECS".to_string(),
                "must be shorter than HEARTBEAT_TIMEOUT_SECS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            submissions_dir: self.submissions_dir.clone(),
            sandbox: self.sandbox_settings(),
            admission: self.admission_settings(),
            hub: self.hub_settings(),
            presence: self.presence_settings(),
            lifecycle: LifecycleSettings {
                reset_drain_timeout: self.reset_drain_timeout,
                ..LifecycleSettings::default()
            },
        }
    }

    fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            memory_limit_bytes: self.sandbox_memory_bytes,
            hard_time_limit: self.sandbox_hard_time_limit,
            log_line_limit: self.sandbox_log_lines,
            network_disabled: self.sandbox_network_disabled,
        }
    }

    fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            cpu_threshold: self.queue_cpu_threshold,
            max_concurrent: self.queue_max_concurrent,
            cooldown: self.queue_cooldown,
            max_retries: self.queue_max_retries,
            shutdown_grace: self.queue_shutdown_grace,
            ..AdmissionSettings::default()
        }
    }

    fn hub_settings(&self) -> HubSettings {
        HubSettings {
            heartbeat_timeout: self.heartbeat_timeout,
            sweep_interval: self.channel_sweep_interval,
            ..HubSettings::default()
        }
    }

    fn presence_settings(&self) -> PresenceSettings {
        PresenceSettings {
            cache_ttl: self.presence_cache_ttl,
            ..PresenceSettings::default()
        }
    }
}

/// Reads and parses `name`, falling back to `default` when unset.
/// A `None` default makes the variable required.
fn var_or<T>(name: &str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => default.ok_or_else(|| ConfigError::MissingVar(name.to_string())),
    }
}

fn secs_or(name: &str, default: u64) -> Result<Duration, ConfigError> {
    var_or(name, Some(default)).map(Duration::from_secs)
}

/// Converts the `SANDBOX_MEMORY_MB` value into the byte count handed to the container engine.
fn memory_bytes(megabytes: i64) -> Result<i64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue("SANDBOX_MEMORY_MB".to_string(), reason.to_string());
    if megabytes <= 0 {
        return Err(invalid("must be at least 1"));
    }
    megabytes
        .checked_mul(1024 * 1024)
        .ok_or_else(|| invalid("too large to express in bytes"))
}
