//! Configuration layer: typed engine settings with layered precedence
//! (defaults → file → environment).

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "tessera";
const ENV_PREFIX: &str = "TESSERA";

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CACHE_CEILING_BYTES: usize = 512 * 1024;
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOCK_DELAY_MS: u64 = 50;
pub const DEFAULT_LOCK_STALE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid log level `{0}`")]
    LogLevel(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Compact,
}

/// Logging settings consumed by [`crate::infra::telemetry::init`].
#[derive(Debug, Clone, Copy)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

/// Advisory-lock retry tuning; engine-wide fallbacks for types that do not
/// override them.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LockTuning {
    pub attempts: u32,
    pub delay_ms: u64,
    pub stale_after_secs: i64,
}

impl Default for LockTuning {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_LOCK_ATTEMPTS,
            delay_ms: DEFAULT_LOCK_DELAY_MS,
            stale_after_secs: DEFAULT_LOCK_STALE_SECS,
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Default cache TTL for types that declare none.
    pub cache_ttl_secs: u64,
    /// Serialized results larger than this are served but never cached.
    pub cache_ceiling_bytes: usize,
    pub lock: LockTuning,
    /// Compute everything, skip mutating executor and cache calls.
    pub dry_run: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_ceiling_bytes: DEFAULT_CACHE_CEILING_BYTES,
            lock: LockTuning::default(),
            dry_run: false,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl EngineSettings {
    /// Load settings from `tessera.{toml,yaml,json}` (optional) with
    /// `TESSERA_*` environment overrides layered on top.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(DEFAULT_CONFIG_BASENAME)
    }

    pub fn load_from(basename: &str) -> Result<Self, SettingsError> {
        let settings = Config::builder()
            .add_source(File::with_name(basename).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<EngineSettings>()?;
        Ok(settings)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn logging(&self) -> Result<LoggingSettings, SettingsError> {
        let level = self
            .log_level
            .parse::<LevelFilter>()
            .map_err(|_| SettingsError::LogLevel(self.log_level.clone()))?;
        Ok(LoggingSettings {
            level,
            format: self.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = EngineSettings::default();
        assert_eq!(settings.cache_ttl_secs, DEFAULT_CACHE_TTL_SECS);
        assert_eq!(settings.lock.attempts, DEFAULT_LOCK_ATTEMPTS);
        assert!(!settings.dry_run);
    }

    #[test]
    fn logging_parses_declared_level() {
        let mut settings = EngineSettings::default();
        settings.log_level = "debug".to_string();
        let logging = settings.logging().unwrap();
        assert_eq!(logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn invalid_level_is_reported() {
        let mut settings = EngineSettings::default();
        settings.log_level = "shout".to_string();
        assert!(matches!(
            settings.logging(),
            Err(SettingsError::LogLevel(_))
        ));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = EngineSettings::load_from("definitely-absent-config").unwrap();
        assert_eq!(settings.cache_ceiling_bytes, DEFAULT_CACHE_CEILING_BYTES);
    }
}
