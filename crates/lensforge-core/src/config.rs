//! Configuration system for Lensforge.
//!
//! Read once at construction; nothing re-reads it while running.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{format_error_with_suggestion, Error};

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Persistence settings
    pub persistence: PersistenceConfig,
    /// Resource limits
    pub limits: LimitsConfig,
    /// Inactivity cleanup
    pub cleanup: CleanupConfig,
    /// Tool-call middleware
    pub middleware: MiddlewareConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process map, lost on exit
    #[default]
    Memory,
    /// One file per key under `location`
    File,
    /// Remote key-value store (not implemented)
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Storage backend
    pub backend: BackendKind,
    /// Root directory for the file backend
    pub location: PathBuf,
    /// Gzip values before writing
    pub compression: bool,
    /// Auto-save interval (milliseconds), 0 disables
    pub auto_save_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            location: Config::data_dir().join("state"),
            compression: false,
            auto_save_interval_ms: 60_000,
        }
    }
}

impl PersistenceConfig {
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(self.auto_save_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum session age (milliseconds since start)
    pub max_session_age_ms: u64,
    /// Maximum snapshots kept per session
    pub max_snapshots: usize,
    /// Maximum serialized context size (bytes)
    pub max_context_size: usize,
    /// Maximum live sessions
    pub max_sessions: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_session_age_ms: 24 * 60 * 60 * 1000,
            max_snapshots: 50,
            max_context_size: 100 * 1024,
            max_sessions: 100,
        }
    }
}

impl LimitsConfig {
    pub fn max_session_age(&self) -> Duration {
        Duration::from_millis(self.max_session_age_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Idle time after which a session is swept (milliseconds)
    pub inactive_threshold_ms: u64,
    /// How often the sweep runs (milliseconds), 0 disables
    pub run_interval_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            inactive_threshold_ms: 60 * 60 * 1000,
            run_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl CleanupConfig {
    pub fn inactive_threshold(&self) -> Duration {
        Duration::from_millis(self.inactive_threshold_ms)
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Snapshot after state-changing tools
    pub auto_snapshot: bool,
    /// Fraction of `max_context_size` at which to warn
    pub context_warning_ratio: f64,
    /// User id for sessions created without one
    pub anonymous_user_id: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            auto_snapshot: true,
            context_warning_ratio: 0.8,
            anonymous_user_id: "anonymous".to_string(),
        }
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Field path (e.g., "limits.max_sessions")
    pub field: String,
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Base figment: defaults, user config, project config, environment.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".lensforge/config.toml"))
            // LENSFORGE_LIMITS__MAX_SESSIONS=10 -> limits.max_sessions
            .merge(Env::prefixed("LENSFORGE_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            let err = Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            ));
            tracing::error!("{}", format_error_with_suggestion(&err));
            return Err(err);
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.limits.max_sessions == 0 {
            result.add_error("limits.max_sessions", "max_sessions must be greater than 0");
        }

        if self.limits.max_snapshots == 0 {
            result.add_error("limits.max_snapshots", "max_snapshots must be greater than 0");
        }

        if self.limits.max_context_size < 1024 {
            result.add_error(
                "limits.max_context_size",
                "max_context_size must be at least 1024 bytes",
            );
        }

        if self.limits.max_session_age_ms == 0 {
            result.add_error("limits.max_session_age_ms", "max_session_age_ms must be greater than 0");
        }

        if self.cleanup.inactive_threshold_ms == 0 {
            result.add_error(
                "cleanup.inactive_threshold_ms",
                "inactive_threshold_ms must be greater than 0",
            );
        }

        if self.persistence.backend == BackendKind::Redis {
            result.add_warning(
                "persistence.backend",
                "redis backend is not implemented; every storage call will fail",
            );
        }

        if self.persistence.backend == BackendKind::Memory && self.persistence.compression {
            result.add_warning(
                "persistence.compression",
                "compression has little effect with the memory backend",
            );
        }

        let ratio = self.middleware.context_warning_ratio;
        if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
            result.add_error(
                "middleware.context_warning_ratio",
                "context_warning_ratio must be in (0, 1]",
            );
        }

        result
    }

    /// Render as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("lensforge"))
            .unwrap_or_else(|| PathBuf::from("~/.config/lensforge"))
    }

    /// Get the data directory (for persisted state).
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join("lensforge"))
            .unwrap_or_else(|| PathBuf::from("~/.local/share/lensforge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_ok(), "Default config should be valid: {:?}", result.issues);
    }

    #[test]
    fn test_zero_max_sessions_is_error() {
        let mut config = Config::default();
        config.limits.max_sessions = 0;
        let result = config.validate();
        assert!(!result.is_ok());
        assert!(result.errors().iter().any(|e| e.field == "limits.max_sessions"));
    }

    #[test]
    fn test_redis_backend_is_warning() {
        let mut config = Config::default();
        config.persistence.backend = BackendKind::Redis;
        let result = config.validate();
        assert!(result.is_ok());
        assert!(result.warnings().iter().any(|e| e.field == "persistence.backend"));
    }

    #[test]
    fn test_zero_intervals_mean_disabled() {
        let mut config = Config::default();
        config.persistence.auto_save_interval_ms = 0;
        config.cleanup.run_interval_ms = 0;
        let result = config.validate();
        assert!(result.is_ok(), "{:?}", result.issues);
        assert!(config.persistence.auto_save_interval().is_zero());
    }

    #[test]
    fn test_bad_warning_ratio() {
        let mut config = Config::default();
        config.middleware.context_warning_ratio = 1.5;
        assert!(!config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_round_trips_limits() {
        let mut config = Config::default();
        config.limits.max_sessions = 12;
        let text = config.to_toml().unwrap();
        assert!(text.contains("max_sessions = 12"));
    }

    #[test]
    fn test_toml_and_env_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "lensforge.toml",
                r#"
                [persistence]
                backend = "file"
                compression = true

                [limits]
                max_snapshots = 5
                "#,
            )?;
            jail.set_env("LENSFORGE_LIMITS__MAX_SESSIONS", "7");

            let config: Config = Figment::new()
                .merge(figment::providers::Serialized::defaults(Config::default()))
                .merge(Toml::file("lensforge.toml"))
                .merge(Env::prefixed("LENSFORGE_").split("__"))
                .extract()?;

            assert_eq!(config.persistence.backend, BackendKind::File);
            assert!(config.persistence.compression);
            assert_eq!(config.limits.max_snapshots, 5);
            assert_eq!(config.limits.max_sessions, 7);
            assert_eq!(config.cleanup.run_interval_ms, 300_000);
            Ok(())
        });
    }
}
