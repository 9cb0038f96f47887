//! Configuration loading and validation for turnloop agents.
//!
//! Loads [`AgentSettings`] from a TOML file with environment variable
//! overrides and validates every limit before an agent is built from it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use turnloop_core::{DeliveryMode, EventChannelConfig, QueueMode, ThinkingLevel};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TURNLOOP_";

/// Agent-level settings.
///
/// Maps directly to an `agent.toml` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// System prompt prepended to every model call
    #[serde(default)]
    pub system_prompt: String,

    /// Turn limit per run (exceeding it ends the run with an error)
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Model-call retries for transient failures (0 = no retry)
    #[serde(default)]
    pub max_retries: u32,

    /// Consecutive failures before a tool is short-circuited (0 = disabled)
    #[serde(default)]
    pub max_tool_errors: u32,

    /// Reasoning depth forwarded to the model
    #[serde(default)]
    pub thinking_level: ThinkingLevel,

    /// Drain mode for the steering queue
    #[serde(default)]
    pub steering_mode: QueueMode,

    /// Drain mode for the follow-up queue
    #[serde(default)]
    pub follow_up_mode: QueueMode,

    /// Event channel configuration
    #[serde(default)]
    pub events: EventSettings,
}

fn default_max_turns() -> u32 {
    10
}

/// How the loop's event channel behaves under back-pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// Drop events when the channel is full
    #[default]
    DropOnFull,
    /// Wait up to `send_timeout_ms` for room
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub delivery: DeliveryKind,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_capacity() -> usize {
    turnloop_core::event::DEFAULT_EVENT_CAPACITY
}
fn default_send_timeout_ms() -> u64 {
    1000
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            delivery: DeliveryKind::default(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl EventSettings {
    /// Convert into the channel parameters the loop uses.
    pub fn channel_config(&self) -> EventChannelConfig {
        let delivery = match self.delivery {
            DeliveryKind::DropOnFull => DeliveryMode::DropOnFull,
            DeliveryKind::Block => DeliveryMode::Block {
                timeout: Duration::from_millis(self.send_timeout_ms),
            },
        };
        EventChannelConfig {
            capacity: self.capacity,
            delivery,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_turns: default_max_turns(),
            max_retries: 0,
            max_tool_errors: 0,
            thinking_level: ThinkingLevel::default(),
            steering_mode: QueueMode::default(),
            follow_up_mode: QueueMode::default(),
            events: EventSettings::default(),
        }
    }
}

impl AgentSettings {
    /// Load settings from a specific file path.
    ///
    /// A missing file is not an error: defaults are returned.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let settings = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        Ok(settings)
    }

    /// Load settings from a file, then apply `TURNLOOP_*` environment overrides.
    ///
    /// - `TURNLOOP_SYSTEM_PROMPT`
    /// - `TURNLOOP_MAX_TURNS`
    /// - `TURNLOOP_MAX_RETRIES`
    /// - `TURNLOOP_MAX_TOOL_ERRORS`
    /// - `TURNLOOP_THINKING_LEVEL`
    pub fn load_from_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Self::load_from(path)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(prompt) = var("SYSTEM_PROMPT") {
            self.system_prompt = prompt;
        }
        if let Some(v) = var("MAX_TURNS") {
            self.max_turns = parse_number("MAX_TURNS", &v)?;
        }
        if let Some(v) = var("MAX_RETRIES") {
            self.max_retries = parse_number("MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("MAX_TOOL_ERRORS") {
            self.max_tool_errors = parse_number("MAX_TOOL_ERRORS", &v)?;
        }
        if let Some(v) = var("THINKING_LEVEL") {
            self.thinking_level = v.parse().map_err(|e: String| {
                ConfigError::ValidationError(format!("{ENV_PREFIX}THINKING_LEVEL: {e}"))
            })?;
        }

        self.validate()
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "max_turns must be at least 1".into(),
            ));
        }

        if self.events.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "events.capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Render the default settings as TOML.
    pub fn default_toml() -> String {
        Self::default().to_toml()
    }

    /// Render these settings as TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

fn parse_number(name: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!(
            "{ENV_PREFIX}{name} must be a non-negative integer, got '{value}'"
        ))
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_settings_are_valid() {
        let settings = AgentSettings::default();
        assert_eq!(settings.max_turns, 10);
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.events.capacity, 128);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_roundtrip_toml() {
        let settings = AgentSettings {
            system_prompt: "Be brief.".into(),
            max_tool_errors: 3,
            steering_mode: QueueMode::OneAtATime,
            ..AgentSettings::default()
        };
        let parsed = AgentSettings::from_toml_str(&settings.to_toml()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
max_retries = 3
thinking_level = "high"
follow_up_mode = "one_at_a_time"

[events]
delivery = "block"
send_timeout_ms = 250
"#;
        let settings = AgentSettings::from_toml_str(toml_str).unwrap();
        assert_eq!(settings.max_turns, 10);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.thinking_level, ThinkingLevel::High);
        assert_eq!(settings.follow_up_mode, QueueMode::OneAtATime);
        assert_eq!(
            settings.events.channel_config().delivery,
            DeliveryMode::Block {
                timeout: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn zero_max_turns_rejected() {
        let err = AgentSettings::from_toml_str("max_turns = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let settings = AgentSettings::load_from(Path::new("/nonexistent/agent.toml")).unwrap();
        assert_eq!(settings, AgentSettings::default());
    }

    #[test]
    fn load_from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_turns = \"many\"").unwrap();
        let err = AgentSettings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_turns = 4\nsystem_prompt = \"You are terse.\"").unwrap();
        let settings = AgentSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.max_turns, 4);
        assert_eq!(settings.system_prompt, "You are terse.");
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TURNLOOP_MAX_TURNS", "25"),
            ("TURNLOOP_MAX_RETRIES", "2"),
            ("TURNLOOP_THINKING_LEVEL", "medium"),
        ]);
        let mut settings = AgentSettings::default();
        settings
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.max_turns, 25);
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.thinking_level, ThinkingLevel::Medium);
    }

    #[test]
    fn bad_env_override_is_validation_error() {
        let mut settings = AgentSettings::default();
        let err = settings
            .apply_overrides(|k| (k == "TURNLOOP_MAX_TOOL_ERRORS").then(|| "-1".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MAX_TOOL_ERRORS"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AgentSettings::default_toml();
        assert!(toml_str.contains("max_turns = 10"));
        assert!(toml_str.contains("drop_on_full"));
    }
}
