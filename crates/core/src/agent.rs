//! Agent-level enums shared by configuration and the loop.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How deeply the model should reason before answering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl FromStr for ThinkingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "minimal" => Ok(Self::Minimal),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown thinking level '{other}'")),
        }
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// How a queued-message buffer is drained when the loop pulls from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Deliver every queued message at once
    #[default]
    All,
    /// Deliver only the oldest message per pull
    OneAtATime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_defaults_to_all() {
        assert_eq!(QueueMode::default(), QueueMode::All);
    }

    #[test]
    fn thinking_level_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<ThinkingLevel>().unwrap(), ThinkingLevel::High);
        assert_eq!(" off ".parse::<ThinkingLevel>().unwrap(), ThinkingLevel::Off);
        assert!("extreme".parse::<ThinkingLevel>().is_err());
    }

    #[test]
    fn queue_mode_toml_names() {
        let json = serde_json::to_string(&QueueMode::OneAtATime).unwrap();
        assert_eq!(json, r#""one_at_a_time""#);
    }
}
