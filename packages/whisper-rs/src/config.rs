use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Delay applied to background services that do not set `perform_in`.
pub const DEFAULT_BACKGROUND_DELAY: Duration = Duration::from_secs(5 * 60);

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Delay for background services without an explicit `perform_in`.
    pub default_delay: Duration,
    /// Validate every declared binding when the runtime is built instead of
    /// failing lazily at dispatch.
    pub validate_bindings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_delay: DEFAULT_BACKGROUND_DELAY,
            validate_bindings: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            default_delay: match var("WHISPER_DEFAULT_DELAY_SECS") {
                Some(secs) => Duration::from_secs(
                    secs.trim()
                        .parse::<u64>()
                        .context("WHISPER_DEFAULT_DELAY_SECS must be a whole number of seconds")?,
                ),
                None => defaults.default_delay,
            },
            validate_bindings: match var("WHISPER_VALIDATE_BINDINGS") {
                Some(flag) => parse_flag(&flag)
                    .context("WHISPER_VALIDATE_BINDINGS must be true or false")?,
                None => defaults.validate_bindings,
            },
        })
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognized flag value '{}'", other),
    }
}
