//! Configuration for the syncpulse harness.
//!
//! A JSON document (`--config` path) merged with `SYNCPULSE_*` environment
//! overrides on top of serialized defaults, then validated into the typed
//! [`RunConfig`] the binary hands to the core.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use syncpulse_core::AccessToken;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Mode ────────────────────────────────────────────────────────────

/// Which transport pools the harness runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Duplex,
    Stream,
    Both,
}

impl Mode {
    pub fn duplex_enabled(self) -> bool {
        matches!(self, Self::Duplex | Self::Both)
    }

    pub fn stream_enabled(self) -> bool {
        matches!(self, Self::Stream | Self::Both)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "duplex" => Ok(Self::Duplex),
            "stream" => Ok(Self::Stream),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown mode '{other}' (expected duplex, stream, or both)")),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Duplex => "duplex",
            Self::Stream => "stream",
            Self::Both => "both",
        })
    }
}

// ── Document ────────────────────────────────────────────────────────

/// The raw configuration document.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Store root address, e.g. `wss://store.example.net`.
    #[serde(default)]
    pub store_url: String,

    /// Which transport pools to run.
    #[serde(default)]
    pub mode: Mode,

    /// Seconds between test ticks.
    #[serde(default = "default_test_interval")]
    pub test_interval_secs: u64,

    /// Milliseconds between delivery checks within a tick.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Maximum delivery checks per worker per tick.
    #[serde(default = "default_check_times")]
    pub check_times: u32,

    /// One token per subscriber client.
    #[serde(default)]
    pub user_tokens: Vec<String>,

    /// Privileged token used for the write side.
    #[serde(default)]
    pub master_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: String::new(),
            mode: Mode::default(),
            test_interval_secs: default_test_interval(),
            check_interval_ms: default_check_interval(),
            check_times: default_check_times(),
            user_tokens: Vec::new(),
            master_token: String::new(),
        }
    }
}

fn default_test_interval() -> u64 {
    60
}
fn default_check_interval() -> u64 {
    500
}
fn default_check_times() -> u32 {
    60
}

// ── Resolved configuration ──────────────────────────────────────────

/// Validated configuration the binary hands to the core.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub store_url: Url,
    pub mode: Mode,
    pub test_interval: Duration,
    pub check_interval: Duration,
    pub check_times: u32,
    pub user_tokens: Vec<AccessToken>,
    pub master_token: AccessToken,
}

impl Config {
    /// Validate and convert into a [`RunConfig`].
    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        let store_url: Url = self.store_url.parse().map_err(|e| ConfigError::Validation {
            field: "store_url".into(),
            reason: format!("'{}' is not a valid URL: {e}", self.store_url),
        })?;

        if self.test_interval_secs == 0 {
            return Err(validation("test_interval_secs", "must be greater than zero"));
        }
        if self.check_interval_ms == 0 {
            return Err(validation("check_interval_ms", "must be greater than zero"));
        }
        if self.check_times == 0 {
            return Err(validation("check_times", "must be greater than zero"));
        }
        if self.user_tokens.is_empty() {
            return Err(validation("user_tokens", "at least one tenant token is required"));
        }
        if self.master_token.is_empty() {
            return Err(validation("master_token", "a privileged token is required"));
        }

        Ok(RunConfig {
            store_url,
            mode: self.mode,
            test_interval: Duration::from_secs(self.test_interval_secs),
            check_interval: Duration::from_millis(self.check_interval_ms),
            check_times: self.check_times,
            user_tokens: self.user_tokens.into_iter().map(AccessToken::new).collect(),
            master_token: AccessToken::new(self.master_token),
        })
    }
}

fn validation(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation { field: field.into(), reason: reason.into() }
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load the configuration document from `path`, then apply `SYNCPULSE_*`
/// environment overrides.
///
/// A missing document is a hard error -- the harness cannot run without
/// tokens.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    std::fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed("SYNCPULSE_"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Tests ───────────────────────────────────────────────────────────
