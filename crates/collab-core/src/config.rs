//! Session and service configuration.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be an http(s) or ws(s) URL, got {value:?}")]
    InvalidUrl { var: &'static str, value: String },
}

/// Tunables shared by note sessions, actions and the enhancement client.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabConfig {
    /// Quiescence window before a flush to the durable store. Also the upper
    /// bound on edits lost when a session dies without flushing.
    pub flush_window: Duration,
    /// Minimum interval between presence broadcasts.
    pub presence_throttle: Duration,
    /// Depth cap for descendant walks over the note tree.
    pub max_tree_depth: usize,
    /// Relay endpoint for collaborative mode (None = solo only).
    pub relay_url: Option<String>,
    /// Text enhancement endpoint.
    pub enhance_url: Option<String>,
    /// Base URL used in reminder deep links.
    pub app_url: String,
}

impl CollabConfig {
    pub const DEFAULT_FLUSH_WINDOW: Duration = Duration::from_secs(2);
    pub const DEFAULT_PRESENCE_THROTTLE: Duration = Duration::from_millis(50);
    pub const DEFAULT_MAX_TREE_DEPTH: usize = 32;
    pub const DEFAULT_APP_URL: &'static str = "http://localhost:3000";

    /// Load configuration from environment variables.
    ///
    /// Optional env vars:
    /// - `COLLAB_FLUSH_WINDOW_MS` (default 2000)
    /// - `COLLAB_PRESENCE_THROTTLE_MS` (default 50)
    /// - `COLLAB_MAX_TREE_DEPTH` (default 32)
    /// - `COLLAB_RELAY_URL`
    /// - `COLLAB_ENHANCE_URL`
    /// - `COLLAB_APP_URL` (default http://localhost:3000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let flush_window = match number(&lookup, "COLLAB_FLUSH_WINDOW_MS")? {
            Some(ms) => Duration::from_millis(ms),
            None => defaults.flush_window,
        };
        let presence_throttle = match number(&lookup, "COLLAB_PRESENCE_THROTTLE_MS")? {
            Some(ms) => Duration::from_millis(ms),
            None => defaults.presence_throttle,
        };
        let max_tree_depth = number(&lookup, "COLLAB_MAX_TREE_DEPTH")?
            .map_or(defaults.max_tree_depth, |d| d as usize);

        Ok(Self {
            flush_window,
            presence_throttle,
            max_tree_depth,
            relay_url: url(&lookup, "COLLAB_RELAY_URL")?,
            enhance_url: url(&lookup, "COLLAB_ENHANCE_URL")?,
            app_url: url(&lookup, "COLLAB_APP_URL")?.unwrap_or(defaults.app_url),
        })
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            flush_window: Self::DEFAULT_FLUSH_WINDOW,
            presence_throttle: Self::DEFAULT_PRESENCE_THROTTLE,
            max_tree_depth: Self::DEFAULT_MAX_TREE_DEPTH,
            relay_url: None,
            enhance_url: None,
            app_url: Self::DEFAULT_APP_URL.to_string(),
        }
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

fn url(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<String>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => {
            let value = value.trim().trim_end_matches('/').to_string();
            let valid = ["http://", "https://", "ws://", "wss://"]
                .iter()
                .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len());
            if valid {
                Ok(Some(value))
            } else {
                Err(ConfigError::InvalidUrl { var, value })
            }
        }
    }
}
