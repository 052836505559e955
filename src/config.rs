//! Middleware configuration.

use serde::Deserialize;
use std::str::FromStr;

/// How `application/x-www-form-urlencoded` request bodies are captured.
///
/// Some hosts parse form bodies eagerly and leave the raw stream drained, so reading it
/// again yields nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormRequestMode {
    /// Read the raw stream like any other body
    #[default]
    #[serde(alias = "body")]
    On,
    /// Rebuild the body from already parsed [`FormParameters`](crate::FormParameters)
    Parameter,
    /// Log form bodies as empty and never touch the stream
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown form request mode: {0}")]
    UnknownFormRequestMode(String),
    #[error("invalid boolean for {name}: {value}")]
    InvalidBool { name: &'static str, value: String },
}

impl FromStr for FormRequestMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "body" => Ok(FormRequestMode::On),
            "parameter" => Ok(FormRequestMode::Parameter),
            "off" => Ok(FormRequestMode::Off),
            _ => Err(ConfigError::UnknownFormRequestMode(s.to_string())),
        }
    }
}

pub const CAPTURE_REQUEST_BODY_VAR: &str = "LOGBOOK_CAPTURE_REQUEST_BODY";
pub const CAPTURE_RESPONSE_BODY_VAR: &str = "LOGBOOK_CAPTURE_RESPONSE_BODY";
pub const FORM_REQUEST_VAR: &str = "LOGBOOK_FORM_REQUEST";

/// Configuration for the logging middleware.
///
/// Controls which bodies are captured. Read once when the layer is built and shared by
/// every exchange after that.
///
/// # Examples
///
/// ```rust
/// use logbook::{FormRequestMode, LogbookConfig};
///
/// // Default configuration
/// let config = LogbookConfig::default();
///
/// // Custom configuration
/// let config = LogbookConfig {
///     capture_request_body: true,
///     capture_response_body: false,
///     form_request_mode: FormRequestMode::Parameter,
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogbookConfig {
    /// Whether to capture request bodies
    pub capture_request_body: bool,
    /// Whether to capture response bodies
    pub capture_response_body: bool,
    /// How to capture form-encoded request bodies
    pub form_request_mode: FormRequestMode,
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            capture_request_body: true,
            capture_response_body: true,
            form_request_mode: FormRequestMode::default(),
        }
    }
}

impl LogbookConfig {
    /// Defaults overridden by `LOGBOOK_CAPTURE_REQUEST_BODY`,
    /// `LOGBOOK_CAPTURE_RESPONSE_BODY` and `LOGBOOK_FORM_REQUEST`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(CAPTURE_REQUEST_BODY_VAR) {
            config.capture_request_body = parse_bool(CAPTURE_REQUEST_BODY_VAR, &value)?;
        }
        if let Some(value) = lookup(CAPTURE_RESPONSE_BODY_VAR) {
            config.capture_response_body = parse_bool(CAPTURE_RESPONSE_BODY_VAR, &value)?;
        }
        if let Some(value) = lookup(FORM_REQUEST_VAR) {
            config.form_request_mode = value.parse()?;
        }
        Ok(config)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}
