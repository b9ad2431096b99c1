//! TOML configuration with `AUKLET_*` environment overrides.
//!
//! Every section except `[account]` may be omitted. Overrides are applied
//! after parsing and before validation, so an override can fill in a value
//! the file leaves empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file at {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("required settings are empty: {}", .fields.join(", "))]
    MissingRequiredFields { fields: Vec<&'static str> },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("cannot access configuration file: {0}")]
    Io(#[from] std::io::Error),
}

pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Written to [`config_path`] on first run.
const TEMPLATE: &str = r#"# Auklet configuration

[account]
jid = ""
password = ""
# server = "xmpp.example.org"
# port = 5222

[requests]
# seconds before an unanswered request fails with a timeout
timeout_seconds = 30
sweep_interval_ms = 500

[logging]
# RUST_LOG takes precedence when set
level = "info"

[event_bus]
channel_capacity = 1024
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    #[serde(default = "AccountConfig::default_port")]
    pub port: u16,
}

impl AccountConfig {
    fn default_port() -> u16 {
        5222
    }
}

/// Outbound request correlation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline applied to requests that do not carry their own timeout.
    pub timeout_seconds: u64,
    /// How often pending requests are checked against their deadline.
    pub sweep_interval_ms: u64,
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            sweep_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Queue depth for channel-backed subscriptions.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Platform configuration file, e.g. `~/.config/auklet/config.toml`.
pub fn config_path() -> PathBuf {
    directories::ProjectDirs::from("im", "auklet", "auklet")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl Config {
    /// Load [`config_path`], creating a template there if it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&config_path())
    }

    /// Load `path` with process environment overrides.
    ///
    /// A missing file is replaced by the template and reported as missing
    /// account settings.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                write_template(path)?;
                return Err(ConfigError::MissingRequiredFields {
                    fields: vec!["account.jid", "account.password"],
                });
            }
            Err(error) => return Err(error.into()),
        };
        Self::from_toml_with_env(&source, process_env)
    }

    /// Parse `source` with process environment overrides.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Self::from_toml_with_env(source, process_env)
    }

    /// Parse `source`, resolving overrides through `env`.
    pub fn from_toml_with_env(
        source: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(source).map_err(|error| {
            let (line, column) = error
                .span()
                .map_or((0, 0), |span| position(source, span.start));
            ConfigError::Syntax {
                line,
                column,
                message: error.message().to_string(),
            }
        })?;
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(jid) = env("AUKLET_JID") {
            self.account.jid = jid;
        }
        if let Some(password) = env("AUKLET_PASSWORD") {
            self.account.password = password;
        }
        if let Some(server) = env("AUKLET_SERVER") {
            self.account.server = Some(server);
        }
        if let Some(level) = env("AUKLET_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(raw) = env("AUKLET_REQUEST_TIMEOUT") {
            self.requests.timeout_seconds =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        field: "requests.timeout_seconds",
                        reason: format!("AUKLET_REQUEST_TIMEOUT={raw:?} is not a whole number"),
                    })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields: Vec<&'static str> = [
            ("account.jid", &self.account.jid),
            ("account.password", &self.account.password),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(field, _)| field)
        .collect();
        if !fields.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields });
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level",
                reason: format!(
                    "{:?} is not one of {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        positive("requests.timeout_seconds", self.requests.timeout_seconds)?;
        positive("requests.sweep_interval_ms", self.requests.sweep_interval_ms)?;
        Ok(())
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// 1-based line and column of byte `offset` in `source`.
fn position(source: &str, offset: usize) -> (usize, usize) {
    let prefix = source.get(..offset).unwrap_or(source);
    let line_start = prefix.rfind('\n').map_or(0, |newline| newline + 1);
    (
        prefix.matches('\n').count() + 1,
        prefix[line_start..].chars().count() + 1,
    )
}

fn write_template(path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, TEMPLATE)?;
    Ok(())
}

/// Environment lookup backed by a fixed map, for tests and embedders that
/// do not want the process environment consulted.
pub fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}
