use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use notifo_connection::{ConnectionOptions, DEFAULT_POLLING_INTERVAL};
use notifo_model::{ConnectionMode, CreateUser, ParseModeError, RegisterRequest};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://app.notifo.io";

pub const ENV_API_URL: &str = "NOTIFO_API_URL";
pub const ENV_API_KEY: &str = "NOTIFO_API_KEY";
pub const ENV_USER_TOKEN: &str = "NOTIFO_USER_TOKEN";
pub const ENV_CONNECTION_MODE: &str = "NOTIFO_CONNECTION_MODE";
pub const ENV_POLLING_INTERVAL_MS: &str = "NOTIFO_POLLING_INTERVAL_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("api url is not configured")]
    MissingApiUrl,
    #[error("invalid api url {url:?}: {reason}")]
    InvalidApiUrl { url: String, reason: String },
    #[error("either an api key or a user token must be configured")]
    MissingCredentials,
    #[error(transparent)]
    InvalidMode(#[from] ParseModeError),
    #[error("invalid polling interval {0:?}: expected a positive number of milliseconds")]
    InvalidPollingInterval(String),
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// How the widget authenticates against the delivery endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Token of an existing user; used as-is.
    UserToken(String),
    /// App-level key; the user is registered first and its token is used.
    ApiKey(String),
}

/// `[user]` table of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserSection {
    pub display_name: Option<String>,
    pub email_address: Option<String>,
    pub preferred_language: Option<String>,
    pub preferred_timezone: Option<String>,
    pub topics: Vec<String>,
}

/// Contents of `widget.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub user_token: Option<String>,
    pub connection_mode: Option<String>,
    pub polling_interval_ms: Option<u64>,
    pub user: UserSection,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

/// Values that win over the config file: environment and command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub user_token: Option<String>,
    pub connection_mode: Option<String>,
    pub polling_interval_ms: Option<u64>,
    pub user: UserSection,
}

impl ConfigOverrides {
    /// Reads the `NOTIFO_*` variables. The CLI gets the same through clap's
    /// `env` attributes.
    pub fn from_env() -> Result<Self, ConfigError> {
        let polling_interval_ms = match env_value(ENV_POLLING_INTERVAL_MS) {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidPollingInterval(raw))?,
            ),
            None => None,
        };
        Ok(Self {
            api_url: env_value(ENV_API_URL),
            api_key: env_value(ENV_API_KEY),
            user_token: env_value(ENV_USER_TOKEN),
            connection_mode: env_value(ENV_CONNECTION_MODE),
            polling_interval_ms,
            user: UserSection::default(),
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetConfig {
    pub api_url: Url,
    pub credentials: Credentials,
    pub mode: ConnectionMode,
    pub polling_interval: Duration,
    pub user: CreateUser,
    pub topics: Vec<String>,
}

impl WidgetConfig {
    /// `<config_dir>/notifo/widget.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        BaseDirs::new().map(|base| base.config_dir().join("notifo").join("widget.toml"))
    }

    /// Reads the config file and applies `overrides` on top. An explicit
    /// `path` must exist; the default location is skipped when absent.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => FileConfig::read(path)?,
            None => match Self::default_path().filter(|path| path.exists()) {
                Some(path) => FileConfig::read(&path)?,
                None => FileConfig::default(),
            },
        };
        Self::resolve(file, overrides)
    }

    pub fn resolve(file: FileConfig, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let raw_url = overrides
            .api_url
            .or(file.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let raw_url = raw_url.trim();
        if raw_url.is_empty() {
            return Err(ConfigError::MissingApiUrl);
        }
        let api_url = Url::parse(raw_url).map_err(|err| ConfigError::InvalidApiUrl {
            url: raw_url.to_string(),
            reason: err.to_string(),
        })?;

        let credentials = match (
            non_empty(overrides.user_token.or(file.user_token)),
            non_empty(overrides.api_key.or(file.api_key)),
        ) {
            (Some(token), _) => Credentials::UserToken(token),
            (None, Some(key)) => Credentials::ApiKey(key),
            (None, None) => return Err(ConfigError::MissingCredentials),
        };

        let mode = match overrides.connection_mode.or(file.connection_mode) {
            Some(raw) => raw.parse()?,
            None => ConnectionMode::default(),
        };

        let polling_interval = match overrides.polling_interval_ms.or(file.polling_interval_ms) {
            Some(0) => return Err(ConfigError::InvalidPollingInterval("0".into())),
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_POLLING_INTERVAL,
        };

        let user_overrides = overrides.user;
        let user_file = file.user;
        let user = CreateUser {
            display_name: non_empty(user_overrides.display_name.or(user_file.display_name)),
            email_address: non_empty(user_overrides.email_address.or(user_file.email_address)),
            preferred_language: non_empty(
                user_overrides
                    .preferred_language
                    .or(user_file.preferred_language),
            ),
            preferred_timezone: non_empty(
                user_overrides
                    .preferred_timezone
                    .or(user_file.preferred_timezone),
            ),
        };
        let topics = if user_overrides.topics.is_empty() {
            user_file.topics
        } else {
            user_overrides.topics
        };

        Ok(Self {
            api_url,
            credentials,
            mode,
            polling_interval,
            user,
            topics,
        })
    }

    pub fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            create_user: self.user.clone(),
            topics_to_subscribe: self.topics.clone(),
        }
    }

    /// Connection settings for the given user token.
    pub fn connection_options(&self, user_token: &str) -> ConnectionOptions {
        ConnectionOptions::new(self.api_url.clone(), user_token)
            .with_mode(self.mode)
            .with_polling_interval(self.polling_interval)
    }
}
