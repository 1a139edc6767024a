use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{
    ConfigOverrides, UserSection, ENV_API_KEY, ENV_API_URL, ENV_CONNECTION_MODE,
    ENV_POLLING_INTERVAL_MS, ENV_USER_TOKEN,
};
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "notifo-widget",
    about = "Watch and acknowledge Notifo notifications from the terminal",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "NOTIFO_CONFIG",
        value_name = "PATH",
        help = "Config file (defaults to <config_dir>/notifo/widget.toml when present)"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub user: UserArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[arg(
        long = "no-cache",
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Do not read or write the registration cache"
    )]
    pub no_cache: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "NOTIFO_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "NOTIFO_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    #[arg(long, global = true, env = ENV_API_URL, value_name = "URL", help = "Notifo API base url")]
    pub api_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = ENV_API_KEY,
        value_name = "KEY",
        hide_env_values = true,
        help = "App API key; the user is registered before connecting"
    )]
    pub api_key: Option<String>,

    #[arg(
        long,
        global = true,
        env = ENV_USER_TOKEN,
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Token of an existing user"
    )]
    pub user_token: Option<String>,

    #[arg(
        long = "mode",
        global = true,
        env = ENV_CONNECTION_MODE,
        value_name = "MODE",
        help = "SignalR, SignalRSockets or Polling"
    )]
    pub connection_mode: Option<String>,

    #[arg(
        long = "polling-interval",
        global = true,
        env = ENV_POLLING_INTERVAL_MS,
        value_name = "MS",
        help = "Delay between polls in Polling mode"
    )]
    pub polling_interval_ms: Option<u64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct UserArgs {
    #[arg(long, global = true, value_name = "NAME", help = "Display name used when registering")]
    pub display_name: Option<String>,

    #[arg(long, global = true, value_name = "EMAIL", help = "Email address used when registering")]
    pub email: Option<String>,

    #[arg(long, global = true, value_name = "LANG", help = "Preferred language, e.g. en")]
    pub language: Option<String>,

    #[arg(long, global = true, value_name = "TZ", help = "Preferred timezone, e.g. Europe/Berlin")]
    pub timezone: Option<String>,

    #[arg(
        long = "topic",
        global = true,
        value_name = "TOPIC",
        help = "Topic to subscribe the registered user to (repeatable)"
    )]
    pub topics: Vec<String>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        let connection = self.connection.clone();
        let user = self.user.clone();
        ConfigOverrides {
            api_url: connection.api_url,
            api_key: connection.api_key,
            user_token: connection.user_token,
            connection_mode: connection.connection_mode,
            polling_interval_ms: connection.polling_interval_ms,
            user: UserSection {
                display_name: user.display_name,
                email_address: user.email,
                preferred_language: user.language,
                preferred_timezone: user.timezone,
                topics: user.topics,
            },
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream live notifications until interrupted
    Watch(WatchArgs),
    /// Register the configured user (or reuse the cached registration) and print its id
    Register,
}

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    #[arg(
        long = "auto-see",
        action = clap::ArgAction::SetTrue,
        help = "Mark every delivered notification as seen"
    )]
    pub auto_see: bool,
}
