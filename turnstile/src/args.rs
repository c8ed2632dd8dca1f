use std::{io::IsTerminal, net::SocketAddr, path::PathBuf};

use clap::{Parser, ValueEnum};
use config::Config;

#[derive(Debug, Parser)]
#[command(name = "Turnstile", version, long_about = concat!("Turnstile v", env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// IP address on which the server will listen for incoming connections.
    /// Default: 127.0.0.1:8000
    #[arg(short, long, env = "TURNSTILE_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
    /// Path to the TOML configuration file
    #[arg(long, short, env = "TURNSTILE_CONFIG_PATH", default_value = "./turnstile.toml")]
    pub config: PathBuf,
    /// Set the logging level for the server and the rate limiter.
    #[arg(long = "log", env = "TURNSTILE_LOG", value_enum, default_value_t)]
    pub log_level: LogLevel,
    /// Set the style of log output
    #[arg(long, env = "TURNSTILE_LOG_STYLE", value_enum, default_value_t)]
    pub log_style: LogStyle,
}

impl Args {
    /// Loads and validates the configuration file, falling back to defaults if it does not exist.
    pub fn config(&self) -> anyhow::Result<Config> {
        let config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };

        Ok(config)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, used as the default with TTY output
    Color,
    /// Standard text, used as the default with non-TTY output
    Text,
    /// JSON objects
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stdout().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging
    Off,
    /// Only log errors
    Error,
    /// Log errors, and warnings
    Warn,
    /// Log errors, warnings, and info messages
    #[default]
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log errors, warnings, info, debug, and trace messages
    Trace,
}

impl LogLevel {
    /// The filter directive for this level, or `None` when logging is off.
    pub fn directive(self) -> Option<&'static str> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some("error"),
            LogLevel::Warn => Some("warn"),
            LogLevel::Info => Some("info"),
            LogLevel::Debug => Some("debug"),
            LogLevel::Trace => Some("trace"),
        }
    }
}
