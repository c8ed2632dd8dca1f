use std::fmt::Write;

use jiff::{Zoned, tz::TimeZone};
use log::{Level, Record};
use logforth::{
    append::Stdout,
    diagnostic::Diagnostic,
    filter::EnvFilter,
    layout::{JsonLayout, Layout},
};

use crate::args::{Args, LogLevel, LogStyle};

/// Workspace crates log at the selected level, dependencies only warn.
const CRATES: [&str; 4] = ["turnstile", "server", "rate_limit", "config"];

/// One line per record: UTC timestamp, padded level, the limiter module if any, then the message.
#[derive(Debug, Clone, Copy)]
struct LineLayout {
    color: bool,
}

impl LineLayout {
    fn level(&self, level: Level) -> String {
        if !self.color {
            return format!("{level:>5}");
        }

        let code = match level {
            Level::Error => 31,
            Level::Warn => 33,
            Level::Info => 32,
            Level::Debug => 34,
            Level::Trace => 35,
        };

        format!("\x1b[{code}m{level:>5}\x1b[0m")
    }
}

impl Layout for LineLayout {
    fn format(&self, record: &Record<'_>, _: &[Box<dyn Diagnostic>]) -> anyhow::Result<Vec<u8>> {
        let now = Zoned::now().with_time_zone(TimeZone::UTC);
        let mut line = format!("{} {}  ", now.strftime("%Y-%m-%dT%H:%M:%S%.6fZ"), self.level(record.level()));

        // Limiter decisions are easier to follow with their module in front.
        if let Some(module) = record.module_path().filter(|path| path.starts_with("rate_limit")) {
            write!(line, "[{module}] ")?;
        }

        write!(line, "{}", record.args())?;

        Ok(line.into_bytes())
    }
}

fn filter(level: LogLevel) -> anyhow::Result<EnvFilter> {
    let directives = match level.directive() {
        None => String::from("off"),
        Some(level) => CRATES.iter().fold(String::from("warn"), |mut acc, krate| {
            acc.push_str(&format!(",{krate}={level}"));
            acc
        }),
    };

    directives
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid log filter '{directives}': {e}"))
}

pub(super) fn init(args: &Args) -> anyhow::Result<()> {
    let filter = filter(args.log_level)?;

    logforth::builder()
        .dispatch(|d| {
            let d = d.filter(filter);

            match args.log_style {
                LogStyle::Color => d.append(Stdout::default().with_layout(LineLayout { color: true })),
                LogStyle::Text => d.append(Stdout::default().with_layout(LineLayout { color: false })),
                LogStyle::Json => d.append(Stdout::default().with_layout(JsonLayout::default())),
            }
        })
        .apply();

    Ok(())
}
