//! Logging setup for trafmask endpoints
//!
//! Console output with a configurable ANSI colour theme and an optional
//! daily-rolling log file. Stats lines use the `trafmask::stats` target and
//! get their own colour so they stand out from event records.

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use tokio::fs;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "logs/trafmask.log";
const STATS_TARGET: &str = "trafmask::stats";
const RESET: &str = "\x1b[0m";

/// ANSI escape sequences used by the console formatter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTheme {
    pub trace: String,
    pub debug: String,
    pub info: String,
    pub warn: String,
    pub error: String,
    /// Whole-line colour for `[STATS]` records
    #[serde(default = "default_stats_color")]
    pub stats: String,
}

fn default_stats_color() -> String {
    "\x1b[1;34m".to_string() // Bold blue
}

impl Default for LogTheme {
    fn default() -> Self {
        let [trace, debug, info, warn, error] =
            ["\x1b[37m", "\x1b[36m", "\x1b[32m", "\x1b[33m", "\x1b[31m"].map(String::from);
        Self {
            trace,
            debug,
            info,
            warn,
            error,
            stats: default_stats_color(),
        }
    }
}

impl LogTheme {
    fn level_color(&self, level: &Level) -> &str {
        match *level {
            Level::TRACE => &self.trace,
            Level::DEBUG => &self.debug,
            Level::INFO => &self.info,
            Level::WARN => &self.warn,
            Level::ERROR => &self.error,
        }
    }
}

/// Install the global subscriber
///
/// `log_level` accepts TRACE, DEBUG, INFO, WARN or ERROR in any case. A
/// missing theme file falls back to [`LogTheme::default`]. With
/// `log_to_file` set, uncoloured lines are also written to a daily-rolling
/// file at `log_file_path` (`logs/trafmask.log` when unset). `RUST_LOG`
/// directives are honoured on top of the configured level.
pub async fn init_logging(
    log_level: &str,
    theme_path: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let level = parse_log_level(log_level)?;
    let theme = load_theme(theme_path).await?;

    let crate_directive = format!("trafmask={}", level.as_str().to_lowercase());
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(crate_directive.parse()?);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(LogFormatter {
            theme: Some(theme),
        });

    let file_layer = log_to_file.then(|| {
        let (dir, file_name) = split_log_path(log_file_path.unwrap_or(DEFAULT_LOG_FILE));
        fmt::layer()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, file_name))
            .with_ansi(false)
            .event_format(LogFormatter { theme: None })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// One line per event: timestamp, level, short target, fields.
/// Without a theme the output carries no escape sequences.
struct LogFormatter {
    theme: Option<LogTheme>,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();
        let target = short_target(metadata.target());
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC");

        match &self.theme {
            Some(theme) if metadata.target() == STATS_TARGET => {
                write!(writer, "{}[{}] {:<5} {}: ", theme.stats, timestamp, level, target)?;
                ctx.field_format().format_fields(writer.by_ref(), event)?;
                write!(writer, "{}", RESET)?;
            }
            Some(theme) => {
                write!(
                    writer,
                    "[{}] {}{:<5}{} {}: ",
                    timestamp,
                    theme.level_color(level),
                    level,
                    RESET,
                    target
                )?;
                ctx.field_format().format_fields(writer.by_ref(), event)?;
            }
            None => {
                write!(writer, "[{}] {:<5} {}: ", timestamp, level, target)?;
                ctx.field_format().format_fields(writer.by_ref(), event)?;
            }
        }

        writeln!(writer)
    }
}

/// Drops the crate prefix: `trafmask::server` prints as `server`
fn short_target(target: &str) -> &str {
    match target.strip_prefix("trafmask::") {
        Some(rest) if !rest.is_empty() => rest,
        _ => target,
    }
}

/// Directory and file name of a log path, defaulting the directory to `.`
fn split_log_path(path: &str) -> (&Path, &OsStr) {
    let path = Path::new(path);
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("trafmask.log"));
    (dir, file_name)
}

async fn load_theme(path: impl AsRef<Path>) -> anyhow::Result<LogTheme> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "Log theme unavailable, using defaults");
            return Ok(LogTheme::default());
        }
    };
    serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Invalid log theme {}: {}", path.display(), e))
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {}", level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_log_level(" Info ").unwrap(), Level::INFO);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path("logs/trafmask.log");
        assert_eq!(dir, Path::new("logs"));
        assert_eq!(name, "trafmask.log");

        let (dir, name) = split_log_path("server.log");
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "server.log");
    }

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("trafmask::server"), "server");
        assert_eq!(short_target("trafmask::obfuscation::rate"), "obfuscation::rate");
        assert_eq!(short_target("trafmask"), "trafmask");
        assert_eq!(short_target("tokio::net"), "tokio::net");
    }

    #[tokio::test]
    async fn test_missing_theme_falls_back() {
        let theme = load_theme("/nonexistent/trafmask-theme.yml").await.unwrap();
        assert_eq!(theme, LogTheme::default());
    }

    #[test]
    fn test_stats_color_is_optional() {
        let yaml = "trace: a\ndebug: b\ninfo: c\nwarn: d\nerror: e\n";
        let theme: LogTheme = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(theme.info, "c");
        assert_eq!(theme.stats, default_stats_color());
    }

    #[test]
    fn test_partial_theme_is_rejected() {
        assert!(serde_yaml::from_str::<LogTheme>("info: c\n").is_err());
    }
}
