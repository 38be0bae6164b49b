//! Log output settings.

use std::path::PathBuf;

/// Env var holding a filter directive, checked after `RUST_LOG`.
pub const LOG_FILTER_ENV: &str = "TUTORLOG_LOG";
/// Env var selecting `pretty` or `json` output.
pub const LOG_FORMAT_ENV: &str = "TUTORLOG_LOG_FORMAT";
/// Env var naming a file to append logs to instead of stderr.
pub const LOG_FILE_ENV: &str = "TUTORLOG_LOG_FILE";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses `pretty` or `json`, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Line format.
    pub format: LogFormat,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` directive.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            file: None,
            filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Reads `RUST_LOG`/`TUTORLOG_LOG`, `TUTORLOG_LOG_FORMAT` and
    /// `TUTORLOG_LOG_FILE`. Without a filter, `verbose` selects `debug`
    /// over `info`.
    #[must_use]
    pub fn from_env(verbose: bool) -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self::resolve(
            verbose,
            read("RUST_LOG").or_else(|| read(LOG_FILTER_ENV)),
            read(LOG_FORMAT_ENV).as_deref(),
            read(LOG_FILE_ENV),
        )
    }

    fn resolve(verbose: bool, filter: Option<String>, format: Option<&str>, file: Option<String>) -> Self {
        let format = format.map_or(LogFormat::Pretty, |raw| {
            LogFormat::parse(raw).unwrap_or_else(|| {
                tracing::warn!(value = raw, "Unknown log format, using pretty");
                LogFormat::Pretty
            })
        });
        Self {
            format,
            file: file.map(PathBuf::from),
            filter: filter.unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_verbosity() {
        assert_eq!(LoggingConfig::resolve(false, None, None, None).filter, "info");
        assert_eq!(LoggingConfig::resolve(true, None, None, None).filter, "debug");
    }

    #[test]
    fn test_explicit_values_win() {
        let config = LoggingConfig::resolve(
            true,
            Some("tutorlog=trace".to_string()),
            Some("JSON"),
            Some("/tmp/tutorlog.log".to_string()),
        );
        assert_eq!(config.filter, "tutorlog=trace");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/tutorlog.log")));
    }

    #[test]
    fn test_unknown_format_falls_back() {
        assert_eq!(LogFormat::parse("xml"), None);
        assert_eq!(
            LoggingConfig::resolve(false, None, Some("xml"), None).format,
            LogFormat::Pretty
        );
    }
}
