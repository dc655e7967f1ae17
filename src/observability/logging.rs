//! Structured logging configuration.

use tracing_subscriber::EnvFilter;

/// Default filter directive when no environment variable is set.
pub const DEFAULT_FILTER: &str = "info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name; anything but `json` is pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Event filter.
    pub filter: EnvFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: EnvFilter::new(DEFAULT_FILTER),
        }
    }
}

impl LoggingConfig {
    /// Builds logging configuration from the environment.
    ///
    /// The filter comes from `POLYSTORE_LOG`, then `RUST_LOG`, then
    /// [`DEFAULT_FILTER`]; the format from `POLYSTORE_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds logging configuration from an arbitrary variable lookup.
    ///
    /// Logging is not up yet, so a bad filter is reported on stderr.
    #[must_use]
    #[allow(clippy::print_stderr)]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let directives = lookup("POLYSTORE_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
            eprintln!("polystore: invalid log filter '{directives}': {e}; using '{DEFAULT_FILTER}'");
            EnvFilter::new(DEFAULT_FILTER)
        });
        let format = lookup("POLYSTORE_LOG_FORMAT")
            .map(|f| LogFormat::parse(&f))
            .unwrap_or_default();
        Self { format, filter }
    }

    /// Sets the output format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("whatever"), LogFormat::Pretty);
    }

    #[test]
    fn test_filter_precedence() {
        let cfg = LoggingConfig::from_lookup(|k| match k {
            "POLYSTORE_LOG" => Some("polystore=debug".into()),
            "RUST_LOG" => Some("warn".into()),
            "POLYSTORE_LOG_FORMAT" => Some("json".into()),
            _ => None,
        });
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.filter.to_string(), "polystore=debug");

        let fallback = LoggingConfig::from_lookup(|k| (k == "RUST_LOG").then(|| "warn".into()));
        assert_eq!(fallback.filter.to_string(), "warn");
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let cfg = LoggingConfig::from_lookup(|k| (k == "POLYSTORE_LOG").then(|| "polystore=loud".into()));
        assert_eq!(cfg.filter.to_string(), DEFAULT_FILTER);
    }
}
