use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line, with the current span (and its trace id).
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// `RUST_LOG` when set, else `fallback` (e.g. "info" or
/// "td_intelligence=debug,warn").
fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. Returns false when one was already
/// installed, so tests can call this freely.
pub fn init(service_name: &str, level: &str, format: LogFormat) -> bool {
    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(env_filter(level))
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter(level))
            .with_current_span(true)
            .with_span_list(false)
            .try_init()
            .is_ok(),
    };
    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
    installed
}

/// Human-readable output.
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Pretty)
}

pub fn init_logging_json(service_name: &str, default_level: &str) -> bool {
    init(service_name, default_level, LogFormat::Json)
}

/// Pick the format from the `[general] log_json` flag.
pub fn init_from_flags(service_name: &str, level: &str, json: bool) -> bool {
    init(service_name, level, LogFormat::from_json_flag(json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_init_installs() {
        init_logging("tandem-test", "warn");
        assert!(!init_logging("tandem-test", "warn"));
        assert!(!init_from_flags("tandem-test", "warn", true));
    }

    #[test]
    fn json_flag_maps_to_format() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Pretty);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
