//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

const DEFAULT_FILTER: &str = "http_mirror=info";
const DEBUG_FILTER: &str = "http_mirror=debug";

/// Pick the filter directive: `RUST_LOG` wins, then `--debug`, then the
/// configured filter.
pub fn filter_directive(config: &LoggingConfig, debug: bool, env: Option<&str>) -> String {
    if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
        return env.to_string();
    }
    if debug {
        return DEBUG_FILTER.to_string();
    }
    config
        .filter
        .clone()
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the global subscriber. Log lines go through a background writer
/// so a slow terminal never stalls the pipeline; keep the returned guard
/// alive until exit or buffered lines are lost.
pub fn init(config: &LoggingConfig, debug: bool) -> WorkerGuard {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(config, debug, env.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{directive}': {e}, using '{DEFAULT_FILTER}'");
        EnvFilter::new(DEFAULT_FILTER)
    });

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init(),
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_takes_precedence() {
        let config = LoggingConfig {
            format: LogFormat::Text,
            filter: Some("http_mirror=warn".into()),
        };
        assert_eq!(filter_directive(&config, true, Some("trace")), "trace");
        assert_eq!(filter_directive(&config, true, Some("  ")), DEBUG_FILTER);
        assert_eq!(filter_directive(&config, false, None), "http_mirror=warn");
        assert_eq!(
            filter_directive(&LoggingConfig::default(), false, None),
            DEFAULT_FILTER
        );
    }
}
