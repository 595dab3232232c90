//! Logging setup

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Resolve the filter directive: `RUST_LOG` wins, then the explicit
/// override, then `YOMIAGE_LOG_LEVEL`, then `info`.
pub fn resolve_filter(level_override: Option<&str>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = level_override
        .map(str::to_string)
        .or_else(|| crate::config::get_env("YOMIAGE_LOG_LEVEL"))
        .unwrap_or_else(|| "info".to_string());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global logging system. Later calls are no-ops.
pub fn init_logging(level_override: Option<&str>) {
    INIT.get_or_init(|| {
        let filter = resolve_filter(level_override);
        // another subscriber may already be installed (tests, embedding)
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(Some("debug"));
        init_logging(Some("trace"));
        tracing::info!("still logging");
    }

    #[test]
    fn test_override_applies_without_rust_log() {
        if std::env::var("RUST_LOG").is_err() {
            let filter = resolve_filter(Some("warn"));
            assert_eq!(filter.to_string(), "warn");
        }
    }
}
