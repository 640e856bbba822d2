//! Tracing subscriber setup

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. Filtering follows `RUST_LOG`, defaulting
/// to `info`; `json` switches to JSON lines. Later calls are no-ops.
pub fn init_logging(json: bool) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);

        // Another subscriber may already be installed (e.g. by a test harness)
        let installed = if json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(false)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .try_init()
        } else {
            registry.with(fmt::layer().with_target(false)).try_init()
        };

        if installed.is_ok() {
            tracing::debug!(json, "Logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging(false);
        init_logging(true);
        assert!(INIT.get().is_some());
    }
}
