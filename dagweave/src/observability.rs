//! Logging setup for binaries and tests embedding the orchestrator.
//!
//! Library code logs through the `log` facade. `init_logging` installs a
//! `tracing` fmt subscriber and forwards `log` records into it.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global subscriber. `filter` uses `EnvFilter` syntax
/// (e.g. `"dagweave=debug"`); `RUST_LOG` takes precedence when set.
/// Calling it again is a no-op.
pub fn init_logging(filter: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_target(true)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            // Someone else installed a subscriber first; keep theirs
            return;
        }
        if let Err(e) = tracing_log::LogTracer::init() {
            tracing::warn!("log bridge already installed: {}", e);
        }
        tracing::debug!("logging initialised with filter '{}'", filter);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging("dagweave=debug");
        init_logging("dagweave=trace");
        log::info!("[Observability] test record");
    }
}
