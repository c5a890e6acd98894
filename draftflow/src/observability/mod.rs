//! Tracing setup.
//!
//! The library only emits `tracing` events; binaries and tests decide where
//! they go by calling [`init_tracing`] once.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Returns false if a
/// subscriber was already installed or the filter did not parse.
pub fn init_tracing(default_filter: &str, json: bool) -> bool {
    let filter = match EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter)) {
        Ok(filter) => filter,
        Err(_) => return false,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.is_ok()
}

/// Span covering one orchestration run.
#[must_use]
pub fn run_span(run_id: &str, workflow: &str) -> tracing::Span {
    tracing::info_span!("run", run_id = %run_id, workflow = %workflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        init_tracing("draftflow=debug", false);
        assert!(!init_tracing("draftflow=debug", true));
    }

    #[test]
    fn test_run_span_is_usable() {
        let span = run_span("run-1", "article");
        let _entered = span.enter();
        tracing::info!("inside run span");
    }
}
