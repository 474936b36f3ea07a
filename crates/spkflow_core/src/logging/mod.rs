//! Logging.
//!
//! [`RunLog`] is the diagnostics sink handed to every procedure run through
//! its `RunContext`. Library events also go through `tracing`; the crate
//! never installs a global subscriber itself; applications call
//! [`init_tracing`] once if they want that output.
//!
//! # Example
//!
//! ```no_run
//! use spkflow_core::logging::{LogConfig, RunLog};
//!
//! let log = RunLog::with_file("train_diag_ubm", "/tmp/spkflow-logs", LogConfig::verbose())?;
//! log.phase("Diagonal UBM training");
//! log.pass(0, 4);
//! log.success("Model trained");
//! # Ok::<(), std::io::Error>(())
//! ```

mod run_log;
mod types;

pub use run_log::RunLog;
pub use types::{LineKind, LogCallback, LogConfig, LogLevel};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_level`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_filter()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .try_init()
        .is_ok()
}

/// Tracing for tests: warnings and above, captured by the test harness.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_test_tracing();
        assert!(!init_tracing(LogLevel::Info));
    }
}
