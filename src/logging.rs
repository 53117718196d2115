use tracing_subscriber::{EnvFilter, fmt};

/// Initialize structured logging with an environment filter.
/// Set `HSA_LOG=debug` (or trace, info, warn, error) for verbosity control.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_env("HSA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}
