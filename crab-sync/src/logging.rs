//! Logging Infrastructure
//!
//! `tracing` subscriber setup for binaries and tests embedding the façade.

/// Initialize the logger at `info`, honouring `RUST_LOG` when set
pub fn init_logger() {
    init_logger_with_level(None);
}

/// Initialize the logger with an explicit default level.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logger_with_level(log_level: Option<&str>) {
    let level = log_level.unwrap_or("info");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(false)
        .with_line_number(false)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}
