//! Logging configuration using tracing
//!
//! Structured logs go to stderr so CLI output on stdout stays machine-readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies
/// (`warn` for normal CLI use).
///
/// # Example RUST_LOG values
/// - `RUST_LOG=info` - token exchanges, refreshes, sync summaries
/// - `RUST_LOG=changeflow::transport=debug` - every retry decision
/// - `RUST_LOG=changeflow=debug,reqwest=info`
///
/// # Errors
/// Returns an error if a global subscriber is already installed
pub fn init_with_level(default_level: &str) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| {
            crate::ChangeflowError::Other(format!("Failed to initialize tracing: {}", e))
        })?;

    Ok(())
}

/// Initialize with the quiet default
pub fn init() -> crate::Result<()> {
    init_with_level("warn")
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init_with_level("debug");
}
