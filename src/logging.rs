use crate::error::{Result, TrackerError};
use tracing::info;

/// Install a fmt subscriber for the host application.
///
/// `RUST_LOG` takes precedence over `level`. Fails if a global subscriber is
/// already set.
pub fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| TrackerError::LoggingError(e.to_string()))?;

    info!("Tracing initialized with level: {}", level);
    Ok(())
}
