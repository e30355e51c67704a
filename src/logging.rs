use tracing_subscriber::EnvFilter;

use crate::error::StagingError;

/// `RUST_LOG` overrides the default `info` filter.
pub fn init() -> Result<(), StagingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| StagingError::Logging(err.to_string()))
}
