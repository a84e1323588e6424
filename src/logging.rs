//! Process-wide tracing setup for binaries embedding the write-back subsystem.
#![forbid(unsafe_code)]

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{PatchworkError, Result};

/// Installs a `fmt` subscriber filtered by `level` (an `EnvFilter` directive).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| PatchworkError::Config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| PatchworkError::Config("logging already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_directive() {
        assert!(matches!(
            init_logging("patchwork=[bogus"),
            Err(PatchworkError::Config(_))
        ));
    }
}
