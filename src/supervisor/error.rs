use thiserror::Error;

/// Errors surfaced by supervisor operations.
///
/// Only launch failures after the full retry budget propagate; probe
/// failures leave the process running but not working, and terminate is
/// always best-effort.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("sidecar failed to launch after {attempts} attempts: {source}")]
    LaunchFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}
