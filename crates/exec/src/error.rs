use thiserror::Error;

/// Failures of the runner itself. A process that ran and exited non-zero is
/// not an error here; see [`crate::ExitOutcome`].
#[derive(Debug, Error)]
pub enum RunError {
    /// The executable could not be started (missing, not executable, bad cwd).
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("concurrency limiter closed")]
    LimiterClosed,
}

impl RunError {
    pub fn is_spawn(&self) -> bool {
        matches!(self, RunError::Spawn { .. })
    }
}
