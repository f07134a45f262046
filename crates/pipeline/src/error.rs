use std::path::{Path, PathBuf};

use refinery_core::{StepName, StoreError};
use refinery_exec::{CommandSpec, ExitOutcome, RunError};
use thiserror::Error;

/// Why a stage failed. The `Display` text becomes the step's error message.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with {outcome}{detail}")]
    NonZeroExit {
        program: String,
        outcome: ExitOutcome,
        detail: String,
    },

    #[error("{program} timed out and was killed")]
    TimedOut { program: String },

    #[error("missing input: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error("could not parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("{failed} of {total} {what} tasks failed: {messages}")]
    TooManyFailures {
        what: String,
        failed: usize,
        total: usize,
        messages: String,
    },

    #[error("no {what} tasks succeeded ({total} attempted): {messages}")]
    NothingSucceeded {
        what: String,
        total: usize,
        messages: String,
    },

    #[error("Rg range {min}..{max} yields no MD windows")]
    EmptyRgRange { min: u32, max: u32 },

    #[error("archive creation failed: {0}")]
    Archive(String),

    #[error("job store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Run(RunError),
}

impl StageError {
    /// Error for a process that ran but did not succeed.
    pub fn from_outcome(spec: &CommandSpec, outcome: ExitOutcome, stderr_tail: &str) -> Self {
        let program = spec.program_name();
        if outcome.timed_out {
            return StageError::TimedOut { program };
        }
        let detail = match stderr_tail.lines().last() {
            Some(line) if !line.trim().is_empty() => format!(": {}", line.trim()),
            _ => String::new(),
        };
        StageError::NonZeroExit { program, outcome, detail }
    }

    pub fn io(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> StageError {
        let path = path.as_ref().to_path_buf();
        move |source| StageError::Io { path, source }
    }

    pub fn parse(what: impl Into<String>, detail: impl ToString) -> Self {
        StageError::Parse { what: what.into(), detail: detail.to_string() }
    }
}

impl From<RunError> for StageError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Spawn { program, source } => StageError::Spawn { program, source },
            other => StageError::Run(other),
        }
    }
}

impl From<minijinja::Error> for StageError {
    fn from(err: minijinja::Error) -> Self {
        StageError::Template(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step {step} failed: {source}")]
    Stage {
        step: StepName,
        #[source]
        source: StageError,
    },

    #[error("step {step} was not in Success when the pipeline finished")]
    Incomplete { step: StepName },

    #[error("job {0} runs on the remote scheduler")]
    RemoteJob(uuid::Uuid),

    #[error("job store: {0}")]
    Store(#[from] StoreError),
}
