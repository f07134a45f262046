use std::path::PathBuf;

use refinery_core::{StepName, StoreError};
use refinery_pipeline::StageError;
use thiserror::Error;

/// Failure talking to the scheduler API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler API error: {status} {body}")]
    Status { status: u16, body: String },

    #[error("no access token: {0}")]
    Token(String),

    #[error("failed to read token file {}: {source}", .path.display())]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected scheduler response: {0}")]
    Decode(String),

    #[error("no accounting record for scheduler job {0}")]
    NoRecord(String),

    #[error("remote task {task_id} failed: {detail}")]
    Task { task_id: String, detail: String },
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("job store: {0}")]
    Store(#[from] StoreError),

    #[error("results assembly failed: {0}")]
    Results(#[source] StageError),

    #[error("job has no scheduler job id")]
    MissingBatchId,

    #[error("step {0} did not reach Success in the batch run")]
    Incomplete(StepName),
}
