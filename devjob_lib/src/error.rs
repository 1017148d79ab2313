use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("a job with id {0} is running, stop it before re-running")]
    DuplicateJob(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Gone(String),
    #[error("could not spawn job script: {0}")]
    Spawn(#[source] io::Error),
    #[error("workspace i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unreadable job metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}
