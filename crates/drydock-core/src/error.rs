//! Error taxonomy for deployment orchestration.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Staging or polling failures for one server fail only the run they belong
/// to; the scheduler catches them, records a FAILED run, and keeps going.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("checksum verification of '{url}' failed after {attempts} attempt(s)")]
    Integrity { url: String, attempts: u32 },

    #[error("unrecognized repository layout: {0}")]
    RepositoryFormat(String),

    #[error("deployment polling timed out after {0:?}")]
    Timeout(Duration),

    #[error("http request to '{url}' failed: {reason}")]
    Http { url: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
