//! Error taxonomy for the convergence loop
//!
//! - `CoordinationError`: anything the backend facade returns
//! - `AgentError`: a cycle-aborting failure (backend, IO, JSON, template)
//!
//! Fire-and-forget OS commands never produce an error here, they are only
//! counted in [`crate::stats::ConvergenceStats`].

use std::path::PathBuf;

/// Errors raised by a [`crate::coordination::Coordination`] implementation
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("backend returned {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },
    #[error("could not decode backend response: {0}")]
    Decode(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("backend refused request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for CoordinationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CoordinationError::Decode(err.to_string())
        } else {
            CoordinationError::Transport(err.to_string())
        }
    }
}

/// Errors that abort the current control-loop cycle
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("service defaults missing or unreadable at {0}")]
    MissingDefaults(PathBuf),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to render template {path}: {message}")]
    Template { path: PathBuf, message: String },
    #[error("artifact fetch failed for {service}-{version}: {message}")]
    Artifact {
        service: String,
        version: String,
        message: String,
    },
    #[error("health checks for {service} did not pass within {waited_secs}s")]
    HealthTimeout { service: String, waited_secs: u64 },
    #[error("no usable network interface: {0}")]
    Discovery(String),
}

impl AgentError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
