use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestkitError {
    /// Missing base image, unset disk directory and friends. Never retried.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Hypervisor command `{command}` failed: {output}")]
    Hypervisor { command: String, output: String },

    #[error("Remote command `{command}` on {target} failed: {output}")]
    Shell {
        target: String,
        command: String,
        output: String,
    },

    #[error("Machine {0} has no network address yet")]
    NotReady(String),

    #[error("Engine API error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("Unexpected engine state: {0}")]
    EngineState(String),

    #[error("Cluster bootstrap failed while {stage} on {machine}: {source}")]
    Bootstrap {
        stage: BootstrapStage,
        machine: String,
        #[source]
        source: Box<TestkitError>,
    },

    #[error("Did not converge within {waited:?}: {last_error}")]
    NotConverged { waited: Duration, last_error: String },

    /// Deadline expiry. Resources touched by the timed out operation are in
    /// an unknown state and must be reconciled by the caller.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TestkitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TestkitError::Timeout(_) | TestkitError::NotConverged { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    InitLeader,
    FetchJoinSnapshot,
    JoinWorker,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapStage::InitLeader => write!(f, "initializing the leader"),
            BootstrapStage::FetchJoinSnapshot => write!(f, "fetching the join token"),
            BootstrapStage::JoinWorker => write!(f, "joining a worker"),
        }
    }
}

// Result type alias for convenience
pub type TestkitResult<T> = Result<T, TestkitError>;
