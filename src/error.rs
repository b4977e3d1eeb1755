use std::path::PathBuf;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid template '{name}': {message}")]
    InvalidTemplate { name: String, message: String },
}

/// Errors produced by the orchestration core.
///
/// The state registry and the delegation protocol return these as values;
/// the master's tool executor renders them into tool-result strings so the
/// orchestrating model can adapt instead of the turn failing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FederationError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("delegation cycle detected: worker {worker_id} already appears in chain [{}]", chain.join(" -> "))]
    CycleDetected {
        worker_id: String,
        chain: Vec<String>,
    },

    #[error("delegation chain too long: {depth} links exceeds limit of {max}")]
    ChainTooLong { depth: usize, max: usize },

    #[error("completion service failure: {0}")]
    ExternalServiceFailure(String),

    #[error("worker dispatch failure: {0}")]
    DispatchFailure(String),

    #[error("iteration limit of {limit} reached without a final answer")]
    IterationLimit { limit: usize },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl FederationError {
    pub fn worker_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "worker",
            id: id.into(),
        }
    }

    pub fn template_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "template",
            id: name.into(),
        }
    }
}
