//! Error types for the engine and its collaborators

use thiserror::Error;

/// Failure of a single external command (git, tmux, gh, ps).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("`{program}` exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from `{program}`: {detail}")]
    Parse { program: String, detail: String },
}

/// Errors surfaced by the snapshot engine and its operator commands
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to list projects: {0}")]
    Discovery(#[source] CommandError),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("worktree already exists: {0}")]
    AlreadyExists(String),

    #[error("{action} failed: {source}")]
    Mutation {
        action: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("snapshot does not reflect {action} of {path}")]
    NotReflected { action: &'static str, path: String },
}

impl EngineError {
    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Discovery(_) => "discovery_failed",
            EngineError::UnknownProject(_) => "unknown_project",
            EngineError::InvalidName { .. } => "invalid_name",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Mutation { .. } => "mutation_failed",
            EngineError::NotReflected { .. } => "not_reflected",
        }
    }
}
