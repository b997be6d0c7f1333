use thiserror::Error;

/// Errors produced while turning script text into a step list.
/// Always fatal; nothing executes after a compile error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("System command '{0}' is not on the allow-list")]
    ForbiddenCommand(String),

    #[error("No variable definition for '${{{0}}}'")]
    UnresolvedVariable(String),

    #[error("Variable expansion cycle: {0}")]
    ExpansionCycle(String),

    #[error("Malformed statement at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("Unbalanced block at line {line}: {message}")]
    UnbalancedBlock { line: usize, message: String },
}

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Target not resolved: {0}")]
    ResolutionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Internal error: {0}")]
    Internal(String),
}
