/// Errors surfaced by the store adapter and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// No authenticated user when one is required.
    #[error("not signed in: {0}")]
    Auth(String),

    /// Input rejected before reaching the store.
    #[error("invalid task: {0}")]
    Validation(String),

    /// The remote store failed (network, permission, quota).
    #[error("store error: {0}")]
    Store(String),

    /// Mutation or delete against a task that no longer exists.
    #[error("task not found: {0}")]
    NotFound(String),

    /// I/O error from a local collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a local file.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TaskError>;
