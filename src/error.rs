use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// The canonical branch could not be checked out, or the repository is
    /// not usable at all. No tier was attempted.
    #[error("Cannot check out canonical branch '{branch}': {reason}")]
    Precondition { branch: String, reason: String },

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid tier name: {0}")]
    InvalidTier(String),

    #[error("Code assistant not available: {0}")]
    AssistantNotAvailable(String),

    #[error("Code assistant error: {0}")]
    Assistant(String),

    #[error("Knowledge store error: {0}")]
    Knowledge(String),
}

pub type Result<T> = std::result::Result<T, Error>;
