use gallery_storage::StorageError;
use thiserror::Error;

/// Failures inside store operations.
///
/// Public store methods mostly swallow these into the error tracker (under
/// the `"state"` key) and report a plain `bool`; [`crate::StateStore::try_set`]
/// hands them to the caller instead.
#[derive(Error, Debug)]
pub enum StateError {
    /// Path is empty, has an empty segment, or uses wildcards where a
    /// concrete path is required.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A prefix of the path already holds a non-object value.
    #[error("cannot extend {path:?}: {blocked_at:?} holds a non-object value")]
    PathConflict { path: String, blocked_at: String },

    /// A validator failed to run (as opposed to rejecting the value).
    #[error("validator for {path:?} failed: {message}")]
    Validator { path: String, message: String },

    /// A middleware panicked while handling a write.
    #[error("middleware failed on {path:?}: {message}")]
    Middleware { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(String),
}

impl StateError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        StateError::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
