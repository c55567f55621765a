use crate::error::StorageError;

/// Flat key-value storage, modelled on the browser's `localStorage`.
///
/// Keys are plain strings (`gallery_state_app.language`); values are opaque
/// bytes, usually JSON. Implementations must be shareable across threads.
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`. Returns `None` if absent.
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Keys starting with `prefix`, ordered.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.scan(prefix)?.into_iter().map(|(k, _)| k).collect())
    }
}

pub(crate) fn check_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
