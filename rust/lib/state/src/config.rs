//! Store configuration.
//!
//! Read from a TOML file such as:
//!
//! ```toml
//! namespace = "gallery"
//! history_capacity = 100
//! loading_timeout_secs = 30
//! error_expiry_secs = 10
//! supported_languages = ["en", "ru"]
//! default_language = "en"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix for persisted keys: `<namespace>_state_<path>`.
    pub namespace: String,

    /// Maximum number of history entries kept.
    pub history_capacity: usize,

    /// A loading flag left on this long is force-cleared.
    pub loading_timeout_secs: u64,

    /// Warnings and info entries clear themselves after this long.
    pub error_expiry_secs: u64,

    /// Accepted values for `app.language`.
    pub supported_languages: Vec<String>,

    /// Initial `app.language`.
    pub default_language: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "gallery".to_string(),
            history_capacity: 100,
            loading_timeout_secs: 30,
            error_expiry_secs: 10,
            supported_languages: vec!["en".to_string(), "ru".to_string()],
            default_language: "en".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| StateError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, StateError> {
        let config: StoreConfig =
            toml::from_str(content).map_err(|e| StateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.namespace.is_empty() {
            return Err(StateError::Config("namespace must not be empty".into()));
        }
        if self.history_capacity == 0 {
            return Err(StateError::Config("history_capacity must be at least 1".into()));
        }
        if !self.supported_languages.contains(&self.default_language) {
            return Err(StateError::Config(format!(
                "default_language {:?} is not in supported_languages",
                self.default_language
            )));
        }
        Ok(())
    }

    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.loading_timeout_secs)
    }

    pub fn error_expiry(&self) -> Duration {
        Duration::from_secs(self.error_expiry_secs)
    }

    /// Storage key prefix shared by every persisted path.
    pub fn storage_prefix(&self) -> String {
        format!("{}_state_", self.namespace)
    }

    /// Storage key for one persisted path.
    pub fn storage_key(&self, path: &str) -> String {
        format!("{}{}", self.storage_prefix(), path)
    }
}
