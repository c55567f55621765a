use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Persists until cleared.
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn auto_expires(self) -> bool {
        !matches!(self, Severity::Error)
    }
}

/// A tracked error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub context: Value,
    pub stack: Option<String>,
    pub resolved: bool,
}

impl ErrorEntry {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// What callers hand to `set_error`: a bare message or a captured error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInput {
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorInput {
    /// Capture an error value. The `source()` chain becomes the stack.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

impl From<&str> for ErrorInput {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
            stack: None,
        }
    }
}

impl From<String> for ErrorInput {
    fn from(message: String) -> Self {
        Self {
            message,
            stack: None,
        }
    }
}

impl From<&crate::error::StateError> for ErrorInput {
    fn from(err: &crate::error::StateError) -> Self {
        Self::from_error(err)
    }
}

#[derive(Debug)]
pub(crate) struct ErrorSlot {
    pub entry: ErrorEntry,
    pub expiry: Option<TimerHandle>,
    pub generation: u64,
}

impl ErrorSlot {
    pub fn disarm(&mut self) {
        if let Some(timer) = self.expiry.take() {
            timer.cancel();
        }
    }
}
