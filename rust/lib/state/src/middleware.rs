use serde_json::Value;
use tracing::debug;

/// Hook around every committed `set`.
///
/// Middleware runs in registration order. `before_set` sees the value
/// about to be written and may replace it or veto the write by returning
/// `Err(reason)`; `after_set` observes the change once it is in the tree
/// and subscribers have been told.
pub trait Middleware: Send + Sync {
    fn before_set(&self, _path: &str, value: Value, _old: Option<&Value>) -> Result<Value, String> {
        Ok(value)
    }

    fn after_set(&self, _path: &str, _value: &Value, _old: Option<&Value>) {}
}

/// Logs every change at debug level.
pub struct ChangeLogger;

impl Middleware for ChangeLogger {
    fn after_set(&self, path: &str, value: &Value, old: Option<&Value>) {
        let null = Value::Null;
        let old = old.unwrap_or(&null);
        debug!("state {path}: {old} -> {value}");
    }
}
