use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use gallery_storage::KeyValueStorage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::bus::{self, Bus, ChangeHandler, Subscription};
use crate::config::StoreConfig;
use crate::error::StateError;
use crate::error_state::{ErrorEntry, ErrorInput, ErrorSlot, Severity};
use crate::history::{Action, History, HistoryEntry};
use crate::keys::{self, Key, Section};
use crate::loading::{LoadingEntry, LoadingSlot};
use crate::middleware::Middleware;
use crate::path::{Pattern, StatePath};
use crate::timer;
use crate::tree;
use crate::validate::{self, Validator};

/// Error-tracker key that internal store failures are filed under.
pub const STATE_ERROR_KEY: &str = "state";

/// Options for [`StateStore::set_with`].
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Skip subscriber notification.
    pub silent: bool,
    /// Run the path's validator, if any.
    pub validate: bool,
    /// Mirror the value into durable storage.
    pub persist: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            silent: false,
            validate: true,
            persist: false,
        }
    }
}

impl SetOptions {
    pub fn persisted() -> Self {
        Self {
            persist: true,
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Default::default()
        }
    }
}

/// Options for [`StateStore::subscribe_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Call the handler right away with the current value (concrete
    /// paths only).
    pub immediate: bool,
    /// Remove the subscription after its first delivery.
    pub once: bool,
}

/// Serializable view of everything the store tracks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub state: Value,
    pub loading: BTreeMap<String, LoadingEntry>,
    pub errors: BTreeMap<String, ErrorEntry>,
    pub history_len: usize,
    pub taken_at: DateTime<Utc>,
}

/// Reactive, path-keyed application state.
///
/// A `StateStore` is a cheap handle (`Arc` inside); clone it into every
/// component that needs state. Independent stores share nothing.
///
/// - `set(path, value)` writes into the nested JSON tree and notifies
///   matching subscribers synchronously.
/// - `get(path)` reads the current value.
/// - `set_loading` / `set_error` maintain the loading and error trackers,
///   both with self-cancelling timers on the ambient tokio runtime.
/// - `subscribe(pattern, handler)` observes changes; `*` matches one
///   segment, a trailing `**` the rest of the path.
///
/// Failures never escape as panics or errors from the `bool`-returning
/// methods: they are logged and filed in the error tracker under
/// [`STATE_ERROR_KEY`].
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: StoreConfig,
    state: RwLock<Value>,
    bus: Arc<Bus>,
    validators: RwLock<HashMap<String, Validator>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    history: Mutex<History>,
    loading: Mutex<HashMap<String, LoadingSlot>>,
    errors: Mutex<HashMap<String, ErrorSlot>>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    generation: AtomicU64,
}

impl StateStore {
    /// Create a store with the initial tree and built-in validators.
    ///
    /// An invalid config is replaced by the defaults and the problem is
    /// filed under [`STATE_ERROR_KEY`]; use [`StateStore::try_new`] to get
    /// the error instead.
    pub fn new(config: StoreConfig) -> Self {
        Self::checked(config, None)
    }

    /// Like [`StateStore::new`], but rejects an invalid config.
    pub fn try_new(config: StoreConfig) -> Result<Self, StateError> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Create a store that mirrors persisted keys into `storage` and
    /// restores whatever is already there.
    pub fn with_storage(config: StoreConfig, storage: Arc<dyn KeyValueStorage>) -> Self {
        let store = Self::checked(config, Some(storage));
        store.restore();
        store
    }

    fn checked(config: StoreConfig, storage: Option<Arc<dyn KeyValueStorage>>) -> Self {
        match config.validate() {
            Ok(()) => Self::build(config, storage),
            Err(e) => {
                error!("invalid store config, falling back to defaults: {e}");
                let store = Self::build(StoreConfig::default(), storage);
                store.set_error(STATE_ERROR_KEY, &e, Severity::Error, json!({ "config": true }));
                store
            }
        }
    }

    fn build(config: StoreConfig, storage: Option<Arc<dyn KeyValueStorage>>) -> Self {
        let validators = validate::builtin(&config)
            .into_iter()
            .map(|(path, v)| (path.to_string(), v))
            .collect();
        let inner = Inner {
            state: RwLock::new(keys::initial_state(&config)),
            bus: Bus::new(),
            validators: RwLock::new(validators),
            middleware: RwLock::new(Vec::new()),
            history: Mutex::new(History::new(config.history_capacity)),
            loading: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            storage,
            generation: AtomicU64::new(1),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ====================================================================
    // State: read
    // ====================================================================

    /// Current value at `path`; `None` if missing or malformed.
    pub fn get(&self, path: &str) -> Option<Value> {
        match StatePath::parse(path) {
            Ok(parsed) => self.get_path(&parsed),
            Err(e) => {
                debug!("get: {e}");
                None
            }
        }
    }

    fn get_path(&self, path: &StatePath) -> Option<Value> {
        let state = self.inner.state.read().unwrap();
        tree::get_at(&state, path).cloned()
    }

    /// Typed read. `None` if missing or not representable as `T`.
    pub fn get_key<T: DeserializeOwned>(&self, key: Key<T>) -> Option<T> {
        let value = self.get(key.path())?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("get_key {}: {e}", key.path());
                None
            }
        }
    }

    /// Copy of the whole tree.
    pub fn state(&self) -> Value {
        self.inner.state.read().unwrap().clone()
    }

    // ====================================================================
    // State: write
    // ====================================================================

    /// Write with default options. Returns whether the write happened.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> bool {
        self.set_with(path, value, SetOptions::default())
    }

    /// Write with explicit options. Returns whether the write happened.
    pub fn set_with(&self, path: &str, value: impl Into<Value>, opts: SetOptions) -> bool {
        match self.try_set(path, value, opts) {
            Ok(written) => written,
            Err(e) => {
                error!("set {path} failed: {e}");
                self.set_error(STATE_ERROR_KEY, &e, Severity::Error, json!({ "path": path }));
                false
            }
        }
    }

    /// Typed write.
    pub fn set_key<T: Serialize>(&self, key: Key<T>, value: T) -> bool {
        self.set_key_with(key, value, SetOptions::default())
    }

    pub fn set_key_with<T: Serialize>(&self, key: Key<T>, value: T, opts: SetOptions) -> bool {
        match serde_json::to_value(value) {
            Ok(v) => self.set_with(key.path(), v, opts),
            Err(e) => {
                let e = StateError::from(e);
                error!("set {} failed: {e}", key.path());
                self.set_error(
                    STATE_ERROR_KEY,
                    &e,
                    Severity::Error,
                    json!({ "path": key.path() }),
                );
                false
            }
        }
    }

    /// The fallible core of `set`.
    ///
    /// `Ok(false)` means a validator or middleware declined the value;
    /// state is unchanged and nothing is recorded. `Err` is a malformed
    /// path, a path conflict, or a validator that failed to run.
    pub fn try_set(
        &self,
        path: &str,
        value: impl Into<Value>,
        opts: SetOptions,
    ) -> Result<bool, StateError> {
        let path = StatePath::parse(path)?;
        let value = value.into();

        if opts.validate && !self.check(&path, &value)? {
            warn!("rejected invalid value for {path}: {value}");
            return Ok(false);
        }

        let current = self.get_path(&path);
        let value = match self.run_before(&path, value, current.as_ref())? {
            Ok(v) => v,
            Err(reason) => {
                warn!("middleware rejected write to {path}: {reason}");
                return Ok(false);
            }
        };

        let old = {
            let mut state = self.inner.state.write().unwrap();
            tree::set_at(&mut state, &path, value.clone())?
        };

        self.inner.history.lock().unwrap().record(
            Action::Set,
            path.as_str(),
            old.clone(),
            Some(value.clone()),
        );

        if opts.persist {
            self.persist(&path, &value);
        }
        if !opts.silent {
            self.inner.bus.deliver(path.as_str(), &value, old.as_ref());
        }
        self.run_after(&path, &value, old.as_ref());
        Ok(true)
    }

    fn check(&self, path: &StatePath, value: &Value) -> Result<bool, StateError> {
        let validator = self
            .inner
            .validators
            .read()
            .unwrap()
            .get(path.as_str())
            .cloned();
        let Some(validator) = validator else {
            return Ok(true);
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| validator(value)))
            .unwrap_or_else(|payload| {
                Err(format!("panicked: {}", bus::panic_message(payload.as_ref())))
            });
        result.map_err(|message| StateError::Validator {
            path: path.to_string(),
            message,
        })
    }

    /// Inner `Err` is a veto; outer `Err` a middleware that panicked.
    fn run_before(
        &self,
        path: &StatePath,
        mut value: Value,
        old: Option<&Value>,
    ) -> Result<Result<Value, String>, StateError> {
        let chain = self.inner.middleware.read().unwrap().clone();
        for mw in chain {
            let step = panic::catch_unwind(AssertUnwindSafe(|| {
                mw.before_set(path.as_str(), value, old)
            }));
            value = match step {
                Ok(Ok(v)) => v,
                Ok(Err(reason)) => return Ok(Err(reason)),
                Err(payload) => {
                    return Err(StateError::Middleware {
                        path: path.to_string(),
                        message: bus::panic_message(payload.as_ref()).to_string(),
                    });
                }
            };
        }
        Ok(Ok(value))
    }

    fn run_after(&self, path: &StatePath, value: &Value, old: Option<&Value>) {
        let chain = self.inner.middleware.read().unwrap().clone();
        for mw in chain {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                mw.after_set(path.as_str(), value, old)
            }));
            if let Err(payload) = result {
                error!(
                    "middleware panicked after writing {path}: {}",
                    bus::panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Install (or replace) the validator for a concrete path.
    pub fn add_validator<F>(&self, path: &str, validator: F) -> Result<(), StateError>
    where
        F: Fn(&Value) -> Result<bool, String> + Send + Sync + 'static,
    {
        let path = StatePath::parse(path)?;
        self.inner
            .validators
            .write()
            .unwrap()
            .insert(path.to_string(), Arc::new(validator));
        Ok(())
    }

    /// Append a middleware to the chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middleware.write().unwrap().push(middleware);
    }

    // ====================================================================
    // Persistence
    // ====================================================================

    fn persist(&self, path: &StatePath, value: &Value) {
        let Some(storage) = &self.inner.storage else {
            debug!("persist {path}: no storage configured");
            return;
        };
        let key = self.inner.config.storage_key(path.as_str());
        let result = serde_json::to_vec(value)
            .map_err(StateError::from)
            .and_then(|bytes| storage.set_item(&key, &bytes).map_err(StateError::from));
        if let Err(e) = result {
            warn!("could not persist {path}: {e}");
        }
    }

    /// Remove a persisted key. The in-memory value is untouched.
    pub fn forget_persisted(&self, path: &str) {
        if let Some(storage) = &self.inner.storage {
            let key = self.inner.config.storage_key(path);
            if let Err(e) = storage.remove_item(&key) {
                warn!("could not forget persisted {path}: {e}");
            }
        }
    }

    fn restore(&self) {
        let Some(storage) = &self.inner.storage else {
            return;
        };
        let prefix = self.inner.config.storage_prefix();
        let entries = match storage.scan(&prefix) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("could not read persisted state: {e}");
                return;
            }
        };

        let mut restored = 0;
        for (key, bytes) in entries {
            let raw_path = &key[prefix.len()..];
            let parsed = StatePath::parse(raw_path).map_err(|e| e.to_string()).and_then(|p| {
                serde_json::from_slice::<Value>(&bytes)
                    .map(|v| (p, v))
                    .map_err(|e| e.to_string())
            });
            let (path, value) = match parsed {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("skipping persisted {key}: {e}");
                    continue;
                }
            };

            let write = {
                let mut state = self.inner.state.write().unwrap();
                tree::set_at(&mut state, &path, value.clone())
            };
            match write {
                Ok(old) => {
                    self.inner.history.lock().unwrap().record(
                        Action::Restore,
                        path.as_str(),
                        old,
                        Some(value),
                    );
                    restored += 1;
                }
                Err(e) => warn!("skipping persisted {key}: {e}"),
            }
        }
        debug!("restored {restored} persisted state entries");
    }

    // ====================================================================
    // Loading tracker
    // ====================================================================

    /// Turn a named loading flag on or off.
    ///
    /// Turning it on (re)arms a watchdog that forces it off after
    /// `loading_timeout`; turning it off cancels the watchdog and freezes
    /// the duration. `ui.isLoading` follows the aggregate.
    pub fn set_loading(&self, key: &str, is_loading: bool, message: impl Into<String>) {
        let message = message.into();
        let entry = {
            let mut loading = self.inner.loading.lock().unwrap();
            let slot = loading.entry(key.to_string()).or_default();
            slot.disarm();
            if is_loading {
                slot.entry.start(message);
                slot.generation = self.next_generation();
                slot.watchdog = self.arm_watchdog(key, slot.generation);
            } else {
                slot.entry.finish(message, false);
            }
            slot.entry.clone()
        };

        self.inner
            .bus
            .deliver(&format!("loading.{key}"), &entry.to_value(), None);
        self.refresh_loading_flag();
    }

    fn arm_watchdog(&self, key: &str, generation: u64) -> Option<timer::TimerHandle> {
        let weak = self.downgrade();
        let key = key.to_string();
        timer::schedule(self.inner.config.loading_timeout(), "loading watchdog", move || {
            if let Some(store) = Self::from_weak(&weak) {
                store.expire_loading(&key, generation);
            }
        })
    }

    fn expire_loading(&self, key: &str, generation: u64) {
        let entry = {
            let mut loading = self.inner.loading.lock().unwrap();
            let Some(slot) = loading.get_mut(key) else {
                return;
            };
            if slot.generation != generation || !slot.entry.is_loading {
                return;
            }
            slot.watchdog = None;
            let message = slot.entry.message.clone();
            slot.entry.finish(message, true);
            slot.entry.clone()
        };

        warn!(
            "loading {key:?} still on after {:?}, forcing it off",
            self.inner.config.loading_timeout()
        );
        self.inner
            .bus
            .deliver(&format!("loading.{key}"), &entry.to_value(), None);
        self.refresh_loading_flag();
    }

    fn refresh_loading_flag(&self) {
        let any = self.is_any_loading();
        if self.get_key(keys::UI_IS_LOADING) != Some(any) {
            self.set_key_with(
                keys::UI_IS_LOADING,
                any,
                SetOptions {
                    validate: false,
                    ..Default::default()
                },
            );
        }
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.inner
            .loading
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|slot| slot.entry.is_loading)
    }

    pub fn is_any_loading(&self) -> bool {
        self.inner
            .loading
            .lock()
            .unwrap()
            .values()
            .any(|slot| slot.entry.is_loading)
    }

    pub fn loading(&self, key: &str) -> Option<LoadingEntry> {
        self.inner
            .loading
            .lock()
            .unwrap()
            .get(key)
            .map(|slot| slot.entry.clone())
    }

    pub fn loading_entries(&self) -> BTreeMap<String, LoadingEntry> {
        self.inner
            .loading
            .lock()
            .unwrap()
            .iter()
            .map(|(k, slot)| (k.clone(), slot.entry.clone()))
            .collect()
    }

    // ====================================================================
    // Error tracker
    // ====================================================================

    /// Record an error under `key`, replacing any previous one.
    ///
    /// Warning and info entries clear themselves after `error_expiry`
    /// unless replaced or cleared first.
    pub fn set_error(
        &self,
        key: &str,
        error: impl Into<ErrorInput>,
        severity: Severity,
        context: Value,
    ) {
        let input = error.into();
        let entry = ErrorEntry {
            message: input.message,
            severity,
            timestamp: Utc::now(),
            context,
            stack: input.stack,
            resolved: false,
        };

        let old = {
            let mut errors = self.inner.errors.lock().unwrap();
            let old = errors.remove(key).map(|mut slot| {
                slot.disarm();
                slot.entry
            });
            let generation = self.next_generation();
            let expiry = if severity.auto_expires() {
                self.arm_expiry(key, generation)
            } else {
                None
            };
            errors.insert(
                key.to_string(),
                ErrorSlot {
                    entry: entry.clone(),
                    expiry,
                    generation,
                },
            );
            old
        };

        match severity {
            Severity::Error => error!("[{key}] {}", entry.message),
            Severity::Warning => warn!("[{key}] {}", entry.message),
            Severity::Info => info!("[{key}] {}", entry.message),
        }

        let old = old.map(|e| e.to_value());
        self.inner
            .bus
            .deliver(&format!("error.{key}"), &entry.to_value(), old.as_ref());
    }

    fn arm_expiry(&self, key: &str, generation: u64) -> Option<timer::TimerHandle> {
        let weak = self.downgrade();
        let key = key.to_string();
        timer::schedule(self.inner.config.error_expiry(), "error expiry", move || {
            if let Some(store) = Self::from_weak(&weak) {
                store.expire_error(&key, generation);
            }
        })
    }

    fn expire_error(&self, key: &str, generation: u64) {
        let expired = {
            let mut errors = self.inner.errors.lock().unwrap();
            match errors.get(key) {
                Some(slot) if slot.generation == generation => errors.remove(key),
                _ => None,
            }
        };
        if let Some(slot) = expired {
            debug!("error {key:?} expired");
            self.resolve_error(key, slot);
        }
    }

    /// Remove the error under `key`. Subscribers receive the final entry
    /// marked resolved. Returns whether there was one.
    pub fn clear_error(&self, key: &str) -> bool {
        let removed = self.inner.errors.lock().unwrap().remove(key);
        match removed {
            Some(slot) => {
                self.resolve_error(key, slot);
                true
            }
            None => false,
        }
    }

    fn resolve_error(&self, key: &str, mut slot: ErrorSlot) {
        slot.disarm();
        let old = slot.entry.to_value();
        slot.entry.resolved = true;
        self.inner
            .bus
            .deliver(&format!("error.{key}"), &slot.entry.to_value(), Some(&old));
    }

    /// Clear every tracked error.
    pub fn clear_all_errors(&self) {
        let names: Vec<String> = self.inner.errors.lock().unwrap().keys().cloned().collect();
        for key in names {
            self.clear_error(&key);
        }
    }

    pub fn has_error(&self, key: &str) -> bool {
        self.inner.errors.lock().unwrap().contains_key(key)
    }

    pub fn get_error(&self, key: &str) -> Option<ErrorEntry> {
        self.inner
            .errors
            .lock()
            .unwrap()
            .get(key)
            .map(|slot| slot.entry.clone())
    }

    pub fn errors(&self) -> BTreeMap<String, ErrorEntry> {
        self.inner
            .errors
            .lock()
            .unwrap()
            .iter()
            .map(|(k, slot)| (k.clone(), slot.entry.clone()))
            .collect()
    }

    // ====================================================================
    // Subscriptions
    // ====================================================================

    /// Observe changes to paths matching `pattern`.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<Subscription, StateError>
    where
        F: Fn(&str, &Value, Option<&Value>) + Send + Sync + 'static,
    {
        self.subscribe_with(pattern, handler, SubscribeOptions::default())
    }

    pub fn subscribe_with<F>(
        &self,
        pattern: &str,
        handler: F,
        opts: SubscribeOptions,
    ) -> Result<Subscription, StateError>
    where
        F: Fn(&str, &Value, Option<&Value>) + Send + Sync + 'static,
    {
        let pattern = Pattern::parse(pattern)?;
        let handler: ChangeHandler = Arc::new(handler);
        let (subscription, registered) =
            self.inner
                .bus
                .subscribe(pattern.as_str(), handler, opts.once);

        if opts.immediate {
            if pattern.is_concrete() {
                let current = self.get(pattern.as_str()).unwrap_or(Value::Null);
                bus::invoke(
                    subscription.id(),
                    &registered,
                    pattern.as_str(),
                    &current,
                    None,
                );
            } else {
                debug!("immediate delivery skipped for wildcard pattern {pattern}");
            }
        }
        Ok(subscription)
    }

    /// Observe every change inside a section (`ui.**` and so on).
    pub fn subscribe_section<F>(&self, section: Section, handler: F) -> Subscription
    where
        F: Fn(&str, &Value, Option<&Value>) + Send + Sync + 'static,
    {
        let (subscription, _) = self
            .inner
            .bus
            .subscribe(&section.pattern(), Arc::new(handler), false);
        subscription
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.bus.listener_count()
    }

    // ====================================================================
    // History, reset, snapshot
    // ====================================================================

    /// Recent transitions, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().unwrap().entries()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().unwrap().clear();
    }

    /// Return to the initial tree.
    ///
    /// Cancels every timer, empties the loading and error trackers and
    /// notifies each leaf path whose value changed. Subscriptions,
    /// validators and middleware stay. Persisted keys are not touched.
    pub fn reset(&self) {
        let loading: Vec<(String, LoadingSlot)> = {
            let mut map = self.inner.loading.lock().unwrap();
            map.drain().collect()
        };

        let errors: Vec<(String, ErrorSlot)> = {
            let mut map = self.inner.errors.lock().unwrap();
            map.drain().collect()
        };

        let fresh = keys::initial_state(&self.inner.config);
        let old = {
            let mut state = self.inner.state.write().unwrap();
            std::mem::replace(&mut *state, fresh.clone())
        };
        self.inner.history.lock().unwrap().record(
            Action::Reset,
            "",
            Some(old.clone()),
            Some(fresh.clone()),
        );
        info!("state reset");

        for (key, mut slot) in loading {
            slot.disarm();
            if slot.entry.is_loading {
                let message = slot.entry.message.clone();
                slot.entry.finish(message, false);
                self.inner
                    .bus
                    .deliver(&format!("loading.{key}"), &slot.entry.to_value(), None);
            }
        }
        for (key, slot) in errors {
            self.resolve_error(&key, slot);
        }

        let before: BTreeMap<String, Value> = tree::leaves(&old).into_iter().collect();
        let after: BTreeMap<String, Value> = tree::leaves(&fresh).into_iter().collect();
        let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for path in paths {
            let old_value = before.get(path);
            let new_value = after.get(path);
            if old_value != new_value {
                self.inner.bus.deliver(
                    path,
                    new_value.unwrap_or(&Value::Null),
                    old_value,
                );
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state(),
            loading: self.loading_entries(),
            errors: self.errors(),
            history_len: self.inner.history.lock().unwrap().len(),
            taken_at: Utc::now(),
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("namespace", &self.inner.config.namespace)
            .field("listeners", &self.inner.bus.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gallery_storage::{MemoryStorage, StorageError};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(String, Value, Option<Value>)>>>;

    fn record(store: &StateStore, pattern: &str) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store
            .subscribe(pattern, move |path, value, old| {
                s.lock()
                    .unwrap()
                    .push((path.to_string(), value.clone(), old.cloned()));
            })
            .unwrap();
        seen
    }

    fn count(store: &StateStore, pattern: &str, opts: SubscribeOptions) -> Arc<AtomicU32> {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        store
            .subscribe_with(
                pattern,
                move |_, _, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                opts,
            )
            .unwrap();
        hits
    }

    // ====================================================================
    // Set / get
    // ====================================================================

    #[test]
    fn set_then_get() {
        let store = StateStore::default();
        assert!(store.set("ui.scrollPosition", 420.5));
        assert_eq!(store.get("ui.scrollPosition"), Some(json!(420.5)));

        assert!(store.set("gallery.filters.year", 1998));
        assert_eq!(store.get("gallery.filters"), Some(json!({ "year": 1998 })));
        assert_eq!(store.get("gallery.missing"), None);
    }

    #[test]
    fn initial_tree_is_readable() {
        let store = StateStore::default();
        assert_eq!(store.get("app.language"), Some(json!("en")));
        assert_eq!(store.get_key(keys::UI_IS_ONLINE), Some(true));
        assert_eq!(store.get_key(keys::UI_ACTIVE_MODAL), Some(None));
    }

    #[test]
    fn malformed_path_is_filed_as_error() {
        let store = StateStore::default();
        assert!(!store.set("ui..menuOpen", true));
        assert!(!store.set("", 1));

        let entry = store.get_error(STATE_ERROR_KEY).unwrap();
        assert_eq!(entry.severity, Severity::Error);
        assert_eq!(entry.context, json!({ "path": "" }));
        assert!(store.history().is_empty());
    }

    #[test]
    fn extending_a_leaf_is_a_conflict() {
        let store = StateStore::default();
        assert!(!store.set("app.language.code", "ru"));
        assert_eq!(store.get("app.language"), Some(json!("en")));
        assert!(store.has_error(STATE_ERROR_KEY));

        let err = store
            .try_set("app.language.code", "ru", SetOptions::default())
            .unwrap_err();
        assert!(matches!(err, StateError::PathConflict { .. }));
    }

    #[test]
    fn get_with_bad_path_is_none() {
        let store = StateStore::default();
        assert_eq!(store.get("app."), None);
        assert!(!store.has_error(STATE_ERROR_KEY));
    }

    #[test]
    fn typed_keys_round_trip() {
        let store = StateStore::default();
        assert!(store.set_key(keys::APP_THEME, keys::Theme::Dark));
        assert_eq!(store.get("app.theme"), Some(json!("dark")));
        assert_eq!(store.get_key(keys::APP_THEME), Some(keys::Theme::Dark));

        assert!(store.set_key(keys::UI_ACTIVE_MODAL, Some("contact".to_string())));
        assert_eq!(
            store.get_key(keys::UI_ACTIVE_MODAL),
            Some(Some("contact".to_string()))
        );

        store.set("ui.menuOpen", "yes");
        assert_eq!(store.get_key(keys::UI_MENU_OPEN), None);
    }

    #[test]
    fn silent_write_records_history_but_does_not_notify() {
        let store = StateStore::default();
        let seen = record(&store, "ui.menuOpen");

        assert!(store.set_with("ui.menuOpen", true, SetOptions::silent()));
        assert_eq!(store.get("ui.menuOpen"), Some(json!(true)));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(store.history().len(), 1);
    }

    // ====================================================================
    // Validators and middleware
    // ====================================================================

    #[test]
    fn builtin_validators_reject_unknown_values() {
        let store = StateStore::default();
        let seen = record(&store, "app.*");

        assert!(!store.set("app.language", "fr"));
        assert!(!store.set("app.theme", "sepia"));
        assert_eq!(store.get("app.language"), Some(json!("en")));
        assert!(seen.lock().unwrap().is_empty());
        assert!(store.history().is_empty());
        assert!(!store.has_error(STATE_ERROR_KEY));

        assert!(store.set("app.language", "ru"));
        assert_eq!(store.get_key(keys::APP_LANGUAGE).as_deref(), Some("ru"));
    }

    #[test]
    fn validation_can_be_skipped() {
        let store = StateStore::default();
        let opts = SetOptions {
            validate: false,
            ..Default::default()
        };
        assert!(store.set_with("app.language", "fr", opts));
        assert_eq!(store.get("app.language"), Some(json!("fr")));
    }

    #[test]
    fn custom_validator() {
        let store = StateStore::default();
        store
            .add_validator("ui.scrollPosition", |v| {
                Ok(v.as_f64().is_some_and(|n| n >= 0.0))
            })
            .unwrap();

        assert!(!store.set("ui.scrollPosition", -10));
        assert!(store.set("ui.scrollPosition", 10));
        assert!(store.add_validator("ui.*", |_| Ok(true)).is_err());
    }

    #[test]
    fn failing_validator_is_filed_as_error() {
        let store = StateStore::default();
        store
            .add_validator("user.name", |_| Err("lookup table missing".into()))
            .unwrap();

        assert!(!store.set("user.name", "Ilya"));
        let entry = store.get_error(STATE_ERROR_KEY).unwrap();
        assert!(entry.message.contains("lookup table missing"));
        assert_eq!(entry.context, json!({ "path": "user.name" }));
    }

    struct Clamp;

    impl Middleware for Clamp {
        fn before_set(&self, path: &str, value: Value, _old: Option<&Value>) -> Result<Value, String> {
            match (path, value.as_f64()) {
                ("ui.scrollPosition", Some(n)) if n > 1000.0 => Ok(json!(1000.0)),
                _ => Ok(value),
            }
        }
    }

    struct ReadOnlyUser;

    impl Middleware for ReadOnlyUser {
        fn before_set(&self, path: &str, value: Value, _old: Option<&Value>) -> Result<Value, String> {
            if path.starts_with("user.") {
                Err("user preferences are read-only".into())
            } else {
                Ok(value)
            }
        }
    }

    #[derive(Default)]
    struct Audit(Mutex<Vec<String>>);

    impl Middleware for Audit {
        fn after_set(&self, path: &str, value: &Value, _old: Option<&Value>) {
            self.0.lock().unwrap().push(format!("{path}={value}"));
        }
    }

    #[test]
    fn middleware_transforms_and_vetoes() {
        let store = StateStore::default();
        let audit = Arc::new(Audit::default());
        store.use_middleware(Arc::new(Clamp));
        store.use_middleware(Arc::new(ReadOnlyUser));
        store.use_middleware(audit.clone());

        assert!(store.set("ui.scrollPosition", 5000.0));
        assert_eq!(store.get("ui.scrollPosition"), Some(json!(1000.0)));

        assert!(!store.set("user.preferences.reducedMotion", true));
        assert_eq!(store.get_key(keys::USER_REDUCED_MOTION), Some(false));

        assert_eq!(
            audit.0.lock().unwrap().as_slice(),
            ["ui.scrollPosition=1000.0".to_string()]
        );
    }

    #[test]
    fn panicking_validator_is_filed_as_error() {
        let store = StateStore::default();
        store
            .add_validator("ui.scrollPosition", |_| panic!("validator bug"))
            .unwrap();

        assert!(!store.set("ui.scrollPosition", 1));
        assert_eq!(store.get("ui.scrollPosition"), Some(json!(0.0)));
        let entry = store.get_error(STATE_ERROR_KEY).unwrap();
        assert!(entry.message.contains("validator bug"));
        assert!(store.history().is_empty());
    }

    struct Exploding;

    impl Middleware for Exploding {
        fn before_set(&self, path: &str, value: Value, _old: Option<&Value>) -> Result<Value, String> {
            if path == "ui.menuOpen" {
                panic!("middleware bug");
            }
            Ok(value)
        }

        fn after_set(&self, path: &str, _value: &Value, _old: Option<&Value>) {
            if path == "ui.isOnline" {
                panic!("audit sink gone");
            }
        }
    }

    #[test]
    fn panicking_middleware_is_contained() {
        let store = StateStore::default();
        store.use_middleware(Arc::new(Exploding));

        assert!(!store.set("ui.menuOpen", true));
        assert_eq!(store.get_key(keys::UI_MENU_OPEN), Some(false));
        let entry = store.get_error(STATE_ERROR_KEY).unwrap();
        assert!(entry.message.contains("middleware bug"));

        // The write is already committed when after_set runs.
        assert!(store.set("ui.isOnline", false));
        assert_eq!(store.get_key(keys::UI_IS_ONLINE), Some(false));
    }

    #[test]
    fn change_logger_handles_new_paths() {
        let store = StateStore::default();
        store.use_middleware(Arc::new(crate::middleware::ChangeLogger));
        assert!(store.set("gallery.page", 2));
        assert!(store.set("gallery.page", 3));
    }

    // ====================================================================
    // Subscriptions
    // ====================================================================

    #[test]
    fn subscriber_sees_new_and_old_values() {
        let store = StateStore::default();
        let seen = record(&store, "app.language");
        store.set("app.language", "ru");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("app.language".to_string(), json!("ru"), Some(json!("en")))]
        );
    }

    #[test]
    fn wildcard_matches_one_segment() {
        let store = StateStore::default();
        let seen = record(&store, "ui.*");

        store.set("ui.isLoading", true);
        store.set("ui.scrollPosition", 300);
        store.set("app.language", "ru");

        let paths: Vec<String> = seen.lock().unwrap().iter().map(|(p, _, _)| p.clone()).collect();
        assert_eq!(paths, ["ui.isLoading", "ui.scrollPosition"]);
    }

    #[test]
    fn section_subscription_sees_nested_paths() {
        let store = StateStore::default();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let sub = store.subscribe_section(Section::User, move |_, _, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        store.set("user.preferences.reducedMotion", true);
        store.set("user.visits", 3);
        store.set("ui.menuOpen", true);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(sub.unsubscribe());
        store.set("user.visits", 4);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_fires_a_single_time() {
        let store = StateStore::default();
        let hits = count(
            &store,
            "ui.menuOpen",
            SubscribeOptions {
                once: true,
                ..Default::default()
            },
        );
        let before = store.listener_count();

        store.set("ui.menuOpen", true);
        store.set("ui.menuOpen", false);
        store.set("ui.menuOpen", true);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.listener_count(), before - 1);
    }

    #[test]
    fn once_holds_under_reentrant_writes() {
        let store = StateStore::default();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let inner = store.clone();
        store
            .subscribe_with(
                "ui.scrollPosition",
                move |_, value, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                    let n = value.as_f64().unwrap_or_default();
                    inner.set("ui.scrollPosition", n + 1.0);
                },
                SubscribeOptions {
                    once: true,
                    ..Default::default()
                },
            )
            .unwrap();

        store.set("ui.scrollPosition", 1.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("ui.scrollPosition"), Some(json!(2.0)));
    }

    #[test]
    fn immediate_delivers_current_value() {
        let store = StateStore::default();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store
            .subscribe_with(
                "app.language",
                move |path, value, old| {
                    s.lock()
                        .unwrap()
                        .push((path.to_string(), value.clone(), old.cloned()));
                },
                SubscribeOptions {
                    immediate: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("app.language".to_string(), json!("en"), None)]
        );
    }

    #[test]
    fn immediate_once_consumes_the_subscription() {
        let store = StateStore::default();
        let hits = count(
            &store,
            "ui.isOnline",
            SubscribeOptions {
                immediate: true,
                once: true,
            },
        );
        store.set("ui.isOnline", false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn immediate_skipped_for_wildcards() {
        let store = StateStore::default();
        let hits = count(
            &store,
            "ui.*",
            SubscribeOptions {
                immediate: true,
                ..Default::default()
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let store = StateStore::default();
        assert!(store.subscribe("ui..x", |_, _, _| {}).is_err());
        assert!(store.subscribe("**.ui", |_, _, _| {}).is_err());
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let store = StateStore::default();
        store
            .subscribe("app.theme", |_, _, _| panic!("listener bug"))
            .unwrap();
        let hits = count(&store, "app.theme", SubscribeOptions::default());

        assert!(store.set_key(keys::APP_THEME, keys::Theme::Auto));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("app.theme"), Some(json!("auto")));
    }

    #[test]
    fn listener_may_write_back_into_the_store() {
        let store = StateStore::default();
        let inner = store.clone();
        store
            .subscribe("ui.menuOpen", move |_, value, _| {
                if value == &json!(true) {
                    inner.set_key(keys::UI_ACTIVE_MODAL, None);
                    inner.set("ui.activeModal", "menu");
                }
            })
            .unwrap();
        let seen = record(&store, "ui.*");

        store.set("ui.menuOpen", true);
        assert_eq!(store.get("ui.activeModal"), Some(json!("menu")));
        let paths: Vec<String> = seen.lock().unwrap().iter().map(|(p, _, _)| p.clone()).collect();
        assert!(paths.contains(&"ui.menuOpen".to_string()));
        assert!(paths.contains(&"ui.activeModal".to_string()));
    }

    // ====================================================================
    // History
    // ====================================================================

    #[test]
    fn history_keeps_latest_entries() {
        let store = StateStore::default();
        for i in 0..150 {
            store.set("ui.scrollPosition", i);
        }

        let history = store.history();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].new_value, Some(json!(50)));
        assert_eq!(history[0].old_value, Some(json!(49)));
        assert_eq!(history[99].new_value, Some(json!(149)));
        assert!(history.iter().all(|e| e.action == Action::Set));

        store.clear_history();
        assert!(store.history().is_empty());
    }

    #[test]
    fn history_capacity_follows_config() {
        let store = StateStore::new(StoreConfig {
            history_capacity: 3,
            ..Default::default()
        });
        for i in 0..5 {
            store.set("ui.scrollPosition", i);
        }
        assert_eq!(store.history().len(), 3);
    }

    // ====================================================================
    // Loading tracker
    // ====================================================================

    #[tokio::test(start_paused = true)]
    async fn loading_tracks_duration_and_aggregate() {
        let store = StateStore::default();
        let flag = record(&store, "ui.isLoading");

        store.set_loading("gallery", true, "Loading works");
        store.set_loading("map", true, "Loading map");
        assert!(store.is_loading("gallery"));
        assert!(store.is_any_loading());
        assert_eq!(store.get_key(keys::UI_IS_LOADING), Some(true));

        tokio::time::sleep(Duration::from_millis(800)).await;
        store.set_loading("gallery", false, "");
        let entry = store.loading("gallery").unwrap();
        assert!(!entry.is_loading);
        assert_eq!(entry.duration, Duration::from_millis(800));
        assert_eq!(store.get_key(keys::UI_IS_LOADING), Some(true));

        store.set_loading("map", false, "");
        assert!(!store.is_any_loading());
        assert_eq!(store.get_key(keys::UI_IS_LOADING), Some(false));

        // Only the two aggregate transitions reach subscribers.
        let values: Vec<Value> = flag.lock().unwrap().iter().map(|(_, v, _)| v.clone()).collect();
        assert_eq!(values, [json!(true), json!(false)]);
        assert_eq!(store.loading_entries().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_notifications_carry_the_entry() {
        let store = StateStore::default();
        let seen = record(&store, "loading.*");

        store.set_loading("contact", true, "Sending");
        store.set_loading("contact", false, "Sent");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "loading.contact");
        assert_eq!(seen[0].1["isLoading"], json!(true));
        assert_eq!(seen[0].1["message"], json!("Sending"));
        assert_eq!(seen[1].1["isLoading"], json!(false));
        assert_eq!(seen[1].1["message"], json!("Sent"));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_force_clears_stuck_flag_once() {
        let store = StateStore::default();
        let seen = record(&store, "loading.tour");

        store.set_loading("tour", true, "Preparing tour");
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(store.is_loading("tour"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.is_loading("tour"));
        let entry = store.loading("tour").unwrap();
        assert!(entry.timed_out);
        assert_eq!(entry.duration, Duration::from_secs(30));
        assert_eq!(store.get_key(keys::UI_IS_LOADING), Some(false));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn turning_off_cancels_watchdog() {
        let store = StateStore::default();
        let seen = record(&store, "loading.tour");

        store.set_loading("tour", true, "");
        tokio::time::sleep(Duration::from_secs(10)).await;
        store.set_loading("tour", false, "");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!store.loading("tour").unwrap().timed_out);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reactivation_rearms_watchdog() {
        let store = StateStore::default();
        store.set_loading("tour", true, "");
        tokio::time::sleep(Duration::from_secs(20)).await;
        store.set_loading("tour", true, "still going");

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(store.is_loading("tour"));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!store.is_loading("tour"));
    }

    #[test]
    fn loading_without_runtime_has_no_watchdog() {
        let store = StateStore::default();
        store.set_loading("boot", true, "");
        assert!(store.is_loading("boot"));
        store.set_loading("boot", false, "");
        assert!(!store.is_any_loading());
    }

    // ====================================================================
    // Error tracker
    // ====================================================================

    #[tokio::test(start_paused = true)]
    async fn warning_expires() {
        let store = StateStore::default();
        store.set_error("network", "offline", Severity::Warning, Value::Null);
        assert!(store.has_error("network"));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(store.has_error("network"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.has_error("network"));
    }

    #[tokio::test(start_paused = true)]
    async fn error_severity_persists() {
        let store = StateStore::default();
        store.set_error("payment", "card declined", Severity::Error, json!({ "step": 2 }));
        tokio::time::sleep(Duration::from_secs(60)).await;

        let entry = store.get_error("payment").unwrap();
        assert_eq!(entry.message, "card declined");
        assert_eq!(entry.context, json!({ "step": 2 }));
        assert!(!entry.resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_an_entry_restarts_expiry() {
        let store = StateStore::default();
        store.set_error("network", "slow", Severity::Info, Value::Null);
        tokio::time::sleep(Duration::from_secs(6)).await;
        store.set_error("network", "offline", Severity::Warning, Value::Null);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.get_error("network").unwrap().message, "offline");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!store.has_error("network"));
    }

    #[tokio::test(start_paused = true)]
    async fn escalating_to_error_stops_expiry() {
        let store = StateStore::default();
        store.set_error("network", "flaky", Severity::Warning, Value::Null);
        store.set_error("network", "down", Severity::Error, Value::Null);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.has_error("network"));
    }

    #[tokio::test(start_paused = true)]
    async fn error_notifications_end_resolved() {
        let store = StateStore::default();
        let seen = record(&store, "error.network");

        store.set_error("network", "offline", Severity::Warning, Value::Null);
        tokio::time::sleep(Duration::from_secs(11)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1["resolved"], json!(false));
        assert_eq!(seen[0].1["severity"], json!("warning"));
        assert_eq!(seen[1].1["resolved"], json!(true));
        assert_eq!(seen[1].2.as_ref().unwrap()["resolved"], json!(false));
    }

    #[test]
    fn stale_expiry_leaves_replacement_alone() {
        let store = StateStore::default();
        store.set_error("network", "slow", Severity::Info, Value::Null);
        let stale = store.inner.errors.lock().unwrap()["network"].generation;
        store.set_error("network", "offline", Severity::Warning, Value::Null);

        store.expire_error("network", stale);
        assert_eq!(store.get_error("network").unwrap().message, "offline");

        let current = store.inner.errors.lock().unwrap()["network"].generation;
        store.expire_error("network", current);
        assert!(!store.has_error("network"));
    }

    #[test]
    fn clear_error_reports_presence() {
        let store = StateStore::default();
        store.set_error("form", "name required", Severity::Error, Value::Null);
        assert!(store.clear_error("form"));
        assert!(!store.clear_error("form"));
        assert!(!store.has_error("form"));
    }

    #[test]
    fn clear_all_errors_empties_tracker() {
        let store = StateStore::default();
        store.set_error("a", "one", Severity::Error, Value::Null);
        store.set_error("b", "two", Severity::Error, Value::Null);
        assert_eq!(store.errors().len(), 2);

        store.clear_all_errors();
        assert!(store.errors().is_empty());
    }

    #[test]
    fn error_values_keep_their_source_chain() {
        let store = StateStore::default();
        let err = StateError::Storage(StorageError::Backend("disk full".into()));
        store.set_error("save", &err, Severity::Error, Value::Null);

        let entry = store.get_error("save").unwrap();
        assert_eq!(entry.message, "storage error: disk full");
    }

    // ====================================================================
    // Persistence
    // ====================================================================

    struct BrokenStorage;

    impl KeyValueStorage for BrokenStorage {
        fn get_item(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Backend("unavailable".into()))
        }

        fn set_item(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Backend("quota exceeded".into()))
        }

        fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("unavailable".into()))
        }

        fn scan(&self, _prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
            Err(StorageError::Backend("unavailable".into()))
        }
    }

    #[test]
    fn persist_writes_json_under_namespaced_key() {
        let storage = Arc::new(MemoryStorage::new());
        let store = StateStore::with_storage(StoreConfig::default(), storage.clone());

        assert!(store.set_with("app.language", "ru", SetOptions::persisted()));
        assert!(store.set("ui.menuOpen", true));

        let raw = storage.get_item("gallery_state_app.language").unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&raw).unwrap(), json!("ru"));
        assert_eq!(storage.len(), 1);

        store.forget_persisted("app.language");
        assert!(storage.is_empty());
    }

    #[test]
    fn persisted_values_are_restored() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let store = StateStore::with_storage(StoreConfig::default(), storage.clone());
            store.set_with("app.language", "ru", SetOptions::persisted());
            store.set_with("user.preferences.reducedMotion", true, SetOptions::persisted());
        }
        storage.set_item("gallery_state_ui.menuOpen", b"{not json").unwrap();
        storage.set_item("other_state_app.theme", b"\"dark\"").unwrap();

        let store = StateStore::with_storage(StoreConfig::default(), storage);
        assert_eq!(store.get("app.language"), Some(json!("ru")));
        assert_eq!(store.get_key(keys::USER_REDUCED_MOTION), Some(true));
        assert_eq!(store.get_key(keys::UI_MENU_OPEN), Some(false));
        assert_eq!(store.get_key(keys::APP_THEME), Some(keys::Theme::Light));

        let history = store.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.action == Action::Restore));
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let store = StateStore::with_storage(StoreConfig::default(), Arc::new(BrokenStorage));
        assert!(store.set_with("app.language", "ru", SetOptions::persisted()));
        assert_eq!(store.get("app.language"), Some(json!("ru")));
        assert!(!store.has_error(STATE_ERROR_KEY));
        store.forget_persisted("app.language");
    }

    #[test]
    fn persist_without_storage_is_a_no_op() {
        let store = StateStore::default();
        assert!(store.set_with("app.language", "ru", SetOptions::persisted()));
    }

    // ====================================================================
    // Reset / snapshot
    // ====================================================================

    #[tokio::test(start_paused = true)]
    async fn reset_restores_initial_tree_and_cancels_timers() {
        let store = StateStore::default();
        let inner = store.clone();
        let hits = count(&store, "ui.isLoading", SubscribeOptions::default());

        store.set("app.language", "ru");
        store.set("gallery.page", 3);
        store.set_loading("tour", true, "");
        store.set_error("network", "offline", Severity::Warning, Value::Null);
        let seen = record(&store, "app.language");
        let errors = record(&inner, "error.*");

        store.reset();

        assert_eq!(store.state(), keys::initial_state(store.config()));
        assert!(!store.is_any_loading());
        assert!(store.loading_entries().is_empty());
        assert!(store.errors().is_empty());
        assert_eq!(store.history().last().unwrap().action, Action::Reset);

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("app.language".to_string(), json!("en"), Some(json!("ru")))]
        );
        assert_eq!(errors.lock().unwrap()[0].1["resolved"], json!(true));
        // true on set_loading, false on reset
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let listeners = store.listener_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!store.is_any_loading());
        assert_eq!(store.listener_count(), listeners);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_turns_active_loading_flags_off() {
        let store = StateStore::default();
        store.set_loading("done", true, "");
        store.set_loading("done", false, "");
        store.set_loading("map", true, "Loading map");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = store.subscribe_section(Section::Loading, move |path, value, _| {
            s.lock().unwrap().push((path.to_string(), value.clone()));
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        store.reset();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "loading.map");
        assert_eq!(seen[0].1["isLoading"], json!(false));
        assert_eq!(seen[0].1["timedOut"], json!(false));
        assert_eq!(seen[0].1["durationMs"], json!(2000));
    }

    #[test]
    fn reset_notifies_removed_paths_with_null() {
        let store = StateStore::default();
        store.set("gallery.page", 3);
        let seen = record(&store, "gallery.page");

        store.reset();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("gallery.page".to_string(), Value::Null, Some(json!(3)))]
        );
    }

    #[test]
    fn snapshot_serializes() {
        let store = StateStore::default();
        store.set("ui.menuOpen", true);
        store.set_loading("map", true, "Loading map");
        store.set_error("form", "invalid email", Severity::Error, Value::Null);

        let snap = store.snapshot();
        assert_eq!(snap.history_len, 2);
        assert!(snap.loading["map"].is_loading);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"]["ui"]["menuOpen"], json!(true));
        assert_eq!(json["loading"]["map"]["message"], json!("Loading map"));
        assert_eq!(json["errors"]["form"]["message"], json!("invalid email"));
        assert_eq!(json["historyLen"], json!(2));
        assert!(json["takenAt"].is_string());
    }

    #[test]
    fn stores_are_independent() {
        let a = StateStore::default();
        let b = StateStore::default();
        a.set("app.language", "ru");
        assert_eq!(b.get("app.language"), Some(json!("en")));
    }

    #[test]
    fn invalid_config_falls_back_to_defaults() {
        let config = StoreConfig {
            default_language: "fr".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            StateStore::try_new(config.clone()),
            Err(StateError::Config(_))
        ));

        let store = StateStore::new(config);
        assert_eq!(store.config(), &StoreConfig::default());
        assert_eq!(store.get("app.language"), Some(json!("en")));
        assert!(store.has_error(STATE_ERROR_KEY));
    }
}
