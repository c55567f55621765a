//! Change notification bus.
//!
//! Listeners register a [`Pattern`](crate::path::Pattern); the bus keeps
//! them in a [`Trie`] and delivers every change synchronously on the
//! calling thread. Handlers run without any store lock held, so a handler
//! may read or write the store; such nested writes are delivered
//! depth-first before the outer delivery continues.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{error, warn};

use crate::trie::Trie;

/// Callback invoked with `(path, new_value, old_value)`.
pub type ChangeHandler = Arc<dyn Fn(&str, &Value, Option<&Value>) + Send + Sync>;

/// Nesting depth past which a delivery chain is reported as a likely
/// subscriber cycle. Delivery is not interrupted.
pub const DEEP_DELIVERY_WARNING: usize = 32;

thread_local! {
    static DELIVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone)]
struct Listener {
    id: SubscriptionId,
    handler: ChangeHandler,
}

pub struct Bus {
    listeners: Trie<Listener>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Trie::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register `handler` under an already validated pattern.
    ///
    /// Returns the handle plus the handler as registered (wrapped for
    /// `once`), so callers can invoke it directly for immediate delivery.
    pub fn subscribe(
        self: &Arc<Self>,
        pattern: &str,
        handler: ChangeHandler,
        once: bool,
    ) -> (Subscription, ChangeHandler) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            bus: Arc::downgrade(self),
            pattern: pattern.to_string(),
            id,
        };

        let handler = if once {
            once_wrapper(subscription.clone(), handler)
        } else {
            handler
        };
        self.listeners.insert(
            pattern,
            Listener {
                id,
                handler: handler.clone(),
            },
        );
        (subscription, handler)
    }

    fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> bool {
        self.listeners.remove(pattern, |l| l.id == id) > 0
    }

    /// Deliver a change to every matching listener.
    pub fn deliver(&self, path: &str, value: &Value, old_value: Option<&Value>) {
        let listeners = self.listeners.match_path(path);
        if listeners.is_empty() {
            return;
        }

        let depth = DELIVERY_DEPTH.with(|d| {
            d.set(d.get() + 1);
            d.get()
        });
        if depth == DEEP_DELIVERY_WARNING {
            warn!(
                "change delivery for {path} is nested {depth} levels deep; \
                 subscribers may be feeding each other"
            );
        }

        for listener in listeners {
            invoke(listener.id, &listener.handler, path, value, old_value);
        }

        DELIVERY_DEPTH.with(|d| d.set(d.get() - 1));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Call one handler, containing any panic it raises.
pub(crate) fn invoke(
    id: SubscriptionId,
    handler: &ChangeHandler,
    path: &str,
    value: &Value,
    old_value: Option<&Value>,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(path, value, old_value)));
    if let Err(payload) = result {
        error!(
            "listener {} panicked while handling {path}: {}",
            id.0,
            panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn once_wrapper(subscription: Subscription, handler: ChangeHandler) -> ChangeHandler {
    let fired = AtomicBool::new(false);
    Arc::new(move |path: &str, value: &Value, old: Option<&Value>| {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        subscription.clone().unsubscribe();
        handler(path, value, old);
    })
}

/// Handle returned by `subscribe`. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    bus: Weak<Bus>,
    pattern: String,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.unsubscribe(&self.pattern, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("id", &self.id)
            .finish()
    }
}
