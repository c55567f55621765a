//! Gallery State: reactive, path-keyed application state.
//!
//! The site's UI state lives in one nested JSON tree addressed by dot
//! paths (`app.language`, `ui.scrollPosition`). Around it the store keeps:
//!
//! - a loading tracker (`set_loading`) with timing and a watchdog that
//!   force-clears flags left on too long;
//! - an error tracker (`set_error`) with severities, where warnings and
//!   info entries expire on their own;
//! - a subscription bus with exact, `*` and trailing `**` patterns;
//! - a bounded history of transitions.
//!
//! ```ignore
//! let store = StateStore::new(StoreConfig::default());
//!
//! let sub = store.subscribe("ui.*", |path, value, _old| {
//!     println!("{path} -> {value}");
//! })?;
//!
//! store.set("ui.menuOpen", true);
//! store.set_key(keys::APP_THEME, Theme::Dark);
//! store.set_loading("gallery", true, "Loading works");
//!
//! sub.unsubscribe();
//! ```
//!
//! Timers run on the ambient tokio runtime. Without one the trackers
//! still work; flags and warnings just never clear themselves.

pub mod bus;
pub mod config;
pub mod error;
pub mod error_state;
pub mod history;
pub mod keys;
pub mod loading;
pub mod middleware;
pub mod path;
pub mod store;
pub mod timer;
pub mod tree;
pub mod validate;

mod trie;

pub use bus::{Subscription, SubscriptionId};
pub use config::StoreConfig;
pub use error::StateError;
pub use error_state::{ErrorEntry, ErrorInput, Severity};
pub use history::{Action, HistoryEntry};
pub use keys::{Key, Section, Theme};
pub use loading::LoadingEntry;
pub use middleware::{ChangeLogger, Middleware};
pub use path::{Pattern, StatePath};
pub use store::{STATE_ERROR_KEY, SetOptions, Snapshot, StateStore, SubscribeOptions};
