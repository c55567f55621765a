//! Typed keys for the well-known state slices.
//!
//! Arbitrary dot paths remain available through `StateStore::get`/`set`;
//! these constants give the slices the site actually uses a fixed Rust type
//! so callers don't re-spell paths or re-parse JSON by hand.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::StoreConfig;

/// Top-level slice of the state tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    App,
    Ui,
    User,
    Performance,
    /// Per-key loading entries (`loading.<key>`), notification only.
    Loading,
    /// Per-key error entries (`error.<key>`), notification only.
    Error,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::App => "app",
            Section::Ui => "ui",
            Section::User => "user",
            Section::Performance => "performance",
            Section::Loading => "loading",
            Section::Error => "error",
        }
    }

    /// Pattern covering the whole section.
    pub fn pattern(&self) -> String {
        format!("{}.**", self.as_str())
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state path bound to the Rust type stored there.
pub struct Key<T> {
    path: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(path: &'static str) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    Auto,
}

pub const APP_LANGUAGE: Key<String> = Key::new("app.language");
pub const APP_THEME: Key<Theme> = Key::new("app.theme");

pub const UI_IS_LOADING: Key<bool> = Key::new("ui.isLoading");
pub const UI_IS_ONLINE: Key<bool> = Key::new("ui.isOnline");
pub const UI_SCROLL_POSITION: Key<f64> = Key::new("ui.scrollPosition");
pub const UI_ACTIVE_MODAL: Key<Option<String>> = Key::new("ui.activeModal");
pub const UI_MENU_OPEN: Key<bool> = Key::new("ui.menuOpen");

pub const USER_REDUCED_MOTION: Key<bool> = Key::new("user.preferences.reducedMotion");

pub const PERFORMANCE_CONNECTION_TYPE: Key<Option<String>> =
    Key::new("performance.connectionType");

/// The tree a fresh (or reset) store starts from.
pub fn initial_state(config: &StoreConfig) -> Value {
    json!({
        "app": {
            "language": config.default_language,
            "theme": Theme::Light,
        },
        "ui": {
            "isLoading": false,
            "isOnline": true,
            "scrollPosition": 0.0,
            "activeModal": null,
            "menuOpen": false,
        },
        "user": {
            "preferences": {
                "reducedMotion": false,
            },
        },
        "performance": {
            "connectionType": null,
        },
    })
}
