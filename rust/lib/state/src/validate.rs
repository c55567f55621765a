use std::sync::Arc;

use serde_json::Value;

use crate::config::StoreConfig;
use crate::keys::{APP_LANGUAGE, APP_THEME, Theme};

/// Per-path write check.
///
/// `Ok(true)` accepts, `Ok(false)` rejects the value, `Err` means the
/// check itself could not run.
pub type Validator = Arc<dyn Fn(&Value) -> Result<bool, String> + Send + Sync>;

/// Validators installed on every new store.
pub fn builtin(config: &StoreConfig) -> Vec<(&'static str, Validator)> {
    let languages = config.supported_languages.clone();
    let language: Validator = Arc::new(move |value| {
        Ok(value
            .as_str()
            .is_some_and(|lang| languages.iter().any(|l| l == lang)))
    });

    let theme: Validator =
        Arc::new(|value| Ok(serde_json::from_value::<Theme>(value.clone()).is_ok()));

    vec![(APP_LANGUAGE.path(), language), (APP_THEME.path(), theme)]
}
