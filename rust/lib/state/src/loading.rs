use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::timer::TimerHandle;

/// State of one named loading flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingEntry {
    pub is_loading: bool,
    pub message: String,
    /// Wall-clock time of the latest activation.
    pub start_time: Option<DateTime<Utc>>,
    /// Length of the latest activation, frozen when the flag turns off.
    #[serde(rename = "durationMs", serialize_with = "as_millis")]
    pub duration: Duration,
    /// The latest activation was ended by the watchdog, not the caller.
    pub timed_out: bool,
    #[serde(skip)]
    pub(crate) started: Option<Instant>,
}

impl Default for LoadingEntry {
    fn default() -> Self {
        Self {
            is_loading: false,
            message: String::new(),
            start_time: None,
            duration: Duration::ZERO,
            timed_out: false,
            started: None,
        }
    }
}

impl LoadingEntry {
    pub(crate) fn start(&mut self, message: String) {
        self.is_loading = true;
        self.message = message;
        self.start_time = Some(Utc::now());
        self.started = Some(Instant::now());
        self.duration = Duration::ZERO;
        self.timed_out = false;
    }

    pub(crate) fn finish(&mut self, message: String, timed_out: bool) {
        if self.is_loading {
            self.duration = self.started.map(|s| s.elapsed()).unwrap_or_default();
        }
        self.is_loading = false;
        self.message = message;
        self.timed_out = timed_out;
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Tracker slot: the entry plus its watchdog.
#[derive(Debug, Default)]
pub(crate) struct LoadingSlot {
    pub entry: LoadingEntry,
    pub watchdog: Option<TimerHandle>,
    pub generation: u64,
}

impl LoadingSlot {
    pub fn disarm(&mut self) {
        if let Some(timer) = self.watchdog.take() {
            timer.cancel();
        }
    }
}
