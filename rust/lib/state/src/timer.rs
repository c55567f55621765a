use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a one-shot timer scheduled with [`schedule`].
///
/// Dropping the handle does not cancel the timer; call [`TimerHandle::cancel`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Run `fire` once after `delay` on the ambient tokio runtime, unless
/// cancelled first.
///
/// Returns `None` when called outside a runtime; the caller then simply
/// has no timer.
pub fn schedule<F>(delay: Duration, label: &str, fire: F) -> Option<TimerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("no tokio runtime, {label} timer not scheduled");
        return None;
    };

    let token = CancellationToken::new();
    let cancel = token.clone();
    runtime.spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => fire(),
        }
    });
    Some(TimerHandle { token })
}
