use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

/// Soft watchdog for an operation that can't be cancelled safely.
///
/// If the guard is still held when `threshold` elapses, a warning with the
/// diagnostic context is logged. The guarded work itself is never touched.
/// Dropping the guard releases it, so every exit path clears the timer.
#[must_use = "the guard is released as soon as it is dropped"]
pub struct TimeoutGuard {
    timer: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// Must be called from within a tokio runtime. `context` is only
    /// evaluated if the timer fires.
    pub fn start<F>(message: &'static str, threshold: Duration, context: F) -> Self
    where
        F: FnOnce() -> Value + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            flag.store(true, Ordering::SeqCst);
            warn!(
                threshold_ms = threshold.as_millis() as u64,
                context = %context(),
                "{}",
                message
            );
        });

        TimeoutGuard {
            timer: Some(timer),
            fired,
        }
    }

    /// Whether the threshold passed while the guard was held.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn release(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.release();
    }
}
