use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Inner, RefreshOutcome};

/// Debounced backstop refetch.
///
/// At most one timer is pending: scheduling aborts the previous timer and
/// starts a new one. When it fires the collection is re-read and swapped
/// in, unless local mutations are in flight.
pub struct RefetchScheduler {
    delay: Option<Duration>,
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RefetchScheduler {
    pub(super) fn new(inner: Arc<Inner>, delay: Option<Duration>) -> Self {
        Self {
            delay,
            inner,
            timer: Mutex::new(None),
        }
    }

    /// (Re)start the timer. Outside a tokio runtime this is a no-op.
    pub fn schedule(&self) {
        let Some(delay) = self.delay else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(resource = %self.inner.resource, "No runtime, skipping backstop refetch");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.ledger.lock().has_pending() {
                debug!(resource = %inner.resource, "Mutations in flight, backstop refetch skipped");
                return;
            }
            match inner.fetch_authoritative().await {
                Ok(RefreshOutcome::Applied(count)) => {
                    info!(resource = %inner.resource, count, "Backstop refetch applied");
                }
                Ok(RefreshOutcome::Deferred) => {
                    debug!(resource = %inner.resource, "Backstop refetch raced a mutation, discarded");
                }
                Err(e) => {
                    warn!(resource = %inner.resource, error = %e, "Backstop refetch failed");
                }
            }
        }));
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RefetchScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
