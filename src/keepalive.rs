//! Keep-alive ticker.
//!
//! Sends a periodic no-op to the remote session so it is not torn down for
//! idleness. A missed keep-alive is not fatal: errors are logged and the
//! ticker carries on. Persistent failure shows up as a disconnect event.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sdk::AvatarHandle;

pub struct KeepAliveTicker {
    cancel: CancellationToken,
}

impl KeepAliveTicker {
    /// Start ticking every `interval`; the first tick fires after one full
    /// interval. Stops when `parent` is cancelled or on [`stop`](Self::stop).
    pub fn spawn(
        handle: Arc<dyn AvatarHandle>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match handle.keep_alive().await {
                            Ok(()) => debug!(session = handle.session_id(), "Keep-alive sent"),
                            Err(e) => warn!(session = handle.session_id(), "Keep-alive failed: {:#}", e),
                        }
                    }
                }
            }
        });
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KeepAliveTicker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
