// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graceful-shutdown signalling for the worker loop.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle signalling that the worker should stop.
///
/// Internally a `watch` channel over a single stop flag. Requesting shutdown
/// publishes `true`; clones either poll the flag between pipeline steps or
/// race [`requested`](Self::requested) against a long-running call inside
/// `select!`. Once requested, shutdown is permanent.
#[derive(Clone, Debug)]
pub struct Shutdown {
    stop: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// A handle with shutdown not yet requested.
    #[must_use]
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop: Arc::new(stop),
        }
    }

    /// Request shutdown. Any clone may call this, any number of times.
    pub fn request(&self) {
        self.stop.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Waits until shutdown is requested; resolves immediately if it
    /// already was.
    pub async fn requested(&self) {
        let mut watcher = self.stop.subscribe();
        // The sender lives inside `self`, so the channel cannot close while
        // this borrow is alive.
        let _ = watcher.wait_for(|stop| *stop).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
