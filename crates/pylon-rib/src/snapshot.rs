//! Snapshot publication -- the one-way cell committed state flows through.
//!
//! Wraps a `tokio::sync::watch` channel. Callback watchers are immediately
//! replayed the latest snapshot, so a late subscriber misses intervening
//! history but never current state. Downstream consumers (the xDS
//! translator, the admin API) read through this cell and never touch the
//! RIB task.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::RibState;

/// Publish/notify cell for committed snapshots.
#[derive(Debug)]
pub struct SnapshotCell {
    tx: watch::Sender<Option<Arc<RibState>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        SnapshotCell { tx }
    }

    /// Publish a snapshot, waking every watcher.
    pub fn set(&self, state: Arc<RibState>) {
        self.tx.send_replace(Some(state));
    }

    /// Latest published snapshot, if any commit has happened yet.
    pub fn get(&self) -> Option<Arc<RibState>> {
        self.tx.borrow().clone()
    }

    /// Raw receiver for async consumers that drive their own loop.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RibState>>> {
        self.tx.subscribe()
    }

    /// Invoke `f` on the current snapshot (replay) and on every subsequent
    /// publication until the returned guard is dropped. Requires a running
    /// tokio runtime.
    pub fn watch<F>(&self, mut f: F) -> WatchGuard
    where
        F: FnMut(Arc<RibState>) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            // borrow_and_update marks the current value seen, so the replay
            // is never delivered twice.
            let current = rx.borrow_and_update().clone();
            if let Some(state) = current {
                f(state);
            }
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                if let Some(state) = next {
                    f(state);
                }
            }
        });
        WatchGuard { handle }
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        SnapshotCell::new()
    }
}

/// Subscription handle returned by [`SnapshotCell::watch`]. Dropping it
/// unsubscribes the callback.
#[derive(Debug)]
pub struct WatchGuard {
    handle: JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
