//! Independent load/live state machines for a document's metadata and
//! data halves (§4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::error::StateCoreError;
use crate::model::{LiveState, LoadState, SyncStatus};

type StatusCb = dyn Fn(&SyncStatus) + Send + Sync;

/// One load/live state machine. A document holds two independent
/// instances: one for metadata, one for data.
pub struct StatusMachine {
    tx: watch::Sender<SyncStatus>,
    subscribers: RwLock<Vec<(u64, Arc<StatusCb>)>>,
    next_id: AtomicU64,
}

impl StatusMachine {
    /// Start in the default `{UNLOADED, DISCONNECTED}` state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self {
            tx,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current status snapshot.
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Apply a new status, always notifying subscribers — transitions
    /// happen only through this method (and its `update_*` specialised
    /// callers), never by subscribers mutating state directly.
    pub fn transition(&self, status: SyncStatus) {
        let _ = self.tx.send(status.clone());
        let subs: Vec<Arc<StatusCb>> = self
            .subscribers
            .read()
            .expect("status subscribers lock poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in subs {
            cb(&status);
        }
    }

    /// Move the load phase, preserving the current live phase.
    pub fn set_load(&self, load: LoadState, error: Option<String>) {
        let mut status = self.current();
        status.load = load;
        status.error = error;
        self.transition(status);
    }

    /// Move the live phase, preserving the current load phase.
    pub fn set_live(&self, live: LiveState) {
        let mut status = self.current();
        status.live = live;
        self.transition(status);
    }

    /// Subscribe to every status transition.
    pub fn on_status_change(&self, callback: Arc<StatusCb>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .expect("status subscribers lock poisoned")
            .push((id, callback));
        id
    }

    /// Unsubscribe; idempotent.
    pub fn off_status_change(&self, id: u64) {
        self.subscribers
            .write()
            .expect("status subscribers lock poisoned")
            .retain(|(slot_id, _)| *slot_id != id);
    }

    /// Resolve immediately if already `LOADED`; fail immediately if
    /// `ERROR`; otherwise wait for the first terminal transition.
    /// Dropping the returned future removes its transient watch
    /// subscriber automatically, satisfying the cancel-safety
    /// requirement without extra bookkeeping.
    pub async fn wait_for_load(&self) -> Result<(), StateCoreError> {
        let mut rx = self.tx.subscribe();
        loop {
            let status = rx.borrow().clone();
            match status.load {
                LoadState::Loaded => return Ok(()),
                LoadState::Error => {
                    return Err(StateCoreError::LoadError(
                        status.error.unwrap_or_else(|| "unknown load error".into()),
                    ))
                }
                LoadState::Unloaded | LoadState::Loading => {}
            }
            if rx.changed().await.is_err() {
                return Err(StateCoreError::LoadError("status channel closed".into()));
            }
        }
    }
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}
