//! Store persistence worker
//!
//! Each persisted store owns one background task that mirrors committed
//! snapshots to durable storage. The task is the store's only writer, so
//! snapshots reach storage in commit order; bursts of commits are coalesced
//! into a single write of the newest snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::storage::{SharedStorage, StorageMap};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

enum PersistCommand {
    /// Persist a complete snapshot
    Write(Value),
    /// Acknowledge once every earlier write has been attempted
    Flush(oneshot::Sender<()>),
    /// Finish outstanding writes and stop
    Shutdown(oneshot::Sender<()>),
}

// ----------------------------------------------------------------------------
// Persistence Handle
// ----------------------------------------------------------------------------

/// Sending side of a store's persistence worker
#[derive(Debug)]
pub(crate) struct PersistenceHandle {
    store: String,
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistenceHandle {
    /// Spawn the worker for `store`, writing under `key`
    pub(crate) fn spawn(
        store: String,
        key: String,
        storage: SharedStorage,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = PersistenceTask {
            store: store.clone(),
            key,
            storage,
            degraded,
        };
        tokio::spawn(task.run(rx));
        Self { store, tx }
    }

    /// Queue a snapshot for writing
    pub(crate) fn write(&self, snapshot: Value) {
        if self.tx.send(PersistCommand::Write(snapshot)).is_err() {
            warn!(
                "Persistence worker for store '{}' has stopped, snapshot kept in memory only",
                self.store
            );
        }
    }

    /// Wait until every queued snapshot has been handed to storage
    pub(crate) async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Write outstanding snapshots and stop the worker
    pub(crate) async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Persistence Task
// ----------------------------------------------------------------------------

struct PersistenceTask {
    store: String,
    key: String,
    storage: SharedStorage,
    degraded: Arc<AtomicBool>,
}

impl PersistenceTask {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
        debug!("Persistence worker for store '{}' started", self.store);

        while let Some(command) = rx.recv().await {
            let mut latest = None;
            let mut acks = Vec::new();
            let mut stop = false;

            Self::absorb(command, &mut latest, &mut acks, &mut stop);
            while let Ok(command) = rx.try_recv() {
                Self::absorb(command, &mut latest, &mut acks, &mut stop);
            }

            if let Some(snapshot) = latest {
                self.write(snapshot).await;
            }
            for ack in acks {
                let _ = ack.send(());
            }
            if stop {
                break;
            }
        }

        debug!("Persistence worker for store '{}' stopped", self.store);
    }

    fn absorb(
        command: PersistCommand,
        latest: &mut Option<Value>,
        acks: &mut Vec<oneshot::Sender<()>>,
        stop: &mut bool,
    ) {
        match command {
            PersistCommand::Write(snapshot) => *latest = Some(snapshot),
            PersistCommand::Flush(ack) => acks.push(ack),
            PersistCommand::Shutdown(ack) => {
                acks.push(ack);
                *stop = true;
            }
        }
    }

    async fn write(&self, snapshot: Value) {
        let mut items = StorageMap::new();
        items.insert(self.key.clone(), snapshot);

        match self.storage.set(items).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("Store '{}' is persisting again", self.store);
                }
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                warn!(
                    "Failed to persist store '{}', continuing in memory: {}",
                    self.store, e
                );
            }
        }
    }
}
