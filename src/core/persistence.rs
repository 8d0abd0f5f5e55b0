//! Background writer for conversation snapshots.
//!
//! The session enqueues a full snapshot after every change and moves on.
//! The writer task drains whatever has piled up, keeps only the newest
//! snapshot per conversation, and writes each with bounded retries. A
//! failed write is logged and dropped; the next snapshot carries the full
//! state again.
//!
//! When the channel is full, snapshots are coalesced into a shared overflow
//! list instead. Once the overflow is non-empty every later snapshot goes
//! there too, so overflow entries are always newer than anything still in
//! the channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

use crate::core::error::{MimicError, Result};
use crate::core::message::Conversation;
use crate::core::storage::Store;
use crate::core::transport::RetryPolicy;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub slug: String,
    pub conversation: Conversation,
}

impl Snapshot {
    fn same_target(&self, other: &Snapshot) -> bool {
        self.slug == other.slug && self.conversation.id == other.conversation.id
    }
}

type Overflow = Arc<Mutex<Vec<Snapshot>>>;

fn lock_overflow(overflow: &Overflow) -> MutexGuard<'_, Vec<Snapshot>> {
    overflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap, cloneable sending side of the queue.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<Snapshot>,
    overflow: Overflow,
}

impl PersistenceHandle {
    /// Queue a snapshot without waiting. Returns false only if the writer
    /// has stopped.
    pub fn enqueue(&self, snapshot: Snapshot) -> bool {
        let mut overflow = lock_overflow(&self.overflow);
        if !overflow.is_empty() && !self.tx.is_closed() {
            coalesce(&mut overflow, snapshot);
            return true;
        }
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(snapshot)) => {
                debug!(
                    conversation = %snapshot.conversation.id,
                    "persistence queue full, coalescing snapshot"
                );
                overflow.push(snapshot);
                true
            }
            Err(mpsc::error::TrySendError::Closed(snapshot)) => {
                warn!(
                    conversation = %snapshot.conversation.id,
                    "persistence writer has stopped, dropping snapshot"
                );
                false
            }
        }
    }
}

pub struct PersistenceQueue {
    handle: PersistenceHandle,
    writer: JoinHandle<()>,
}

impl PersistenceQueue {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(store: Store, retry: RetryPolicy) -> Self {
        Self::with_capacity(store, retry, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(store: Store, retry: RetryPolicy, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let overflow = Overflow::default();
        let writer = tokio::spawn(run_writer(store, rx, Arc::clone(&overflow), retry));
        Self {
            handle: PersistenceHandle { tx, overflow },
            writer,
        }
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Close the queue and wait for everything already queued to be written.
    ///
    /// Only returns once every other [`PersistenceHandle`] has been dropped.
    pub async fn shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.writer.await {
            error!(error = %e, "persistence writer panicked");
        }
    }
}

async fn run_writer(
    store: Store,
    mut rx: mpsc::Receiver<Snapshot>,
    overflow: Overflow,
    retry: RetryPolicy,
) {
    while let Some(first) = rx.recv().await {
        let mut pending = vec![first];
        while let Ok(next) = rx.try_recv() {
            coalesce(&mut pending, next);
        }
        drain_overflow(&overflow, &mut pending);
        write_all(&store, pending, &retry).await;
    }

    let mut pending = Vec::new();
    drain_overflow(&overflow, &mut pending);
    write_all(&store, pending, &retry).await;
    debug!("persistence writer stopped");
}

fn drain_overflow(overflow: &Overflow, pending: &mut Vec<Snapshot>) {
    let spilled = std::mem::take(&mut *lock_overflow(overflow));
    for snapshot in spilled {
        coalesce(pending, snapshot);
    }
}

async fn write_all(store: &Store, pending: Vec<Snapshot>, retry: &RetryPolicy) {
    for snapshot in pending {
        if let Err(e) = write_snapshot(store, &snapshot, retry).await {
            error!(error = %e, "giving up on conversation snapshot");
        }
    }
}

/// Replace an older snapshot of the same conversation in place, keeping
/// first-seen order across conversations.
fn coalesce(pending: &mut Vec<Snapshot>, next: Snapshot) {
    match pending.iter_mut().find(|queued| queued.same_target(&next)) {
        Some(queued) => *queued = next,
        None => pending.push(next),
    }
}

async fn write_snapshot(store: &Store, snapshot: &Snapshot, retry: &RetryPolicy) -> Result<()> {
    let conversation_id = snapshot.conversation.id.clone();
    RetryIf::spawn(
        retry.strategy(),
        || {
            let store = store.clone();
            let snapshot = snapshot.clone();
            let conversation_id = conversation_id.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    store.save_conversation(&snapshot.slug, &snapshot.conversation)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(MimicError::Persistence {
                        conversation_id,
                        reason: e.to_string(),
                    })
                })
            }
        },
        |err: &MimicError| {
            warn!(error = %err, "conversation write failed");
            true
        },
    )
    .await
    .map_err(|e| match e {
        MimicError::Persistence { .. } => e,
        other => MimicError::Persistence {
            conversation_id,
            reason: other.to_string(),
        },
    })
}
