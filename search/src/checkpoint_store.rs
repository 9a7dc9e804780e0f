//! Durable checkpoint storage seam.
//!
//! The engine only ever hands the store opaque, self-validating bytes. A
//! store that returns garbage is caught by the reader, not trusted.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::checkpoint::CheckpointId;
use crate::session::SessionId;

/// Failure of the storage backend itself (not of checkpoint content).
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("checkpoint {0} not found")]
    NotFound(CheckpointId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store for checkpoint bytes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store `bytes` under `id`, replacing any previous value. A successful
    /// return means the bytes are durable.
    async fn put(&self, id: CheckpointId, bytes: Vec<u8>) -> Result<(), CheckpointStoreError>;

    async fn get(&self, id: CheckpointId) -> Result<Vec<u8>, CheckpointStoreError>;

    /// Sequence numbers stored for `session`, ascending.
    async fn list(&self, session: SessionId) -> Result<Vec<u64>, CheckpointStoreError>;

    /// Remove one checkpoint. Removing an absent id is not an error.
    async fn remove(&self, id: CheckpointId) -> Result<(), CheckpointStoreError>;

    /// Keep the newest `retention` checkpoints of `session` and drop the rest.
    ///
    /// Returns the number removed.
    async fn prune_older_than_retention(
        &self,
        session: SessionId,
        retention: usize,
    ) -> Result<usize, CheckpointStoreError> {
        let seqs = self.list(session).await?;
        let excess = seqs.len().saturating_sub(retention.max(1));
        for &seq in &seqs[..excess] {
            self.remove(CheckpointId { session, seq }).await?;
        }
        Ok(excess)
    }
}

/// In-process checkpoint store with failure injection for tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<BTreeMap<CheckpointId, Vec<u8>>>,
    failing_puts: AtomicU32,
    unavailable: Mutex<HashSet<SessionId>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` puts fail.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Make every put for `session` fail until [`Self::heal`] is called.
    pub fn fail_session(&self, session: SessionId) {
        self.unavailable.lock().insert(session);
    }

    pub fn heal(&self, session: SessionId) {
        self.unavailable.lock().remove(&session);
    }

    /// Flip one byte of a stored checkpoint. Returns `false` if absent.
    pub fn corrupt(&self, id: CheckpointId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(bytes) if !bytes.is_empty() => {
                let mid = bytes.len() / 2;
                bytes[mid] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    /// Raw bytes, bypassing the async interface.
    #[must_use]
    pub fn raw(&self, id: CheckpointId) -> Option<Vec<u8>> {
        self.entries.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, id: CheckpointId, bytes: Vec<u8>) -> Result<(), CheckpointStoreError> {
        if self.unavailable.lock().contains(&id.session) {
            return Err(CheckpointStoreError::Unavailable(format!(
                "session {} is failing writes",
                id.session
            )));
        }
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CheckpointStoreError::Unavailable(
                "injected write failure".to_owned(),
            ));
        }
        self.entries.lock().insert(id, bytes);
        Ok(())
    }

    async fn get(&self, id: CheckpointId) -> Result<Vec<u8>, CheckpointStoreError> {
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(CheckpointStoreError::NotFound(id))
    }

    async fn list(&self, session: SessionId) -> Result<Vec<u64>, CheckpointStoreError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|id| id.session == session)
            .map(|id| id.seq)
            .collect())
    }

    async fn remove(&self, id: CheckpointId) -> Result<(), CheckpointStoreError> {
        self.entries.lock().remove(&id);
        Ok(())
    }
}
