//! `DirCheckpointStore`: checkpoints as files on local disk.
//!
//! # Layout
//!
//! ```text
//! <root>/<session-uuid>/<seq:020>.ptck
//! ```
//!
//! Writes go to a hidden temp file in the same directory, are synced, and
//! then renamed over the target, so a reader sees either the old file, the
//! new file, or no file. A torn write that somehow survives is still caught
//! by the checkpoint reader's footer and chain checks.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use patchtree_search::checkpoint::CheckpointId;
use patchtree_search::checkpoint_store::{CheckpointStore, CheckpointStoreError};
use patchtree_search::session::SessionId;

/// Checkpoint file extension.
pub const CHECKPOINT_EXTENSION: &str = "ptck";

const TEMP_PREFIX: &str = ".tmp_";

/// Directory-backed [`CheckpointStore`]. Filesystem calls run on the blocking pool.
#[derive(Debug, Clone)]
pub struct DirCheckpointStore {
    root: PathBuf,
}

impl DirCheckpointStore {
    /// Store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn session_dir(&self, session: SessionId) -> PathBuf {
        self.root.join(session.to_string())
    }

    #[must_use]
    pub fn path_for(&self, id: CheckpointId) -> PathBuf {
        self.session_dir(id.session)
            .join(format!("{:020}.{CHECKPOINT_EXTENSION}", id.seq))
    }
}

#[async_trait]
impl CheckpointStore for DirCheckpointStore {
    async fn put(&self, id: CheckpointId, bytes: Vec<u8>) -> Result<(), CheckpointStoreError> {
        let path = self.path_for(id);
        blocking(move || write_atomic(&path, &bytes)).await
    }

    async fn get(&self, id: CheckpointId) -> Result<Vec<u8>, CheckpointStoreError> {
        let path = self.path_for(id);
        blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointStoreError::NotFound(id))
            }
            Err(err) => Err(err.into()),
        })
        .await
    }

    async fn list(&self, session: SessionId) -> Result<Vec<u64>, CheckpointStoreError> {
        let dir = self.session_dir(session);
        blocking(move || list_seqs(&dir)).await
    }

    async fn remove(&self, id: CheckpointId) -> Result<(), CheckpointStoreError> {
        let path = self.path_for(id);
        blocking(move || match std::fs::remove_file(&path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CheckpointStoreError>
where
    F: FnOnce() -> Result<T, CheckpointStoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckpointStoreError::Unavailable(format!("blocking task failed: {e}")))?
}

/// Write bytes to a path via synced temp file + rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CheckpointStoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| CheckpointStoreError::Unavailable("no parent directory".into()))?;
    std::fs::create_dir_all(dir)?;

    let temp_name = format!(
        "{TEMP_PREFIX}{}",
        path.file_name().unwrap_or_default().to_string_lossy()
    );
    let temp_path = dir.join(temp_name);

    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Sequence numbers of the checkpoint files in `dir`, ascending.
fn list_seqs(dir: &Path) -> Result<Vec<u64>, CheckpointStoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut seqs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // Skip temp files left by an interrupted write_atomic.
        if name.starts_with(TEMP_PREFIX) {
            continue;
        }
        let seq = name
            .strip_suffix(CHECKPOINT_EXTENSION)
            .and_then(|stem| stem.strip_suffix('.'))
            .and_then(|stem| stem.parse::<u64>().ok());
        if let Some(seq) = seq {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}
