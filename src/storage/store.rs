//! Document storage backend of a storage server.
//!
//! The [`DocStore`] trait is the seam between the protocol handlers and
//! the bytes on disk; [`DiskStore`] is the production implementation. A
//! file is identified by its flat name (which may contain `/` for
//! nesting); its on-disk location is `<folder>/<name>` relative to the
//! server's private root, tracked by an in-memory index so that MOVE can
//! relocate files without renaming their identity.
//!
//! Layout per storage server id:
//!
//! - `<storage-root>/<ss-id>/...`: the live file tree
//! - `<storage-root>/<ss-id>/checkpoints/<name>.<tag>`: checkpoint copies
//! - `<backup-root>/<ss-id>/<name>`: the single undo snapshot per file,
//!   holding the bytes as of immediately before the last successful commit
//!
//! Every content replacement goes through write-to-temp plus rename, so a
//! reader never observes a half-written file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::ops::{OpError, OpResult, Status};
use crate::storage::sentence;

/// Directory under the storage root reserved for checkpoint copies.
const CHECKPOINT_DIR: &str = "checkpoints";

/// Storage operations required by the control and data handlers.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Creates an empty file (and its empty undo backup). Parent
    /// directories are created for nested names.
    async fn create(&self, name: &str) -> OpResult<()>;

    /// Removes a file, its backup and its checkpoints.
    async fn delete(&self, name: &str) -> OpResult<()>;

    /// Full contents of a file.
    async fn read(&self, name: &str) -> OpResult<Vec<u8>>;

    /// Atomically replaces a file's contents.
    async fn replace(&self, name: &str, bytes: &[u8]) -> OpResult<()>;

    /// Whether the file is known to this store.
    async fn exists(&self, name: &str) -> bool;

    /// Creates a folder subtree under the server root.
    async fn create_folder(&self, folder: &str) -> OpResult<()>;

    /// Moves a file into `folder` (empty means the root), creating the
    /// folder if needed. The file's name is unchanged.
    async fn relocate(&self, name: &str, folder: &str) -> OpResult<()>;

    /// Copies the file's current bytes to the checkpoint path for `tag`,
    /// overwriting any previous copy under the same tag. Returns the
    /// recorded size.
    async fn checkpoint(&self, name: &str, tag: &str) -> OpResult<u64>;

    /// Contents of a checkpoint copy.
    async fn read_checkpoint(&self, name: &str, tag: &str) -> OpResult<Vec<u8>>;

    /// Atomically replaces the file with the checkpoint bytes.
    async fn revert(&self, name: &str, tag: &str) -> OpResult<()>;

    /// Contents of the undo snapshot.
    async fn read_backup(&self, name: &str) -> OpResult<Vec<u8>>;

    /// Atomically replaces the undo snapshot.
    async fn replace_backup(&self, name: &str, bytes: &[u8]) -> OpResult<()>;

    /// `(size, words, chars)` of the file's current contents.
    async fn stats(&self, name: &str) -> OpResult<(u64, u64, u64)>;

    /// Names of every file found under the live tree, for registration.
    async fn scan(&self) -> OpResult<Vec<String>>;
}

/// Rejects names that would escape the server root.
pub fn validate_name(name: &str) -> OpResult<()> {
    if name.is_empty() {
        return Err(OpError::invalid("empty file name"));
    }
    let escapes = Path::new(name)
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if escapes || name.starts_with('/') {
        return Err(OpError::invalid(format!("illegal file name '{name}'")));
    }
    Ok(())
}

/// Disk-backed [`DocStore`].
pub struct DiskStore {
    root: PathBuf,
    backup_root: PathBuf,
    /// flat name -> path relative to `root`
    index: Mutex<HashMap<String, PathBuf>>,
    temp_seq: AtomicU64,
}

impl DiskStore {
    /// Opens (creating if needed) the per-server directories and indexes
    /// the files already present, so a restarted server re-advertises its
    /// tree.
    pub fn open(storage_root: &Path, backup_root: &Path, ss_id: &str) -> std::io::Result<Self> {
        let root = storage_root.join(ss_id);
        let backup_root = backup_root.join(ss_id);
        std::fs::create_dir_all(root.join(CHECKPOINT_DIR))?;
        std::fs::create_dir_all(&backup_root)?;

        let mut index = HashMap::new();
        collect_files(&root, &root, &mut index)?;
        debug!("indexed {} existing files under {}", index.len(), root.display());
        Ok(Self { root, backup_root, index: Mutex::new(index), temp_seq: AtomicU64::new(0) })
    }

    fn resolve(&self, name: &str) -> OpResult<PathBuf> {
        let index = self.index.lock().expect("store index poisoned");
        index
            .get(name)
            .map(|rel| self.root.join(rel))
            .ok_or_else(|| OpError::file_not_found(name))
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.backup_root.join(name)
    }

    fn checkpoint_path(&self, name: &str, tag: &str) -> PathBuf {
        self.root.join(CHECKPOINT_DIR).join(format!("{name}.{tag}"))
    }

    /// Write-to-temp + rename; the temp name is unique per call so
    /// concurrent commits on distinct files never collide.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> OpResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp.{seq}"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl DocStore for DiskStore {
    async fn create(&self, name: &str) -> OpResult<()> {
        validate_name(name)?;
        {
            let index = self.index.lock().expect("store index poisoned");
            if index.contains_key(name) {
                return Err(OpError::new(Status::FileExists, format!("file '{name}' exists")));
            }
        }
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, b"").await?;
        let backup = self.backup_path(name);
        if let Some(parent) = backup.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&backup, b"").await?;
        let mut index = self.index.lock().expect("store index poisoned");
        index.insert(name.to_string(), PathBuf::from(name));
        Ok(())
    }

    async fn delete(&self, name: &str) -> OpResult<()> {
        let path = {
            let mut index = self.index.lock().expect("store index poisoned");
            match index.remove(name) {
                Some(rel) => self.root.join(rel),
                None => return Err(OpError::file_not_found(name)),
            }
        };
        tokio::fs::remove_file(&path).await?;
        if let Err(err) = tokio::fs::remove_file(self.backup_path(name)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove backup of '{}': {}", name, err);
            }
        }
        remove_checkpoints(&self.root.join(CHECKPOINT_DIR), name).await;
        Ok(())
    }

    async fn read(&self, name: &str) -> OpResult<Vec<u8>> {
        let path = self.resolve(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn replace(&self, name: &str, bytes: &[u8]) -> OpResult<()> {
        let path = self.resolve(name)?;
        self.write_atomic(&path, bytes).await
    }

    async fn exists(&self, name: &str) -> bool {
        let index = self.index.lock().expect("store index poisoned");
        index.contains_key(name)
    }

    async fn create_folder(&self, folder: &str) -> OpResult<()> {
        validate_name(folder)?;
        tokio::fs::create_dir_all(self.root.join(folder)).await?;
        Ok(())
    }

    async fn relocate(&self, name: &str, folder: &str) -> OpResult<()> {
        let old_path = self.resolve(name)?;
        let rel = if folder.is_empty() {
            PathBuf::from(name)
        } else {
            validate_name(folder)?;
            Path::new(folder).join(name)
        };
        let new_path = self.root.join(&rel);
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_path, &new_path).await?;
        let mut index = self.index.lock().expect("store index poisoned");
        index.insert(name.to_string(), rel);
        Ok(())
    }

    async fn checkpoint(&self, name: &str, tag: &str) -> OpResult<u64> {
        let bytes = self.read(name).await?;
        let path = self.checkpoint_path(name, tag);
        self.write_atomic(&path, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn read_checkpoint(&self, name: &str, tag: &str) -> OpResult<Vec<u8>> {
        match tokio::fs::read(self.checkpoint_path(name, tag)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(OpError::new(
                Status::CheckpointNotFound,
                format!("no checkpoint '{tag}' for '{name}'"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn revert(&self, name: &str, tag: &str) -> OpResult<()> {
        let bytes = self.read_checkpoint(name, tag).await?;
        self.replace(name, &bytes).await
    }

    async fn read_backup(&self, name: &str) -> OpResult<Vec<u8>> {
        match tokio::fs::read(self.backup_path(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(OpError::invalid(format!("no backup recorded for '{name}'")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replace_backup(&self, name: &str, bytes: &[u8]) -> OpResult<()> {
        let path = self.backup_path(name);
        self.write_atomic(&path, bytes).await
    }

    async fn stats(&self, name: &str) -> OpResult<(u64, u64, u64)> {
        let bytes = self.read(name).await?;
        Ok(sentence::document_stats(&bytes))
    }

    async fn scan(&self) -> OpResult<Vec<String>> {
        let index = self.index.lock().expect("store index poisoned");
        let mut names: Vec<String> = index.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Recursively indexes the live tree. Files discovered on disk are known
/// by their full relative path; the checkpoint directory and leftover
/// temp files are skipped.
fn collect_files(
    root: &Path,
    dir: &Path,
    index: &mut HashMap<String, PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if dir == root && entry.file_name() == CHECKPOINT_DIR {
                continue;
            }
            collect_files(root, &path, index)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).expect("entry under root").to_path_buf();
            let name = rel.to_string_lossy().into_owned();
            if name.contains(".tmp.") {
                continue;
            }
            index.insert(name, rel);
        }
    }
    Ok(())
}

/// Best-effort removal of a deleted file's checkpoint copies.
async fn remove_checkpoints(checkpoint_root: &Path, name: &str) {
    let full = checkpoint_root.join(name);
    let (dir, base) = match (full.parent(), full.file_name()) {
        (Some(dir), Some(base)) => (dir.to_path_buf(), base.to_string_lossy().into_owned()),
        _ => return,
    };
    let prefix = format!("{base}.");
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                warn!("could not remove checkpoint {:?}: {}", entry.path(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> DiskStore {
        DiskStore::open(&dir.path().join("storage"), &dir.path().join("backup"), "ss1")
            .expect("open store")
    }

    #[tokio::test]
    async fn create_read_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);

        store.create("notes.txt").await.expect("create");
        assert!(store.exists("notes.txt").await);
        assert_eq!(store.read("notes.txt").await.expect("read"), b"");

        store.replace("notes.txt", b"Hello world").await.expect("replace");
        assert_eq!(store.read("notes.txt").await.expect("read"), b"Hello world");

        store.delete("notes.txt").await.expect("delete");
        assert!(!store.exists("notes.txt").await);
        let err = store.read("notes.txt").await.expect_err("read after delete");
        assert_eq!(err.status, Status::FileNotFound);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store.create("a.txt").await.expect("create");
        let err = store.create("a.txt").await.expect_err("duplicate");
        assert_eq!(err.status, Status::FileExists);
    }

    #[tokio::test]
    async fn checkpoint_then_revert_restores_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store.create("poem.txt").await.expect("create");
        store.replace("poem.txt", b"first draft.").await.expect("write v1");
        let size = store.checkpoint("poem.txt", "v1").await.expect("checkpoint");
        assert_eq!(size, 12);

        store.replace("poem.txt", b"second draft, much worse.").await.expect("write v2");
        store.revert("poem.txt", "v1").await.expect("revert");
        assert_eq!(store.read("poem.txt").await.expect("read"), b"first draft.");
    }

    #[tokio::test]
    async fn missing_checkpoint_is_its_own_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store.create("poem.txt").await.expect("create");
        let err = store.read_checkpoint("poem.txt", "nope").await.expect_err("missing tag");
        assert_eq!(err.status, Status::CheckpointNotFound);
    }

    #[tokio::test]
    async fn relocate_keeps_the_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        store.create("doc.txt").await.expect("create");
        store.replace("doc.txt", b"body").await.expect("write");
        store.relocate("doc.txt", "archive/2026").await.expect("relocate");
        assert_eq!(store.read("doc.txt").await.expect("read after move"), b"body");
        assert!(dir.path().join("storage/ss1/archive/2026/doc.txt").is_file());
    }

    #[tokio::test]
    async fn scan_rediscovers_files_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = open_store(&dir);
            store.create("kept.txt").await.expect("create");
            store.create("sub/nested.txt").await.expect("create nested");
        }
        let store = open_store(&dir);
        let names = store.scan().await.expect("scan");
        assert_eq!(names, vec!["kept.txt".to_string(), "sub/nested.txt".to_string()]);
    }

    #[test]
    fn name_validation_rejects_escapes() {
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name("dir/ok.txt").is_ok());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("/absolute").is_err());
        assert!(validate_name("").is_err());
    }
}
