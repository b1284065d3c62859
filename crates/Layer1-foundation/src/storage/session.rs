//! Per-workspace JSON documents
//!
//! Layout: `<root>/<workspace_id>/<file_name>`. Every write and delete for a
//! workspace id goes through the same keyed lock, and writes are atomic.
//!
//! Reads favor availability: a missing or unreadable document is `None`.

use super::atomic::write_atomic;
use super::lock::KeyedLock;
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reject ids that would escape the session directory
pub fn validate_workspace_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_input("workspace id must not be empty"));
    }
    if id == "." || id == ".." || id.contains(|c| c == '/' || c == '\\' || c == '\0') {
        return Err(Error::invalid_input(format!(
            "workspace id contains path separators: {:?}",
            id
        )));
    }
    Ok(())
}

/// Keyed-lock protected JSON document store for one document kind
pub struct SessionFileStore<T> {
    root: PathBuf,
    file_name: String,
    locks: Arc<KeyedLock>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Clone for SessionFileStore<T> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            file_name: self.file_name.clone(),
            locks: Arc::clone(&self.locks),
            _doc: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SessionFileStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFileStore")
            .field("root", &self.root)
            .field("file_name", &self.file_name)
            .finish()
    }
}

impl<T> SessionFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self::with_locks(root, file_name, Arc::new(KeyedLock::new()))
    }

    /// Share a lock registry between document kinds of the same workspace
    pub fn with_locks(
        root: impl Into<PathBuf>,
        file_name: impl Into<String>,
        locks: Arc<KeyedLock>,
    ) -> Self {
        Self {
            root: root.into(),
            file_name: file_name.into(),
            locks,
            _doc: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> Arc<KeyedLock> {
        Arc::clone(&self.locks)
    }

    /// Session directory for a workspace
    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.root.join(workspace_id)
    }

    pub fn path_for(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join(&self.file_name)
    }

    /// Load the document. Absent, unreadable and unparsable all read as `None`.
    pub async fn read(&self, workspace_id: &str) -> Option<T> {
        if let Err(e) = validate_workspace_id(workspace_id) {
            warn!(workspace = workspace_id, "rejecting session read: {}", e);
            return None;
        }

        let path = self.path_for(workspace_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), "failed to read session document: {}", e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(path = %path.display(), "failed to parse session document: {}", e);
                None
            }
        }
    }

    /// Write the document unconditionally
    pub async fn write(&self, workspace_id: &str, value: &T) -> Result<()> {
        self.write_if(workspace_id, value, || true).await.map(|_| ())
    }

    /// Write the document if `still_valid` returns true once the lock is held.
    ///
    /// Returns `Ok(false)` when the guard rejected the write.
    pub async fn write_if<G>(&self, workspace_id: &str, value: &T, still_valid: G) -> Result<bool>
    where
        G: FnOnce() -> bool + Send,
    {
        validate_workspace_id(workspace_id)?;
        let payload = serde_json::to_vec_pretty(value)?;

        let _guard = self.locks.lock(workspace_id).await;
        if !still_valid() {
            debug!(workspace = workspace_id, file = %self.file_name, "write skipped by guard");
            return Ok(false);
        }

        let path = self.path_for(workspace_id);
        write_atomic(&path, &payload).await.map_err(|e| {
            Error::Storage(format!("failed to write {}: {}", path.display(), e))
        })?;
        Ok(true)
    }

    /// Read-modify-write under the workspace lock
    pub async fn update<F>(&self, workspace_id: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(Option<T>) -> T + Send,
    {
        validate_workspace_id(workspace_id)?;
        let _guard = self.locks.lock(workspace_id).await;

        let path = self.path_for(workspace_id);
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        };
        let next = mutate(current);
        let payload = serde_json::to_vec_pretty(&next)?;
        write_atomic(&path, &payload).await.map_err(|e| {
            Error::Storage(format!("failed to write {}: {}", path.display(), e))
        })?;
        Ok(next)
    }

    /// Remove the document. A missing file counts as success.
    pub async fn delete(&self, workspace_id: &str) -> Result<()> {
        validate_workspace_id(workspace_id)?;
        let _guard = self.locks.lock(workspace_id).await;

        let path = self.path_for(workspace_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        owner: String,
        payload: String,
    }

    fn doc(owner: &str, len: usize) -> Doc {
        Doc {
            owner: owner.to_string(),
            payload: owner.repeat(len),
        }
    }

    #[tokio::test]
    async fn test_read_absent_is_none() {
        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Doc> = SessionFileStore::new(dir.path(), "doc.json");
        assert!(store.read("ws-1").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Doc> = SessionFileStore::new(dir.path(), "doc.json");
        std::fs::create_dir_all(dir.path().join("ws-1")).unwrap();
        std::fs::write(store.path_for("ws-1"), "{not json").unwrap();
        assert!(store.read("ws-1").await.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_and_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Doc> = SessionFileStore::new(dir.path(), "doc.json");

        store.write("ws-1", &doc("a", 3)).await.unwrap();
        assert_eq!(store.read("ws-1").await, Some(doc("a", 3)));

        store.delete("ws-1").await.unwrap();
        store.delete("ws-1").await.unwrap();
        assert!(store.read("ws-1").await.is_none());
    }

    #[tokio::test]
    async fn test_guard_checked_after_lock() {
        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Doc> = SessionFileStore::new(dir.path(), "doc.json");

        let written = store.write_if("ws-1", &doc("a", 1), || false).await.unwrap();
        assert!(!written);
        assert!(store.read("ws-1").await.is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Doc> = SessionFileStore::new(dir.path(), "doc.json");
        assert!(matches!(
            store.write("../escape", &doc("a", 1)).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(store.read("").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_never_interleave() {
        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Doc> = SessionFileStore::new(dir.path(), "doc.json");
        let a = doc("a", 64 * 1024);
        let b = doc("b", 64 * 1024);

        for _ in 0..10 {
            let (s1, s2) = (store.clone(), store.clone());
            let (a1, b1) = (a.clone(), b.clone());
            let t1 = tokio::spawn(async move { s1.write("ws-1", &a1).await });
            let t2 = tokio::spawn(async move { s2.write("ws-1", &b1).await });
            t1.await.unwrap().unwrap();
            t2.await.unwrap().unwrap();

            let on_disk = store.read("ws-1").await.expect("document should parse");
            assert!(on_disk == a || on_disk == b);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_is_read_modify_write() {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        struct Counter {
            n: u32,
        }

        let dir = TempDir::new().unwrap();
        let store: SessionFileStore<Counter> = SessionFileStore::new(dir.path(), "counter.json");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("ws-1", |c| Counter {
                        n: c.unwrap_or_default().n + 1,
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.read("ws-1").await.unwrap().n, 20);
    }
}
