//! Stale-write rejection for concurrent recomputation
//!
//! Each computation takes a ticket when it starts. Only the holder of the
//! latest ticket for a workspace id may persist; an older computation that
//! finishes later discards its result.

use super::session::SessionFileStore;
use crate::Result;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Start-order ticket for one computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeTicket {
    pub workspace_id: String,
    pub sequence: u64,
}

/// Records the most recently started computation per workspace id
#[derive(Debug, Default)]
pub struct SequenceGate {
    next: AtomicU64,
    latest: Mutex<HashMap<String, u64>>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new computation; it supersedes every earlier one for the id
    pub fn begin(&self, workspace_id: &str) -> ComputeTicket {
        let sequence = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.lock().insert(workspace_id.to_string(), sequence);
        ComputeTicket {
            workspace_id: workspace_id.to_string(),
            sequence,
        }
    }

    pub fn is_latest(&self, ticket: &ComputeTicket) -> bool {
        self.latest.lock().get(&ticket.workspace_id).copied() == Some(ticket.sequence)
    }

    /// Forget an id, invalidating every outstanding ticket for it
    pub fn invalidate(&self, workspace_id: &str) {
        self.latest.lock().remove(workspace_id);
    }
}

/// Session document written only by the latest-started computation
pub struct SequencedStore<T> {
    store: SessionFileStore<T>,
    gate: Arc<SequenceGate>,
}

impl<T> Clone for SequencedStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<T> SequencedStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: SessionFileStore<T>) -> Self {
        Self {
            store,
            gate: Arc::new(SequenceGate::new()),
        }
    }

    pub fn begin(&self, workspace_id: &str) -> ComputeTicket {
        self.gate.begin(workspace_id)
    }

    /// Persist a result. `Ok(false)` means a newer computation superseded it.
    pub async fn commit(&self, ticket: &ComputeTicket, value: &T) -> Result<bool> {
        let gate = Arc::clone(&self.gate);
        let written = self
            .store
            .write_if(&ticket.workspace_id, value, move || gate.is_latest(ticket))
            .await?;
        if !written {
            debug!(
                workspace = %ticket.workspace_id,
                sequence = ticket.sequence,
                "discarding superseded computation"
            );
        }
        Ok(written)
    }

    pub async fn read(&self, workspace_id: &str) -> Option<T> {
        self.store.read(workspace_id).await
    }

    pub async fn delete(&self, workspace_id: &str) -> Result<()> {
        self.gate.invalidate(workspace_id);
        self.store.delete(workspace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Stats {
        computed_by: String,
    }

    fn stats(by: &str) -> Stats {
        Stats {
            computed_by: by.to_string(),
        }
    }

    #[test]
    fn test_later_begin_supersedes() {
        let gate = SequenceGate::new();
        let first = gate.begin("ws");
        let second = gate.begin("ws");
        assert!(!gate.is_latest(&first));
        assert!(gate.is_latest(&second));

        // other ids are unaffected
        let other = gate.begin("other");
        assert!(gate.is_latest(&other));
        assert!(gate.is_latest(&second));
    }

    #[tokio::test]
    async fn test_rejection_follows_start_order_not_finish_order() {
        let dir = TempDir::new().unwrap();
        let store = SequencedStore::new(SessionFileStore::new(dir.path(), "stats.json"));

        let first = store.begin("ws");
        let second = store.begin("ws");

        // second-started finishes first
        assert!(store.commit(&second, &stats("second")).await.unwrap());
        // first-started finishes last and must not overwrite
        assert!(!store.commit(&first, &stats("first")).await.unwrap());

        assert_eq!(store.read("ws").await, Some(stats("second")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_computations_keep_latest() {
        let dir = TempDir::new().unwrap();
        let store = SequencedStore::new(SessionFileStore::new(dir.path(), "stats.json"));

        let slow = store.begin("ws");
        let fast = store.begin("ws");

        let s1 = store.clone();
        let slow_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            s1.commit(&slow, &stats("slow")).await
        });
        let s2 = store.clone();
        let fast_task = tokio::spawn(async move { s2.commit(&fast, &stats("fast")).await });

        assert!(fast_task.await.unwrap().unwrap());
        assert!(!slow_task.await.unwrap().unwrap());
        assert_eq!(store.read("ws").await, Some(stats("fast")));
    }

    #[tokio::test]
    async fn test_delete_invalidates_outstanding_tickets() {
        let dir = TempDir::new().unwrap();
        let store = SequencedStore::new(SessionFileStore::new(dir.path(), "stats.json"));

        let ticket = store.begin("ws");
        store.delete("ws").await.unwrap();
        assert!(!store.commit(&ticket, &stats("late")).await.unwrap());
        assert!(store.read("ws").await.is_none());
    }
}
