//! Persisted workspace metadata (`metadata.json`)

use anvil_foundation::{KeyedLock, Result, SessionFileStore};
use anvil_runtime::{project_key, RuntimeConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    /// Workspace id, also the session directory name
    pub id: String,
    pub name: String,
    pub project_path: PathBuf,
    pub workspace_path: PathBuf,
    pub runtime_config: RuntimeConfig,
    pub trunk_branch: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
}

impl WorkspaceMetadata {
    pub fn new(
        name: impl Into<String>,
        project_path: impl Into<PathBuf>,
        workspace_path: impl Into<PathBuf>,
        runtime_config: RuntimeConfig,
        trunk_branch: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            project_path: project_path.into(),
            workspace_path: workspace_path.into(),
            runtime_config,
            trunk_branch: trunk_branch.into(),
            created_at: Utc::now(),
            forked_from: None,
        }
    }

    pub fn forked_from(mut self, source: impl Into<String>) -> Self {
        self.forked_from = Some(source.into());
        self
    }
}

/// Session directory root for one project: `<sessions_dir>/<project-key>`
pub fn project_sessions_dir(sessions_dir: &Path, project_path: &Path) -> PathBuf {
    sessions_dir.join(project_key(project_path))
}

/// `metadata.json` documents of one project
#[derive(Debug, Clone)]
pub struct MetadataStore {
    store: SessionFileStore<WorkspaceMetadata>,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>, locks: Arc<KeyedLock>) -> Self {
        Self {
            store: SessionFileStore::with_locks(root, METADATA_FILE, locks),
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub async fn get(&self, id: &str) -> Option<WorkspaceMetadata> {
        self.store.read(id).await
    }

    pub async fn put(&self, metadata: &WorkspaceMetadata) -> Result<()> {
        self.store.write(&metadata.id, metadata).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        // the session directory may still hold other documents
        let _ = tokio::fs::remove_dir(self.store.workspace_dir(id)).await;
        Ok(())
    }

    /// Replace the runtime config of an existing entry
    pub async fn update_config(&self, id: &str, config: RuntimeConfig) -> Result<bool> {
        let Some(mut meta) = self.get(id).await else {
            return Ok(false);
        };
        meta.runtime_config = config;
        self.put(&meta).await?;
        Ok(true)
    }

    /// All readable entries, sorted by name
    pub async fn list(&self) -> Result<Vec<WorkspaceMetadata>> {
        let mut entries = match tokio::fs::read_dir(self.store.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Some(meta) = self.get(&id).await {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> MetadataStore {
        MetadataStore::new(dir.path(), Arc::new(KeyedLock::new()))
    }

    #[tokio::test]
    async fn test_put_list_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for name in ["zeta", "alpha"] {
            let meta = WorkspaceMetadata::new(
                name,
                "/code/app",
                format!("/src/app/{}", name),
                RuntimeConfig::default(),
                "main",
            );
            store.put(&meta).await.unwrap();
        }

        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        store.remove("alpha").await.unwrap();
        assert!(store.get("alpha").await.is_none());
        assert!(!dir.path().join("alpha").exists());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_of_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path().join("nope"), Arc::new(KeyedLock::new()));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_config_only_touches_existing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(!store
            .update_config("ghost", RuntimeConfig::Local)
            .await
            .unwrap());
        assert!(store.get("ghost").await.is_none());

        let meta = WorkspaceMetadata::new(
            "w",
            "/p",
            "/p",
            RuntimeConfig::docker("ubuntu:22.04"),
            "main",
        );
        store.put(&meta).await.unwrap();
        let update = RuntimeConfig::Docker {
            image: "ubuntu:22.04".into(),
            container_name: Some("anvil-p-w-0".into()),
        };
        assert!(store.update_config("w", update.clone()).await.unwrap());
        assert_eq!(store.get("w").await.unwrap().runtime_config, update);
    }

    #[test]
    fn test_serde_shape() {
        let meta = WorkspaceMetadata::new("w", "/p", "/p", RuntimeConfig::Local, "main")
            .forked_from("base");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["forkedFrom"], "base");
        assert_eq!(json["runtimeConfig"]["type"], "local");
        assert_eq!(json["trunkBranch"], "main");
    }
}
