//! Workspace Service - lifecycle operations for one project
//!
//! Composes the runtime factory, fork orchestrator, metadata store, init hook
//! and git-status cache. Every lifecycle call takes an `InitLogger` for
//! progress and an optional abort signal.

use crate::fork::{orchestrate_fork, BranchDiscovery, ForkFailure, ForkRequest, GitBranchDiscovery};
use crate::git_status::{self, GitStatusSummary, GIT_STATUS_FILE};
use crate::init_hook::{run_init_hook, InitHookOutcome};
use crate::metadata::{project_sessions_dir, MetadataStore, WorkspaceMetadata};
use anvil_foundation::{
    validate_workspace_id, AbortSignal, AnvilConfig, KeyedLock, PromptBroker, SequencedStore,
    SessionFileStore,
};
use anvil_runtime::{
    sync_ignored_files, CreateWorkspaceParams, DefaultRuntimeFactory, DeleteWorkspaceParams,
    InitLogger, LifecycleFailure, RenameWorkspaceParams, Runtime, RuntimeConfig, RuntimeContext,
    RuntimeFactory, RuntimeKind, SyncReport,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("workspace {0} not found")]
    NotFound(String),

    #[error("workspace {0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Lifecycle(LifecycleFailure),

    #[error("fork failed: {0}")]
    Fork(ForkFailure),

    #[error(transparent)]
    Foundation(#[from] anvil_foundation::Error),
}

impl ServiceError {
    /// Whether the backend left something behind that needs manual cleanup
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Lifecycle(failure) => failure.fatal,
            Self::Fork(failure) => failure.is_fatal(),
            _ => false,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

// ============================================================================
// Requests
// ============================================================================

/// Arguments for `WorkspaceService::create`
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Backend; defaults to a worktree
    pub runtime: Option<RuntimeConfig>,
    /// Branch to start from; detected when absent
    pub trunk: Option<String>,
}

impl CreateOptions {
    pub fn runtime(mut self, config: RuntimeConfig) -> Self {
        self.runtime = Some(config);
        self
    }

    pub fn trunk(mut self, trunk: impl Into<String>) -> Self {
        self.trunk = Some(trunk.into());
        self
    }
}

// ============================================================================
// Name reservations
// ============================================================================

/// Names claimed by a create, fork or rename that has not persisted yet.
///
/// Separate from the document lock registry: that lock is taken inside every
/// store write, so holding it across `put` would deadlock.
#[derive(Debug, Default)]
struct Reservations {
    names: Mutex<HashSet<String>>,
}

impl Reservations {
    fn claim(&self, name: &str) -> Option<Reservation<'_>> {
        if !self.names.lock().insert(name.to_string()) {
            return None;
        }
        Some(Reservation {
            owner: self,
            name: name.to_string(),
        })
    }
}

/// Releases its name on drop, whether the operation succeeded or not
struct Reservation<'a> {
    owner: &'a Reservations,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.owner.names.lock().remove(&self.name);
    }
}

// ============================================================================
// WorkspaceService
// ============================================================================

pub struct WorkspaceService {
    settings: AnvilConfig,
    project_path: PathBuf,
    factory: Arc<dyn RuntimeFactory>,
    discovery: Arc<dyn BranchDiscovery>,
    prompts: Arc<PromptBroker>,
    metadata: MetadataStore,
    git_status: SequencedStore<GitStatusSummary>,
    reservations: Reservations,
}

impl WorkspaceService {
    pub fn new(
        settings: AnvilConfig,
        project_path: impl Into<PathBuf>,
        factory: Arc<dyn RuntimeFactory>,
        prompts: Arc<PromptBroker>,
    ) -> Self {
        let project_path = project_path.into();
        let root = project_sessions_dir(&settings.sessions_dir(), &project_path);
        // one lock registry for every document of a workspace
        let locks = Arc::new(KeyedLock::new());
        Self {
            metadata: MetadataStore::new(&root, Arc::clone(&locks)),
            git_status: SequencedStore::new(SessionFileStore::with_locks(
                &root,
                GIT_STATUS_FILE,
                locks,
            )),
            settings,
            project_path,
            factory,
            discovery: Arc::new(GitBranchDiscovery),
            prompts,
            reservations: Reservations::default(),
        }
    }

    /// Real backends with SSH prompts routed through a fresh broker
    pub fn open(settings: AnvilConfig, project_path: impl Into<PathBuf>) -> Self {
        let prompts = Arc::new(PromptBroker::new());
        let factory = DefaultRuntimeFactory::new(settings.clone()).with_prompts(Arc::clone(&prompts));
        Self::new(settings, project_path, Arc::new(factory), prompts)
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn BranchDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn settings(&self) -> &AnvilConfig {
        &self.settings
    }

    pub fn prompts(&self) -> &Arc<PromptBroker> {
        &self.prompts
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn list(&self) -> ServiceResult<Vec<WorkspaceMetadata>> {
        Ok(self.metadata.list().await?)
    }

    pub async fn get(&self, name: &str) -> ServiceResult<WorkspaceMetadata> {
        self.metadata
            .get(name)
            .await
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Runtime bound to a registered workspace
    pub async fn runtime_for(&self, name: &str) -> ServiceResult<Arc<dyn Runtime>> {
        let meta = self.get(name).await?;
        self.runtime_with(&meta.runtime_config, name)
    }

    /// Runtime for `name` built from an explicit config
    pub fn runtime_with(
        &self,
        config: &RuntimeConfig,
        name: &str,
    ) -> ServiceResult<Arc<dyn Runtime>> {
        Ok(self
            .factory
            .create(config, &RuntimeContext::new(&self.project_path, name))?)
    }

    /// Last persisted git status, if any
    pub async fn cached_git_status(&self, name: &str) -> Option<GitStatusSummary> {
        self.git_status.read(name).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Claim `name` until the returned guard drops. The claim comes before the
    /// metadata check so two concurrent callers cannot both see a free name.
    async fn reserve(&self, name: &str) -> ServiceResult<Reservation<'_>> {
        validate_workspace_id(name)?;
        let claim = self
            .reservations
            .claim(name)
            .ok_or_else(|| ServiceError::AlreadyExists(name.to_string()))?;
        if self.metadata.get(name).await.is_some() {
            return Err(ServiceError::AlreadyExists(name.to_string()));
        }
        Ok(claim)
    }

    async fn detect_trunk(&self) -> String {
        match self.discovery.detect_trunk(&self.project_path).await {
            Ok(trunk) => trunk,
            Err(e) => {
                warn!(project = %self.project_path.display(), "trunk detection failed: {}", e);
                crate::fork::DEFAULT_TRUNK.to_string()
            }
        }
    }

    pub async fn create(
        &self,
        name: &str,
        options: CreateOptions,
        logger: Arc<dyn InitLogger>,
        abort: Option<AbortSignal>,
    ) -> ServiceResult<WorkspaceMetadata> {
        let _claim = self.reserve(name).await?;

        let config = options
            .runtime
            .unwrap_or_default()
            .for_workspace(&self.project_path, name);
        let runtime = self.runtime_with(&config, name)?;
        let trunk = match options.trunk {
            Some(trunk) => trunk,
            None => self.detect_trunk().await,
        };

        logger.log_step(&format!("Creating {} ({}) from {}", name, config.kind(), trunk));
        let created = runtime
            .create_workspace(
                CreateWorkspaceParams::new(&self.project_path, name)
                    .trunk(trunk.clone())
                    .logger(Arc::clone(&logger))
                    .abort(abort.clone()),
            )
            .await
            .map_err(ServiceError::Lifecycle)?;

        let meta = WorkspaceMetadata::new(
            name,
            &self.project_path,
            created.workspace_path,
            config,
            trunk,
        );
        self.metadata.put(&meta).await?;
        info!(workspace = name, path = %meta.workspace_path.display(), "workspace created");

        self.run_hook(runtime.as_ref(), logger, abort).await;
        Ok(meta)
    }

    pub async fn fork(
        &self,
        source: &str,
        new_name: &str,
        allow_create_fallback: bool,
        logger: Arc<dyn InitLogger>,
        abort: Option<AbortSignal>,
    ) -> ServiceResult<WorkspaceMetadata> {
        let source_meta = self.get(source).await?;
        let _claim = self.reserve(new_name).await?;
        let source_runtime = self.runtime_with(&source_meta.runtime_config, source)?;

        let mut request = ForkRequest::new(
            &self.project_path,
            source,
            new_name,
            source_meta.runtime_config.clone(),
        )
        .allow_create_fallback(allow_create_fallback)
        .logger(Arc::clone(&logger))
        .abort(abort.clone());
        // remote backends have no local checkout to ask
        if matches!(
            source_meta.runtime_config.kind(),
            RuntimeKind::Ssh | RuntimeKind::Docker
        ) {
            request = request.fallback_trunk(source_meta.trunk_branch.clone());
        }

        let outcome = orchestrate_fork(
            source_runtime.as_ref(),
            self.factory.as_ref(),
            self.discovery.as_ref(),
            request,
        )
        .await
        .map_err(ServiceError::Fork)?;

        if let Some(update) = outcome.source_config_update.clone() {
            if let Err(e) = self.metadata.update_config(source, update).await {
                warn!(workspace = source, "failed to persist source config update: {}", e);
            }
        }

        let meta = WorkspaceMetadata::new(
            new_name,
            &self.project_path,
            outcome.workspace_path,
            outcome.runtime_config,
            outcome.trunk_branch,
        )
        .forked_from(source);
        self.metadata.put(&meta).await?;
        info!(
            source,
            workspace = new_name,
            forked = outcome.forked,
            "workspace forked"
        );

        self.run_hook(outcome.runtime.as_ref(), logger, abort).await;
        Ok(meta)
    }

    pub async fn delete(
        &self,
        name: &str,
        force: bool,
        abort: Option<AbortSignal>,
    ) -> ServiceResult<()> {
        let meta = self.get(name).await?;
        let runtime = self.runtime_with(&meta.runtime_config, name)?;

        runtime
            .delete_workspace(DeleteWorkspaceParams {
                project_path: self.project_path.clone(),
                workspace_path: meta.workspace_path.clone(),
                branch_name: name.to_string(),
                force,
                abort,
            })
            .await
            .map_err(ServiceError::Lifecycle)?;

        self.git_status.delete(name).await?;
        self.metadata.remove(name).await?;
        info!(workspace = name, "workspace deleted");
        Ok(())
    }

    pub async fn rename(
        &self,
        old_name: &str,
        new_name: &str,
        abort: Option<AbortSignal>,
    ) -> ServiceResult<WorkspaceMetadata> {
        let meta = self.get(old_name).await?;
        let _claim = self.reserve(new_name).await?;
        let runtime = self.runtime_with(&meta.runtime_config, old_name)?;

        let renamed = runtime
            .rename_workspace(RenameWorkspaceParams {
                project_path: self.project_path.clone(),
                old_name: old_name.to_string(),
                new_name: new_name.to_string(),
                abort,
            })
            .await
            .map_err(ServiceError::Lifecycle)?;

        let moved = WorkspaceMetadata {
            id: new_name.to_string(),
            name: new_name.to_string(),
            workspace_path: renamed.new_path,
            runtime_config: meta
                .runtime_config
                .for_workspace(&self.project_path, new_name),
            ..meta
        };
        self.metadata.put(&moved).await?;
        self.git_status.delete(old_name).await?;
        self.metadata.remove(old_name).await?;
        info!(from = old_name, to = new_name, "workspace renamed");
        Ok(moved)
    }

    /// Copy ignored files selected by the sync file from `source` into `dest`
    pub async fn sync_ignored(&self, source: &str, dest: &str) -> ServiceResult<SyncReport> {
        let source_path = self.local_path(source).await?;
        let dest_path = self.local_path(dest).await?;
        Ok(sync_ignored_files(&source_path, &dest_path, &self.settings.ignore_sync.file_name()).await)
    }

    async fn local_path(&self, name: &str) -> ServiceResult<PathBuf> {
        let meta = self.get(name).await?;
        match meta.runtime_config.kind() {
            RuntimeKind::Local | RuntimeKind::Worktree => Ok(meta.workspace_path),
            kind => Err(anvil_foundation::Error::invalid_input(format!(
                "workspace {} lives on a {} backend, not the local filesystem",
                name, kind
            ))
            .into()),
        }
    }

    /// Recompute git status; a refresh superseded by a later one is not persisted
    pub async fn refresh_git_status(
        &self,
        name: &str,
        abort: Option<AbortSignal>,
    ) -> ServiceResult<GitStatusSummary> {
        let runtime = self.runtime_for(name).await?;
        let (summary, _) = git_status::refresh(&self.git_status, name, runtime.as_ref(), abort).await?;
        Ok(summary)
    }

    async fn run_hook(
        &self,
        runtime: &dyn Runtime,
        logger: Arc<dyn InitLogger>,
        abort: Option<AbortSignal>,
    ) {
        let outcome = run_init_hook(runtime, &self.settings.init_hook, logger, abort).await;
        if outcome == InitHookOutcome::Failed {
            warn!(path = %runtime.workspace_path().display(), "init hook did not complete");
        }
    }
}
