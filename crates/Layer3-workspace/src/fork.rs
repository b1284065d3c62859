//! Fork orchestration
//!
//! Single pass, no retries:
//!
//! ```text
//! source.fork_workspace ──ok──────────────► resolve trunk ─┐
//!        │                                                 ├─► build target runtime
//!        └─fail─┬─ fatal ──────────► failure               │
//!               ├─ no fallback ────► failure               │
//!               └─ fallback ───────► source.create_workspace ┘
//! ```
//!
//! The target runtime config is recomputed for the new workspace before any
//! branching, so even failures carry a config bound to the right identity.

use anvil_foundation::{AbortSignal, Result};
use anvil_runtime::{
    null_logger, CreateWorkspaceParams, ForkWorkspaceParams, Git, InitLogger, LifecycleFailure,
    Runtime, RuntimeConfig, RuntimeContext, RuntimeFactory,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last-resort trunk when discovery fails
pub const DEFAULT_TRUNK: &str = "main";

// ============================================================================
// Branch discovery
// ============================================================================

/// Local git metadata queries used for trunk resolution
#[async_trait]
pub trait BranchDiscovery: Send + Sync {
    async fn branch_exists(&self, project_path: &Path, branch: &str) -> Result<bool>;

    async fn detect_trunk(&self, project_path: &Path) -> Result<String>;
}

/// Discovery through the `git` CLI
#[derive(Debug, Default, Clone, Copy)]
pub struct GitBranchDiscovery;

#[async_trait]
impl BranchDiscovery for GitBranchDiscovery {
    async fn branch_exists(&self, project_path: &Path, branch: &str) -> Result<bool> {
        Git::new(project_path)
            .branch_exists(branch)
            .await
            .map_err(|e| anvil_foundation::Error::Runtime(e.to_string()))
    }

    async fn detect_trunk(&self, project_path: &Path) -> Result<String> {
        Git::new(project_path)
            .detect_trunk()
            .await
            .map_err(|e| anvil_foundation::Error::Runtime(e.to_string()))
    }
}

// ============================================================================
// Request / Outcome
// ============================================================================

#[derive(Clone)]
pub struct ForkRequest {
    pub project_path: PathBuf,
    pub source_workspace_name: String,
    pub new_workspace_name: String,
    /// Persisted config of the source workspace
    pub source_config: RuntimeConfig,
    /// Fall back to a full create when the backend cannot fork
    pub allow_create_fallback: bool,
    /// Trunk to use when local git metadata is unreachable (ssh, docker)
    pub fallback_trunk: Option<String>,
    pub init_logger: Arc<dyn InitLogger>,
    pub abort: Option<AbortSignal>,
}

impl ForkRequest {
    pub fn new(
        project_path: impl Into<PathBuf>,
        source_workspace_name: impl Into<String>,
        new_workspace_name: impl Into<String>,
        source_config: RuntimeConfig,
    ) -> Self {
        Self {
            project_path: project_path.into(),
            source_workspace_name: source_workspace_name.into(),
            new_workspace_name: new_workspace_name.into(),
            source_config,
            allow_create_fallback: true,
            fallback_trunk: None,
            init_logger: null_logger(),
            abort: None,
        }
    }

    pub fn allow_create_fallback(mut self, allow: bool) -> Self {
        self.allow_create_fallback = allow;
        self
    }

    pub fn fallback_trunk(mut self, trunk: impl Into<String>) -> Self {
        self.fallback_trunk = Some(trunk.into());
        self
    }

    pub fn logger(mut self, logger: Arc<dyn InitLogger>) -> Self {
        self.init_logger = logger;
        self
    }

    pub fn abort(mut self, signal: Option<AbortSignal>) -> Self {
        self.abort = signal;
        self
    }
}

pub struct ForkOutcome {
    pub workspace_path: PathBuf,
    pub trunk_branch: String,
    /// Config of the new workspace, identity fields recomputed
    pub runtime_config: RuntimeConfig,
    /// Handle bound to the new workspace
    pub runtime: Arc<dyn Runtime>,
    /// `false` when the create fallback produced the workspace
    pub forked: bool,
    /// For the caller to persist; the orchestrator writes nothing
    pub source_config_update: Option<RuntimeConfig>,
}

impl std::fmt::Debug for ForkOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkOutcome")
            .field("workspace_path", &self.workspace_path)
            .field("trunk_branch", &self.trunk_branch)
            .field("runtime_config", &self.runtime_config)
            .field("forked", &self.forked)
            .field("source_config_update", &self.source_config_update)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{failure}")]
pub struct ForkFailure {
    pub failure: LifecycleFailure,
    /// Normalized config for the new workspace, computed even on failure
    pub runtime_config: RuntimeConfig,
}

impl ForkFailure {
    pub fn is_fatal(&self) -> bool {
        self.failure.fatal
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// Trunk precedence: fork-reported source branch, caller fallback, local
/// discovery, then `main`
pub async fn resolve_trunk(
    source_branch: Option<&str>,
    fallback_trunk: Option<&str>,
    discovery: &dyn BranchDiscovery,
    project_path: &Path,
    source_workspace_name: &str,
) -> String {
    if let Some(branch) = source_branch.filter(|b| !b.is_empty()) {
        return branch.to_string();
    }
    if let Some(trunk) = fallback_trunk.filter(|t| !t.is_empty()) {
        return trunk.to_string();
    }

    match discovery
        .branch_exists(project_path, source_workspace_name)
        .await
    {
        Ok(true) => return source_workspace_name.to_string(),
        Ok(false) => {}
        Err(e) => {
            warn!(project = %project_path.display(), "branch lookup failed: {}", e);
            return DEFAULT_TRUNK.to_string();
        }
    }

    match discovery.detect_trunk(project_path).await {
        Ok(trunk) => trunk,
        Err(e) => {
            warn!(project = %project_path.display(), "trunk detection failed: {}", e);
            DEFAULT_TRUNK.to_string()
        }
    }
}

/// Duplicate a workspace, falling back to a full create when allowed
pub async fn orchestrate_fork(
    source_runtime: &dyn Runtime,
    factory: &dyn RuntimeFactory,
    discovery: &dyn BranchDiscovery,
    request: ForkRequest,
) -> std::result::Result<ForkOutcome, ForkFailure> {
    let fork_result = source_runtime
        .fork_workspace(ForkWorkspaceParams {
            project_path: request.project_path.clone(),
            source_workspace_name: request.source_workspace_name.clone(),
            new_workspace_name: request.new_workspace_name.clone(),
            init_logger: Arc::clone(&request.init_logger),
            abort: request.abort.clone(),
        })
        .await;

    let runtime_config = request
        .source_config
        .for_workspace(&request.project_path, &request.new_workspace_name);
    let fail = |failure: LifecycleFailure| ForkFailure {
        failure,
        runtime_config: runtime_config.clone(),
    };

    let (workspace_path, trunk_branch, forked, source_config_update) = match fork_result {
        Ok(forked) => {
            let trunk = resolve_trunk(
                forked.source_branch.as_deref(),
                request.fallback_trunk.as_deref(),
                discovery,
                &request.project_path,
                &request.source_workspace_name,
            )
            .await;
            info!(
                source = %request.source_workspace_name,
                workspace = %request.new_workspace_name,
                trunk = %trunk,
                "workspace forked"
            );
            (forked.workspace_path, trunk, true, forked.source_config_update)
        }
        Err(failure) if failure.fatal => {
            warn!(workspace = %request.new_workspace_name, "fork failed fatally: {}", failure);
            return Err(fail(failure));
        }
        Err(failure) if !request.allow_create_fallback => {
            debug!(workspace = %request.new_workspace_name, "fork failed, fallback disabled");
            return Err(fail(failure));
        }
        Err(failure) => {
            info!(
                workspace = %request.new_workspace_name,
                "fork unavailable ({}), creating instead",
                failure
            );
            let trunk = resolve_trunk(
                None,
                request.fallback_trunk.as_deref(),
                discovery,
                &request.project_path,
                &request.source_workspace_name,
            )
            .await;
            request
                .init_logger
                .log_step(&format!("Creating {} from {}", request.new_workspace_name, trunk));
            let created = source_runtime
                .create_workspace(
                    CreateWorkspaceParams::new(&request.project_path, &request.new_workspace_name)
                        .trunk(trunk.clone())
                        .logger(Arc::clone(&request.init_logger))
                        .abort(request.abort.clone()),
                )
                .await
                .map_err(&fail)?;
            (created.workspace_path, trunk, false, None)
        }
    };

    let runtime = factory
        .create(
            &runtime_config,
            &RuntimeContext::new(&request.project_path, &request.new_workspace_name),
        )
        .map_err(|e| {
            // the workspace exists now; creating it again would collide
            fail(LifecycleFailure::fatal(format!(
                "workspace created but runtime construction failed: {}",
                e
            )))
        })?;

    Ok(ForkOutcome {
        workspace_path,
        trunk_branch,
        runtime_config,
        runtime,
        forked,
        source_config_update,
    })
}
