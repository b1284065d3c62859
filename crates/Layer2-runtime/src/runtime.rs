//! Runtime trait - one execution backend bound to one project + workspace
//!
//! Lifecycle methods return `LifecycleResult`; expected failures (missing
//! directory, unsupported operation, collision) are values, not errors.

use crate::config::RuntimeConfig;
use crate::file::{ByteStream, FileSink};
use anvil_foundation::{AbortSignal, Result};
use anvil_process::ExecHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Kind / Capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Local,
    Worktree,
    Ssh,
    Docker,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Worktree => "worktree",
            Self::Ssh => "ssh",
            Self::Docker => "docker",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_fork: bool,
    pub supports_tilde_expansion: bool,
    /// Each workspace gets its own directory / branch
    pub isolated: bool,
}

// ============================================================================
// Exec / File types
// ============================================================================

/// Options for `Runtime::exec`
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory; defaults to the workspace path
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub abort: Option<AbortSignal>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn abort(mut self, signal: Option<AbortSignal>) -> Self {
        self.abort = signal;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
}

// ============================================================================
// Lifecycle results
// ============================================================================

/// Failed lifecycle operation.
///
/// `fatal` means falling back to a full create would be wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct LifecycleFailure {
    pub error: String,
    pub fatal: bool,
}

impl LifecycleFailure {
    pub fn recoverable(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fatal: false,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fatal: true,
        }
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleFailure>;

// ============================================================================
// Init logger
// ============================================================================

/// Progress sink for workspace lifecycle operations
pub trait InitLogger: Send + Sync {
    fn log_step(&self, message: &str);
    fn log_stdout(&self, line: &str);
    fn log_stderr(&self, line: &str);
    fn log_complete(&self, exit_code: i32);
}

/// Forwards progress to `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingInitLogger {
    workspace: String,
}

impl TracingInitLogger {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

impl InitLogger for TracingInitLogger {
    fn log_step(&self, message: &str) {
        info!(workspace = %self.workspace, "{}", message);
    }

    fn log_stdout(&self, line: &str) {
        info!(workspace = %self.workspace, stream = "stdout", "{}", line);
    }

    fn log_stderr(&self, line: &str) {
        warn!(workspace = %self.workspace, stream = "stderr", "{}", line);
    }

    fn log_complete(&self, exit_code: i32) {
        info!(workspace = %self.workspace, exit_code, "init complete");
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInitLogger;

impl InitLogger for NullInitLogger {
    fn log_step(&self, _message: &str) {}
    fn log_stdout(&self, _line: &str) {}
    fn log_stderr(&self, _line: &str) {}
    fn log_complete(&self, _exit_code: i32) {}
}

pub fn null_logger() -> Arc<dyn InitLogger> {
    Arc::new(NullInitLogger)
}

// ============================================================================
// Lifecycle params
// ============================================================================

#[derive(Clone)]
pub struct CreateWorkspaceParams {
    pub project_path: PathBuf,
    pub branch_name: String,
    pub trunk_branch: String,
    /// Directory (and workspace) name of the new workspace
    pub directory_name: String,
    pub init_logger: Arc<dyn InitLogger>,
    pub abort: Option<AbortSignal>,
}

impl CreateWorkspaceParams {
    pub fn new(project_path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            project_path: project_path.into(),
            branch_name: name.clone(),
            trunk_branch: "main".to_string(),
            directory_name: name,
            init_logger: null_logger(),
            abort: None,
        }
    }

    pub fn trunk(mut self, trunk: impl Into<String>) -> Self {
        self.trunk_branch = trunk.into();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = branch.into();
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorkspace {
    pub workspace_path: PathBuf,
}

#[derive(Clone)]
pub struct DeleteWorkspaceParams {
    pub project_path: PathBuf,
    pub workspace_path: PathBuf,
    pub branch_name: String,
    /// Skip safety checks such as uncommitted changes
    pub force: bool,
    pub abort: Option<AbortSignal>,
}

#[derive(Clone)]
pub struct RenameWorkspaceParams {
    pub project_path: PathBuf,
    pub old_name: String,
    pub new_name: String,
    pub abort: Option<AbortSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedWorkspace {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

#[derive(Clone)]
pub struct ForkWorkspaceParams {
    pub project_path: PathBuf,
    pub source_workspace_name: String,
    pub new_workspace_name: String,
    pub init_logger: Arc<dyn InitLogger>,
    pub abort: Option<AbortSignal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForkedWorkspace {
    pub workspace_path: PathBuf,
    /// Branch the source workspace was on, when the backend can tell
    pub source_branch: Option<String>,
    /// Replacement for the source workspace's persisted config
    pub source_config_update: Option<RuntimeConfig>,
}

// ============================================================================
// Runtime trait
// ============================================================================

/// Execution backend - implement to add a new workspace kind
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn capabilities(&self) -> Capabilities;

    /// Config this handle was built from
    fn config(&self) -> &RuntimeConfig;

    /// Path of the bound workspace in the backend's namespace
    fn workspace_path(&self) -> PathBuf;

    /// Run a shell command line
    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecHandle>;

    /// Stream a file; a leading `~` is the backend's home directory
    async fn read_file(&self, path: &str, abort: Option<&AbortSignal>) -> Result<ByteStream>;

    /// Open a sink whose `commit()` replaces `path` atomically
    async fn write_file(&self, path: &str, abort: Option<&AbortSignal>)
        -> Result<Box<dyn FileSink>>;

    /// `Error::NotFound` when absent
    async fn stat(&self, path: &str, abort: Option<&AbortSignal>) -> Result<FileStat>;

    /// Where a workspace named `workspace_name` of `project_path` lives
    fn get_workspace_path(&self, project_path: &Path, workspace_name: &str) -> PathBuf;

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> LifecycleResult<CreatedWorkspace>;

    async fn delete_workspace(&self, params: DeleteWorkspaceParams) -> LifecycleResult<()>;

    async fn rename_workspace(
        &self,
        params: RenameWorkspaceParams,
    ) -> LifecycleResult<RenamedWorkspace>;

    /// Cheap backend-native duplication. Backends that cannot fork return a
    /// recoverable failure.
    async fn fork_workspace(&self, params: ForkWorkspaceParams)
        -> LifecycleResult<ForkedWorkspace>;
}

/// Project directory name used to namespace workspaces
pub fn project_name(project_path: &Path) -> String {
    project_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}
