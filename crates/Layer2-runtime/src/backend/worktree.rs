//! Worktree runtime - one `git worktree` per workspace
//!
//! Layout: `<src_dir>/<project>/<workspace>`. Every workspace gets its own
//! branch; ignored files selected by the ignore-sync file are copied in after
//! create and fork.

use crate::backend::local::exec_in;
use crate::config::RuntimeConfig;
use crate::file::{self, ByteStream, FileSink, LocalFileSink};
use crate::git::{Git, GitError};
use crate::ignore_sync::sync_ignored_files;
use crate::runtime::{
    project_name, Capabilities, CreateWorkspaceParams, CreatedWorkspace, DeleteWorkspaceParams,
    ExecOptions, FileStat, ForkWorkspaceParams, ForkedWorkspace, LifecycleFailure,
    LifecycleResult, RenameWorkspaceParams, RenamedWorkspace, Runtime, RuntimeKind,
};
use anvil_foundation::{AbortSignal, Result};
use anvil_process::ExecHandle;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn git_failure(action: &str, err: GitError) -> LifecycleFailure {
    match err {
        GitError::Aborted => LifecycleFailure::recoverable(format!("{} aborted", action)),
        other => LifecycleFailure::recoverable(format!("{} failed: {}", action, other)),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

pub struct WorktreeRuntime {
    config: RuntimeConfig,
    src_dir: PathBuf,
    project_path: PathBuf,
    workspace_name: String,
    ignore_file: String,
}

impl WorktreeRuntime {
    pub fn new(
        src_dir: impl Into<PathBuf>,
        project_path: impl Into<PathBuf>,
        workspace_name: impl Into<String>,
    ) -> Self {
        let src_dir = src_dir.into();
        Self {
            config: RuntimeConfig::Worktree {
                src_dir: Some(src_dir.clone()),
            },
            src_dir,
            project_path: project_path.into(),
            workspace_name: workspace_name.into(),
            ignore_file: anvil_foundation::config::DEFAULT_IGNORE_SYNC_FILE.to_string(),
        }
    }

    pub fn with_ignore_file(mut self, file_name: impl Into<String>) -> Self {
        self.ignore_file = file_name.into();
        self
    }

    fn path_for(&self, project_path: &Path, workspace_name: &str) -> PathBuf {
        self.src_dir
            .join(project_name(project_path))
            .join(workspace_name)
    }

    fn project_git(&self, project_path: &Path, abort: Option<AbortSignal>) -> Git {
        Git::new(project_path).with_abort(abort)
    }
}

#[async_trait]
impl Runtime for WorktreeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Worktree
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_fork: true,
            supports_tilde_expansion: true,
            isolated: true,
        }
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn workspace_path(&self) -> PathBuf {
        self.path_for(&self.project_path, &self.workspace_name)
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecHandle> {
        exec_in(&self.workspace_path(), command, options)
    }

    async fn read_file(&self, path: &str, _abort: Option<&AbortSignal>) -> Result<ByteStream> {
        file::local_read(&file::resolve_local(&self.workspace_path(), path)).await
    }

    async fn write_file(
        &self,
        path: &str,
        _abort: Option<&AbortSignal>,
    ) -> Result<Box<dyn FileSink>> {
        let target = file::resolve_local(&self.workspace_path(), path);
        Ok(Box::new(LocalFileSink::open(target).await?))
    }

    async fn stat(&self, path: &str, _abort: Option<&AbortSignal>) -> Result<FileStat> {
        file::local_stat(&file::resolve_local(&self.workspace_path(), path)).await
    }

    fn get_workspace_path(&self, project_path: &Path, workspace_name: &str) -> PathBuf {
        self.path_for(project_path, workspace_name)
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> LifecycleResult<CreatedWorkspace> {
        let logger = &params.init_logger;
        let git = self.project_git(&params.project_path, params.abort.clone());
        if !git.is_repository().await {
            return Err(LifecycleFailure::recoverable(format!(
                "{} is not a git repository",
                params.project_path.display()
            )));
        }

        let dest = self.path_for(&params.project_path, &params.directory_name);
        if exists(&dest).await {
            return Err(LifecycleFailure::recoverable(format!(
                "workspace directory {} already exists",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LifecycleFailure::recoverable(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let branch_exists = git
            .branch_exists(&params.branch_name)
            .await
            .map_err(|e| git_failure("git show-ref", e))?;
        if branch_exists {
            logger.log_step(&format!("Checking out existing branch {}", params.branch_name));
            git.worktree_add_existing(&dest, &params.branch_name)
                .await
                .map_err(|e| git_failure("git worktree add", e))?;
        } else {
            let start = if git.resolves(&params.trunk_branch).await {
                params.trunk_branch.clone()
            } else {
                logger.log_step(&format!(
                    "Trunk {} not found, branching from HEAD",
                    params.trunk_branch
                ));
                "HEAD".to_string()
            };
            logger.log_step(&format!(
                "Creating branch {} from {}",
                params.branch_name, start
            ));
            git.worktree_add_new(&dest, &params.branch_name, &start)
                .await
                .map_err(|e| git_failure("git worktree add", e))?;
        }

        logger.log_step("Copying ignored files");
        let report = sync_ignored_files(&params.project_path, &dest, &self.ignore_file).await;
        for copied in &report.copied {
            logger.log_stdout(&format!("copied {}", copied.display()));
        }

        info!(path = %dest.display(), branch = %params.branch_name, "worktree created");
        Ok(CreatedWorkspace {
            workspace_path: dest,
        })
    }

    async fn delete_workspace(&self, params: DeleteWorkspaceParams) -> LifecycleResult<()> {
        if params.workspace_path == params.project_path {
            return Err(LifecycleFailure::recoverable(
                "refusing to delete the project directory",
            ));
        }

        let git = self.project_git(&params.project_path, params.abort.clone());
        if !exists(&params.workspace_path).await {
            debug!(path = %params.workspace_path.display(), "worktree already gone, pruning");
            return git
                .worktree_prune()
                .await
                .map_err(|e| git_failure("git worktree prune", e));
        }

        match git.worktree_remove(&params.workspace_path, params.force).await {
            Ok(()) => {
                info!(path = %params.workspace_path.display(), "worktree removed");
                Ok(())
            }
            Err(GitError::DirtyWorkingTree) => Err(LifecycleFailure::recoverable(format!(
                "{} has uncommitted changes; delete with force to discard them",
                params.workspace_path.display()
            ))),
            Err(e) => Err(git_failure("git worktree remove", e)),
        }
    }

    async fn rename_workspace(
        &self,
        params: RenameWorkspaceParams,
    ) -> LifecycleResult<RenamedWorkspace> {
        let old_path = self.path_for(&params.project_path, &params.old_name);
        let new_path = self.path_for(&params.project_path, &params.new_name);
        if !exists(&old_path).await {
            return Err(LifecycleFailure::recoverable(format!(
                "workspace {} not found",
                old_path.display()
            )));
        }
        if exists(&new_path).await {
            return Err(LifecycleFailure::fatal(format!(
                "{} already exists",
                new_path.display()
            )));
        }

        self.project_git(&params.project_path, params.abort.clone())
            .worktree_move(&old_path, &new_path)
            .await
            .map_err(|e| git_failure("git worktree move", e))?;
        Ok(RenamedWorkspace { old_path, new_path })
    }

    async fn fork_workspace(
        &self,
        params: ForkWorkspaceParams,
    ) -> LifecycleResult<ForkedWorkspace> {
        let logger = &params.init_logger;
        let source = self.path_for(&params.project_path, &params.source_workspace_name);
        let dest = self.path_for(&params.project_path, &params.new_workspace_name);

        if !exists(&source).await {
            return Err(LifecycleFailure::recoverable(format!(
                "source workspace {} not found",
                source.display()
            )));
        }
        if exists(&dest).await {
            return Err(LifecycleFailure::fatal(format!(
                "destination {} already exists",
                dest.display()
            )));
        }

        let source_git = Git::new(&source).with_abort(params.abort.clone());
        if source_git
            .branch_exists(&params.new_workspace_name)
            .await
            .map_err(|e| git_failure("git show-ref", e))?
        {
            return Err(LifecycleFailure::fatal(format!(
                "branch {} already exists",
                params.new_workspace_name
            )));
        }

        let head = source_git
            .head_commit()
            .await
            .map_err(|e| git_failure("git rev-parse", e))?;
        let source_branch = source_git.current_branch().await.ok().flatten();

        logger.log_step(&format!(
            "Forking {} at {} into branch {}",
            params.source_workspace_name,
            &head[..head.len().min(12)],
            params.new_workspace_name
        ));
        source_git
            .worktree_add_new(&dest, &params.new_workspace_name, &head)
            .await
            .map_err(|e| git_failure("git worktree add", e))?;

        logger.log_step("Copying ignored files");
        sync_ignored_files(&source, &dest, &self.ignore_file).await;

        info!(
            source = %source.display(),
            dest = %dest.display(),
            "worktree forked"
        );
        Ok(ForkedWorkspace {
            workspace_path: dest,
            source_branch,
            source_config_update: None,
        })
    }
}
