//! Local runtime - the workspace IS the project directory
//!
//! No isolation: every workspace name maps to the bound project path, so
//! delete and rename are deliberate no-ops and fork is unsupported.

use crate::config::RuntimeConfig;
use crate::file::{self, ByteStream, FileSink, LocalFileSink};
use crate::runtime::{
    Capabilities, CreateWorkspaceParams, CreatedWorkspace, DeleteWorkspaceParams, ExecOptions,
    FileStat, ForkWorkspaceParams, ForkedWorkspace, LifecycleFailure, LifecycleResult,
    RenameWorkspaceParams, RenamedWorkspace, Runtime, RuntimeKind,
};
use anvil_foundation::{AbortSignal, Result};
use anvil_process::{spawn_exec, ExecHandle, ExecRequest};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Spawn `command` through the local shell, rooted at `base`
pub(crate) fn exec_in(base: &Path, command: &str, options: ExecOptions) -> Result<ExecHandle> {
    let cwd = match &options.cwd {
        Some(cwd) => file::resolve_local(base, cwd),
        None => base.to_path_buf(),
    };
    spawn_exec(
        ExecRequest::shell(command)
            .cwd(cwd)
            .envs(options.env)
            .timeout_opt(options.timeout)
            .abort_opt(options.abort),
    )
}

pub struct LocalRuntime {
    config: RuntimeConfig,
    project_path: PathBuf,
}

impl LocalRuntime {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            config: RuntimeConfig::Local,
            project_path: project_path.into(),
        }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_fork: false,
            supports_tilde_expansion: true,
            isolated: false,
        }
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn workspace_path(&self) -> PathBuf {
        self.project_path.clone()
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecHandle> {
        exec_in(&self.project_path, command, options)
    }

    async fn read_file(&self, path: &str, _abort: Option<&AbortSignal>) -> Result<ByteStream> {
        file::local_read(&file::resolve_local(&self.project_path, path)).await
    }

    async fn write_file(
        &self,
        path: &str,
        _abort: Option<&AbortSignal>,
    ) -> Result<Box<dyn FileSink>> {
        let sink = LocalFileSink::open(file::resolve_local(&self.project_path, path)).await?;
        Ok(Box::new(sink))
    }

    async fn stat(&self, path: &str, _abort: Option<&AbortSignal>) -> Result<FileStat> {
        file::local_stat(&file::resolve_local(&self.project_path, path)).await
    }

    fn get_workspace_path(&self, _project_path: &Path, _workspace_name: &str) -> PathBuf {
        self.project_path.clone()
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> LifecycleResult<CreatedWorkspace> {
        match tokio::fs::metadata(&self.project_path).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(LifecycleFailure::recoverable(format!(
                    "project directory {} does not exist",
                    self.project_path.display()
                )))
            }
        }
        params
            .init_logger
            .log_step(&format!("Using project directory {}", self.project_path.display()));
        Ok(CreatedWorkspace {
            workspace_path: self.project_path.clone(),
        })
    }

    async fn delete_workspace(&self, params: DeleteWorkspaceParams) -> LifecycleResult<()> {
        info!(
            path = %params.workspace_path.display(),
            "local workspace is the project directory, leaving files in place"
        );
        Ok(())
    }

    async fn rename_workspace(
        &self,
        _params: RenameWorkspaceParams,
    ) -> LifecycleResult<RenamedWorkspace> {
        Ok(RenamedWorkspace {
            old_path: self.project_path.clone(),
            new_path: self.project_path.clone(),
        })
    }

    async fn fork_workspace(
        &self,
        _params: ForkWorkspaceParams,
    ) -> LifecycleResult<ForkedWorkspace> {
        Err(LifecycleFailure::recoverable(
            "local runtime does not support forking",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::null_logger;

    #[tokio::test]
    async fn test_paths_ignore_arguments() {
        let runtime = LocalRuntime::new("/code/app");
        assert_eq!(
            runtime.get_workspace_path(Path::new("/elsewhere"), "feature"),
            PathBuf::from("/code/app")
        );
        assert!(!runtime.capabilities().supports_fork);
    }

    #[tokio::test]
    async fn test_create_requires_project_dir() {
        let runtime = LocalRuntime::new("/definitely/missing/project");
        let failure = runtime
            .create_workspace(CreateWorkspaceParams::new("/definitely/missing/project", "w"))
            .await
            .unwrap_err();
        assert!(!failure.fatal);

        let dir = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let created = runtime
            .create_workspace(CreateWorkspaceParams::new(dir.path(), "w").logger(null_logger()))
            .await
            .unwrap();
        assert_eq!(created.workspace_path, dir.path());
    }

    #[tokio::test]
    async fn test_fork_is_recoverable() {
        let runtime = LocalRuntime::new("/p");
        let failure = runtime
            .fork_workspace(ForkWorkspaceParams {
                project_path: "/p".into(),
                source_workspace_name: "a".into(),
                new_workspace_name: "b".into(),
                init_logger: null_logger(),
                abort: None,
            })
            .await
            .unwrap_err();
        assert!(!failure.fatal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_runs_in_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let runtime = LocalRuntime::new(dir.path());

        let mut handle = runtime
            .exec("ls; echo $GREETING", ExecOptions::new().env("GREETING", "hi"))
            .await
            .unwrap();
        let mut stdout = handle.stdout.take().unwrap();
        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stdout, &mut out)
            .await
            .unwrap();
        assert!(handle.wait().await.unwrap().success());
        assert!(out.contains("marker"));
        assert!(out.contains("hi"));
    }
}
