//! Docker runtime - one container per workspace
//!
//! Containers idle on `sleep infinity` with the project cloned into `/src`.
//! Container lifecycle goes through the Docker API (bollard); commands and
//! file I/O go through `docker exec -i ... sh -c`.

use super::remote::{self, RemoteShell};
use crate::config::{container_name_for, RuntimeConfig};
use crate::file::{ByteStream, FileSink};
use crate::runtime::{
    Capabilities, CreateWorkspaceParams, CreatedWorkspace, DeleteWorkspaceParams, ExecOptions,
    FileStat, ForkWorkspaceParams, ForkedWorkspace, InitLogger, LifecycleFailure,
    LifecycleResult, RenameWorkspaceParams, RenamedWorkspace, Runtime, RuntimeKind,
};
use anvil_foundation::{AbortSignal, Error, Result};
use anvil_process::{ExecHandle, ExecOutput, ExecRequest};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    RenameContainerOptions, StartContainerOptions,
};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::Docker;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Workspace directory inside every container
pub const CONTAINER_WORKDIR: &str = "/src";

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    status_code(err) == Some(404)
}

/// `docker exec -i <container> sh -c <script>`
struct ContainerShell<'a> {
    container: &'a str,
}

impl RemoteShell for ContainerShell<'_> {
    fn shell_request(&self, script: &str) -> Result<ExecRequest> {
        Ok(ExecRequest::new("docker")
            .args(["exec", "-i", self.container, "sh", "-c"])
            .arg(script))
    }
}

pub struct DockerRuntime {
    docker: Docker,
    config: RuntimeConfig,
    image: String,
    container_name: String,
    project_path: PathBuf,
    workspace_name: String,
}

impl DockerRuntime {
    /// Bind to the container of `workspace_name`.
    ///
    /// Legacy configs without a container name get the derived one.
    pub fn new(
        config: &RuntimeConfig,
        project_path: impl Into<PathBuf>,
        workspace_name: impl Into<String>,
    ) -> Result<Self> {
        let project_path = project_path.into();
        let workspace_name = workspace_name.into();
        let RuntimeConfig::Docker { image, .. } = config else {
            return Err(Error::invalid_input("not a docker runtime config"));
        };
        let container_name = config
            .resolved_container_name(&project_path, &workspace_name)
            .ok_or_else(|| Error::Internal("docker config without container name".into()))?;
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Runtime(format!("failed to connect to Docker: {}", e)))?;

        Ok(Self {
            docker,
            config: config.clone(),
            image: image.clone(),
            container_name,
            project_path,
            workspace_name,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Container of another workspace of the same project
    fn container_for(&self, project_path: &Path, workspace_name: &str) -> String {
        if project_path == self.project_path && workspace_name == self.workspace_name {
            self.container_name.clone()
        } else {
            container_name_for(project_path, workspace_name)
        }
    }

    fn shell(&self) -> ContainerShell<'_> {
        ContainerShell {
            container: &self.container_name,
        }
    }

    async fn container_exists(&self, name: &str) -> std::result::Result<bool, LifecycleFailure> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(LifecycleFailure::recoverable(format!(
                "failed to inspect container {}: {}",
                name, e
            ))),
        }
    }

    async fn ensure_image(&self, image: &str, logger: &dyn InitLogger) -> LifecycleResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        logger.log_step(&format!("Pulling image {}", image));
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map(drop)
            .map_err(|e| LifecycleFailure::recoverable(format!("failed to pull {}: {}", image, e)))
    }

    async fn create_and_start(
        &self,
        name: &str,
        image: &str,
        workspace_name: &str,
    ) -> LifecycleResult<()> {
        let mut labels = HashMap::new();
        labels.insert(
            "anvil.project".to_string(),
            self.project_path.to_string_lossy().into_owned(),
        );
        labels.insert("anvil.workspace".to_string(), workspace_name.to_string());

        let config = Config {
            image: Some(image.to_string()),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            labels: Some(labels),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                LifecycleFailure::recoverable(format!("failed to create container {}: {}", name, e))
            })?;

        if let Err(e) = self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            self.rollback(name).await?;
            return Err(LifecycleFailure::recoverable(format!(
                "failed to start container {}: {}",
                name, e
            )));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> std::result::Result<(), bollard::errors::Error> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other,
        }
    }

    /// Remove a half-built container; a leftover container is fatal
    async fn rollback(&self, name: &str) -> LifecycleResult<()> {
        self.remove(name).await.map_err(|e| {
            warn!(container = %name, "rollback failed: {}", e);
            LifecycleFailure::fatal(format!(
                "container {} was left behind after a failed operation: {}",
                name, e
            ))
        })
    }

    async fn run_in(
        &self,
        container: &str,
        script: &str,
        stdin: Option<Vec<u8>>,
        abort: Option<&AbortSignal>,
    ) -> LifecycleResult<ExecOutput> {
        remote::run_script(&ContainerShell { container }, script, stdin, abort)
            .await
            .map_err(|e| LifecycleFailure::recoverable(format!("docker exec failed: {}", e)))
    }
}

impl RemoteShell for DockerRuntime {
    fn shell_request(&self, script: &str) -> Result<ExecRequest> {
        self.shell().shell_request(script)
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
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
        PathBuf::from(CONTAINER_WORKDIR)
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecHandle> {
        let script = remote::exec_script(command, CONTAINER_WORKDIR, &options)?;
        remote::spawn_script(self, &script, &options)
    }

    async fn read_file(&self, path: &str, abort: Option<&AbortSignal>) -> Result<ByteStream> {
        remote::read_file(self, path, abort).await
    }

    async fn write_file(
        &self,
        path: &str,
        abort: Option<&AbortSignal>,
    ) -> Result<Box<dyn FileSink>> {
        remote::write_file(self, path, abort).await
    }

    async fn stat(&self, path: &str, abort: Option<&AbortSignal>) -> Result<FileStat> {
        remote::stat(self, path, abort).await
    }

    fn get_workspace_path(&self, _project_path: &Path, _workspace_name: &str) -> PathBuf {
        PathBuf::from(CONTAINER_WORKDIR)
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> LifecycleResult<CreatedWorkspace> {
        let logger = params.init_logger.as_ref();
        let name = self.container_for(&params.project_path, &params.directory_name);

        if self.container_exists(&name).await? {
            return Err(LifecycleFailure::recoverable(format!(
                "container {} already exists",
                name
            )));
        }

        logger.log_step("Bundling project");
        let bundle = remote::bundle_project(&params.project_path, params.abort.clone()).await?;

        self.ensure_image(&self.image, logger).await?;
        logger.log_step(&format!("Starting container {}", name));
        self.create_and_start(&name, &self.image, &params.directory_name)
            .await?;

        let script = remote::clone_bundle_script(
            CONTAINER_WORKDIR,
            &params.branch_name,
            &params.trunk_branch,
            false,
        )
        .map_err(|e| LifecycleFailure::recoverable(e.to_string()))?;
        logger.log_step(&format!("Cloning project into {}", name));
        let out = self
            .run_in(&name, &script, Some(bundle), params.abort.as_ref())
            .await;
        let failure = match out {
            Ok(out) if out.success() => None,
            Ok(out) => Some(remote::lifecycle_failure("clone into container", &out)),
            Err(failure) => Some(failure),
        };
        if let Some(failure) = failure {
            self.rollback(&name).await?;
            return Err(LifecycleFailure::recoverable(failure.error));
        }

        info!(container = %name, "docker workspace created");
        Ok(CreatedWorkspace {
            workspace_path: PathBuf::from(CONTAINER_WORKDIR),
        })
    }

    async fn delete_workspace(&self, params: DeleteWorkspaceParams) -> LifecycleResult<()> {
        let name = self.container_name.clone();
        if !params.force {
            let status = self
                .run_in(
                    &name,
                    "git -C /src status --porcelain 2>/dev/null",
                    None,
                    params.abort.as_ref(),
                )
                .await;
            if let Ok(out) = status {
                if out.success() && !out.stdout.trim().is_empty() {
                    return Err(LifecycleFailure::recoverable(format!(
                        "container {} has uncommitted changes; delete with force to discard them",
                        name
                    )));
                }
            }
        }

        self.remove(&name).await.map_err(|e| {
            LifecycleFailure::recoverable(format!("failed to remove container {}: {}", name, e))
        })?;
        debug!(container = %name, "docker workspace deleted");
        Ok(())
    }

    async fn rename_workspace(
        &self,
        params: RenameWorkspaceParams,
    ) -> LifecycleResult<RenamedWorkspace> {
        let old = self.container_for(&params.project_path, &params.old_name);
        let new = container_name_for(&params.project_path, &params.new_name);

        match self
            .docker
            .rename_container(&old, RenameContainerOptions { name: new.clone() })
            .await
        {
            Ok(()) => Ok(RenamedWorkspace {
                old_path: PathBuf::from(CONTAINER_WORKDIR),
                new_path: PathBuf::from(CONTAINER_WORKDIR),
            }),
            Err(e) if is_not_found(&e) => Err(LifecycleFailure::recoverable(format!(
                "container {} not found",
                old
            ))),
            Err(e) if status_code(&e) == Some(409) => Err(LifecycleFailure::fatal(format!(
                "container {} already exists",
                new
            ))),
            Err(e) => Err(LifecycleFailure::recoverable(format!(
                "failed to rename container {}: {}",
                old, e
            ))),
        }
    }

    async fn fork_workspace(
        &self,
        params: ForkWorkspaceParams,
    ) -> LifecycleResult<ForkedWorkspace> {
        let logger = params.init_logger.as_ref();
        let abort = params.abort.as_ref();
        let source = self.container_for(&params.project_path, &params.source_workspace_name);
        let dest = container_name_for(&params.project_path, &params.new_workspace_name);

        if !self.container_exists(&source).await? {
            return Err(LifecycleFailure::recoverable(format!(
                "source container {} not found",
                source
            )));
        }
        if self.container_exists(&dest).await? {
            return Err(LifecycleFailure::fatal(format!(
                "container {} already exists",
                dest
            )));
        }

        let source_branch = match self
            .run_in(&source, "git -C /src rev-parse --abbrev-ref HEAD", None, abort)
            .await
        {
            Ok(out) if out.success() => Some(out.stdout.trim().to_string())
                .filter(|b| !b.is_empty() && b != "HEAD"),
            _ => None,
        };

        logger.log_step(&format!("Snapshotting {}", source));
        let snapshot = CommitContainerOptions {
            container: source.clone(),
            repo: dest.clone(),
            tag: "fork".to_string(),
            pause: true,
            ..Default::default()
        };
        self.docker
            .commit_container(snapshot, Config::<String>::default())
            .await
            .map_err(|e| {
                LifecycleFailure::recoverable(format!("failed to snapshot {}: {}", source, e))
            })?;

        let image = format!("{}:fork", dest);
        logger.log_step(&format!("Starting container {}", dest));
        self.create_and_start(&dest, &image, &params.new_workspace_name)
            .await?;

        let script = format!(
            "git -C /src checkout -q -b {}",
            remote::quote(&params.new_workspace_name)
                .map_err(|e| LifecycleFailure::recoverable(e.to_string()))?
        );
        match self.run_in(&dest, &script, None, abort).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                let failure = remote::lifecycle_failure("branch in forked container", &out);
                self.rollback(&dest).await?;
                return Err(LifecycleFailure::recoverable(failure.error));
            }
            Err(failure) => {
                self.rollback(&dest).await?;
                return Err(failure);
            }
        }

        let source_config_update = match &self.config {
            RuntimeConfig::Docker {
                container_name: None,
                ..
            } if source == self.container_name => Some(
                self.config
                    .for_workspace(&params.project_path, &params.source_workspace_name),
            ),
            _ => None,
        };

        info!(source = %source, dest = %dest, "docker workspace forked");
        Ok(ForkedWorkspace {
            workspace_path: PathBuf::from(CONTAINER_WORKDIR),
            source_branch,
            source_config_update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(config: RuntimeConfig) -> Option<DockerRuntime> {
        match DockerRuntime::new(&config, "/code/app", "main") {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                eprintln!("docker client unavailable, skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_shell_request_shape() {
        let shell = ContainerShell {
            container: "anvil-app-main-0000",
        };
        let request = shell.shell_request("ls -la").unwrap();
        assert_eq!(request.program, "docker");
        assert_eq!(
            request.args,
            vec!["exec", "-i", "anvil-app-main-0000", "sh", "-c", "ls -la"]
        );
    }

    #[test]
    fn test_legacy_config_gets_derived_name() {
        let Some(runtime) = runtime(RuntimeConfig::docker("ubuntu:22.04")) else {
            return;
        };
        assert_eq!(
            runtime.container_name(),
            container_name_for(Path::new("/code/app"), "main")
        );
        assert_eq!(runtime.workspace_path(), PathBuf::from("/src"));
    }

    #[test]
    fn test_explicit_container_name_wins_for_bound_workspace() {
        let config = RuntimeConfig::Docker {
            image: "ubuntu:22.04".into(),
            container_name: Some("custom".into()),
        };
        let Some(runtime) = runtime(config) else {
            return;
        };
        assert_eq!(runtime.container_for(Path::new("/code/app"), "main"), "custom");
        assert_eq!(
            runtime.container_for(Path::new("/code/app"), "other"),
            container_name_for(Path::new("/code/app"), "other")
        );
    }

    #[test]
    fn test_rejects_other_kinds() {
        assert!(DockerRuntime::new(&RuntimeConfig::Local, "/p", "w").is_err());
    }

    #[test]
    fn test_not_found_detection() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(is_not_found(&err));
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "Conflict".into(),
        };
        assert_eq!(status_code(&conflict), Some(409));
        assert!(!is_not_found(&conflict));
    }
}
