//! Runtime factory - persisted config + workspace identity -> bound runtime

use crate::backend::{DockerRuntime, LocalRuntime, SshRuntime, WorktreeRuntime};
use crate::config::RuntimeConfig;
use crate::runtime::Runtime;
use anvil_foundation::{validate_workspace_id, AnvilConfig, Error, PromptBroker, PromptPolicy, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Identity a runtime is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    pub project_path: PathBuf,
    pub workspace_name: String,
}

impl RuntimeContext {
    pub fn new(project_path: impl Into<PathBuf>, workspace_name: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            workspace_name: workspace_name.into(),
        }
    }
}

/// Builds runtime handles; the seam tests replace with fakes
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, config: &RuntimeConfig, context: &RuntimeContext) -> Result<Arc<dyn Runtime>>;
}

/// Real backends, configured from `AnvilConfig`
pub struct DefaultRuntimeFactory {
    settings: AnvilConfig,
    prompts: Option<Arc<PromptBroker>>,
}

impl DefaultRuntimeFactory {
    pub fn new(settings: AnvilConfig) -> Self {
        Self {
            settings,
            prompts: None,
        }
    }

    /// Interactive SSH prompts are surfaced through `broker`
    pub fn with_prompts(mut self, broker: Arc<PromptBroker>) -> Self {
        self.prompts = Some(broker);
        self
    }

    pub fn settings(&self) -> &AnvilConfig {
        &self.settings
    }
}

impl RuntimeFactory for DefaultRuntimeFactory {
    fn create(&self, config: &RuntimeConfig, context: &RuntimeContext) -> Result<Arc<dyn Runtime>> {
        validate_workspace_id(&context.workspace_name)?;
        if context.project_path.as_os_str().is_empty() {
            return Err(Error::invalid_input("project path must not be empty"));
        }
        debug!(
            kind = %config.kind(),
            project = %context.project_path.display(),
            workspace = %context.workspace_name,
            "creating runtime"
        );

        let project = context.project_path.clone();
        let name = context.workspace_name.clone();
        let runtime: Arc<dyn Runtime> = match config {
            RuntimeConfig::Local => Arc::new(LocalRuntime::new(project)),
            RuntimeConfig::Worktree { src_dir } => {
                let src_dir = src_dir.clone().unwrap_or_else(|| self.settings.src_dir());
                Arc::new(
                    WorktreeRuntime::new(src_dir, project, name)
                        .with_ignore_file(self.settings.ignore_sync.file_name()),
                )
            }
            RuntimeConfig::Ssh { .. } => {
                let runtime = SshRuntime::from_config(config, project, name)
                    .ok_or_else(|| Error::Internal("ssh config mismatch".into()))?
                    .connect_timeout(self.settings.ssh.connect_timeout());
                let runtime = match &self.prompts {
                    Some(broker) => runtime.prompts(
                        Arc::clone(broker),
                        PromptPolicy::from_settings(&self.settings.prompts),
                    ),
                    None => runtime,
                };
                Arc::new(runtime)
            }
            RuntimeConfig::Docker { .. } => Arc::new(DockerRuntime::new(config, project, name)?),
        };
        Ok(runtime)
    }
}
