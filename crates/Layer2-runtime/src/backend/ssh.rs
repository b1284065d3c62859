//! SSH runtime - workspaces on a remote host, driven through the system `ssh`
//!
//! Remote layout mirrors the worktree backend: `<src_dir>/<project>/<name>`.
//! Project content travels as a `git bundle` over stdin. Interactive prompts
//! (host key, passwords) go through the askpass bridge when a broker is
//! attached; without one ssh runs in batch mode and fails instead of hanging.

use super::remote::{self, quote, quote_path, RemoteShell};
use crate::askpass::AskpassBridge;
use crate::config::{RuntimeConfig, DEFAULT_SSH_SRC_DIR};
use crate::file::{ByteStream, FileSink};
use crate::runtime::{
    project_name, Capabilities, CreateWorkspaceParams, CreatedWorkspace, DeleteWorkspaceParams,
    ExecOptions, FileStat, ForkWorkspaceParams, ForkedWorkspace, LifecycleFailure,
    LifecycleResult, RenameWorkspaceParams, RenamedWorkspace, Runtime, RuntimeKind,
};
use anvil_foundation::{
    AbortSignal, PromptBroker, PromptPolicy, PromptRequest, PromptSession, Result,
};
use anvil_process::{
    collect_output, spawn_exec, DeadlineExtender, ExecHandle, ExecOutput, ExecRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SshRuntime {
    config: RuntimeConfig,
    host: String,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    src_dir: String,
    project_path: PathBuf,
    workspace_name: String,
    connect_timeout: Duration,
    prompts: Option<(Arc<PromptBroker>, PromptPolicy)>,
    bridge: Mutex<Option<Arc<AskpassBridge>>>,
    /// Moves exec timeouts back while a prompt waits for the user
    prompt_deadline: DeadlineExtender,
}

impl SshRuntime {
    pub fn new(
        host: impl Into<String>,
        project_path: impl Into<PathBuf>,
        workspace_name: impl Into<String>,
    ) -> Self {
        let host = host.into();
        Self {
            config: RuntimeConfig::ssh(host.clone()),
            host,
            port: None,
            identity_file: None,
            src_dir: DEFAULT_SSH_SRC_DIR.to_string(),
            project_path: project_path.into(),
            workspace_name: workspace_name.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            prompts: None,
            bridge: Mutex::new(None),
            prompt_deadline: DeadlineExtender::new(),
        }
    }

    /// Build from a persisted `RuntimeConfig::Ssh`
    pub fn from_config(
        config: &RuntimeConfig,
        project_path: impl Into<PathBuf>,
        workspace_name: impl Into<String>,
    ) -> Option<Self> {
        let RuntimeConfig::Ssh {
            host,
            port,
            identity_file,
            src_dir,
        } = config
        else {
            return None;
        };
        let mut runtime = Self::new(host.clone(), project_path, workspace_name);
        runtime.port = *port;
        runtime.identity_file = identity_file.clone();
        if let Some(src_dir) = src_dir {
            runtime.src_dir = src_dir.clone();
        }
        runtime.config = config.clone();
        Some(runtime)
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Route interactive prompts through `broker` under `policy`
    pub fn prompts(mut self, broker: Arc<PromptBroker>, policy: PromptPolicy) -> Self {
        self.prompts = Some((broker, policy));
        self
    }

    /// `host:port`, the identity used to dedupe host-key prompts
    pub fn dedupe_key(&self) -> String {
        let host = self
            .host
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or(&self.host);
        format!("{}:{}", host.to_ascii_lowercase(), self.port.unwrap_or(22))
    }

    fn remote_path(&self, project_path: &Path, workspace_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.src_dir.trim_end_matches('/'),
            project_name(project_path),
            workspace_name
        )
    }

    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if self.prompts.is_none() {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        if let Some(port) = self.port {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(identity) = &self.identity_file {
            args.extend(["-i".to_string(), identity.to_string_lossy().into_owned()]);
        }
        args.push("--".to_string());
        args.push(self.host.clone());
        args
    }

    fn bridge(&self) -> Result<Option<Arc<AskpassBridge>>> {
        let Some((broker, policy)) = &self.prompts else {
            return Ok(None);
        };
        let mut slot = self.bridge.lock();
        if let Some(bridge) = slot.as_ref() {
            return Ok(Some(Arc::clone(bridge)));
        }
        let extender = self.prompt_deadline.clone();
        let answer_window = policy.response_timeout;
        let session = Arc::new(
            PromptSession::new(Arc::clone(broker), policy.clone())
                .with_session_id(format!("ssh:{}", self.dedupe_key()))
                .on_prompt_started(Arc::new(move |request: &PromptRequest| {
                    debug!(
                        request_id = %request.request_id,
                        kind = %request.kind,
                        "ssh prompt shown, extending exec deadline"
                    );
                    extender.extend(answer_window);
                })),
        );
        let bridge = Arc::new(AskpassBridge::start(session, self.dedupe_key())?);
        *slot = Some(Arc::clone(&bridge));
        Ok(Some(bridge))
    }

    async fn run(
        &self,
        script: &str,
        stdin: Option<Vec<u8>>,
        abort: Option<&AbortSignal>,
    ) -> LifecycleResult<ExecOutput> {
        let result = match self.bridge() {
            Ok(Some(bridge)) => self.run_with_context(&bridge, script, stdin, abort).await,
            Ok(None) => remote::run_script(self, script, stdin, abort).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| LifecycleFailure::recoverable(format!("ssh {} failed: {}", self.host, e)))
    }

    /// Buffered run that also feeds ssh's stderr to the askpass bridge, so
    /// host-key prompts see the banner printed before them
    async fn run_with_context(
        &self,
        bridge: &AskpassBridge,
        script: &str,
        stdin: Option<Vec<u8>>,
        abort: Option<&AbortSignal>,
    ) -> Result<ExecOutput> {
        let request = self.shell_request(script)?.abort_opt(abort.cloned());
        let mut handle = spawn_exec(request)?;
        let stderr = handle.stderr.take();
        let released = handle.released();

        let (output, stderr) = tokio::join!(
            collect_output(handle, stdin),
            tee_stderr(stderr, bridge, &released)
        );
        let mut output = output?;
        output.stderr = stderr;
        Ok(output)
    }
}

async fn tee_stderr(
    stderr: Option<tokio::process::ChildStderr>,
    bridge: &AskpassBridge,
    released: &AbortSignal,
) -> String {
    let mut collected = Vec::new();
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut chunk = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = stderr.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    bridge.note_stderr(&String::from_utf8_lossy(&chunk[..n]));
                    collected.extend_from_slice(&chunk[..n]);
                }
                Err(e) => {
                    debug!("ssh stderr closed: {}", e);
                    break;
                }
            },
            _ = released.cancelled() => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

impl RemoteShell for SshRuntime {
    fn shell_request(&self, script: &str) -> Result<ExecRequest> {
        let mut request = ExecRequest::new("ssh")
            .args(self.ssh_args())
            .arg(format!("sh -c {}", quote(script)?));
        if let Some(bridge) = self.bridge()? {
            request = request
                .envs(bridge.env())
                .deadline_extender(self.prompt_deadline.clone());
        }
        Ok(request)
    }
}

#[async_trait]
impl Runtime for SshRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Ssh
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
        PathBuf::from(self.remote_path(&self.project_path, &self.workspace_name))
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecHandle> {
        let cwd = self.remote_path(&self.project_path, &self.workspace_name);
        let script = remote::exec_script(command, &cwd, &options)?;
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

    fn get_workspace_path(&self, project_path: &Path, workspace_name: &str) -> PathBuf {
        PathBuf::from(self.remote_path(project_path, workspace_name))
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> LifecycleResult<CreatedWorkspace> {
        let logger = &params.init_logger;
        let abort = params.abort.as_ref();
        let dest = self.remote_path(&params.project_path, &params.directory_name);

        logger.log_step("Bundling project");
        let bytes = remote::bundle_project(&params.project_path, params.abort.clone()).await?;

        let script =
            remote::clone_bundle_script(&dest, &params.branch_name, &params.trunk_branch, true)
                .map_err(|e| LifecycleFailure::recoverable(e.to_string()))?;
        logger.log_step(&format!("Cloning into {}:{}", self.host, dest));
        let out = self.run(&script, Some(bytes), abort).await?;
        for line in out.stderr.lines() {
            logger.log_stderr(line);
        }
        if !out.success() {
            return Err(remote::lifecycle_failure("remote clone", &out));
        }

        info!(host = %self.host, path = %dest, "ssh workspace created");
        Ok(CreatedWorkspace {
            workspace_path: PathBuf::from(dest),
        })
    }

    async fn delete_workspace(&self, params: DeleteWorkspaceParams) -> LifecycleResult<()> {
        let path = params.workspace_path.to_string_lossy();
        let script = format!(
            r#"ws={ws}
[ -e "$ws" ] || exit 0
if [ "{force}" != 1 ] && [ -n "$(git -C "$ws" status --porcelain 2>/dev/null)" ]; then
  echo "$ws has uncommitted changes; delete with force to discard them" >&2
  exit 1
fi
rm -rf "$ws""#,
            ws = quote_path(&path).map_err(|e| LifecycleFailure::recoverable(e.to_string()))?,
            force = if params.force { 1 } else { 0 },
        );
        let out = self.run(&script, None, params.abort.as_ref()).await?;
        if !out.success() {
            return Err(remote::lifecycle_failure("remote delete", &out));
        }
        debug!(host = %self.host, path = %path, "ssh workspace deleted");
        Ok(())
    }

    async fn rename_workspace(
        &self,
        params: RenameWorkspaceParams,
    ) -> LifecycleResult<RenamedWorkspace> {
        let old_path = self.remote_path(&params.project_path, &params.old_name);
        let new_path = self.remote_path(&params.project_path, &params.new_name);
        let quoted = |p: &str| quote_path(p).map_err(|e| LifecycleFailure::recoverable(e.to_string()));
        let script = format!(
            r#"old={old}; new={new}
[ -e "$old" ] || {{ echo "$old not found" >&2; exit 4; }}
[ -e "$new" ] && {{ echo "$new already exists" >&2; exit 3; }}
mv "$old" "$new""#,
            old = quoted(&old_path)?,
            new = quoted(&new_path)?,
        );
        let out = self.run(&script, None, params.abort.as_ref()).await?;
        if !out.success() {
            return Err(remote::lifecycle_failure("remote rename", &out));
        }
        Ok(RenamedWorkspace {
            old_path: PathBuf::from(old_path),
            new_path: PathBuf::from(new_path),
        })
    }

    async fn fork_workspace(
        &self,
        params: ForkWorkspaceParams,
    ) -> LifecycleResult<ForkedWorkspace> {
        let source = self.remote_path(&params.project_path, &params.source_workspace_name);
        let dest = self.remote_path(&params.project_path, &params.new_workspace_name);
        let script = fork_script(&source, &dest, &params.new_workspace_name)
            .map_err(|e| LifecycleFailure::recoverable(e.to_string()))?;

        params
            .init_logger
            .log_step(&format!("Copying {} to {}", source, dest));
        let out = self.run(&script, None, params.abort.as_ref()).await?;
        if !out.success() {
            return Err(remote::lifecycle_failure("remote fork", &out));
        }

        let source_branch = out
            .stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|b| !b.is_empty() && *b != "HEAD")
            .map(str::to_string);
        Ok(ForkedWorkspace {
            workspace_path: PathBuf::from(dest),
            source_branch,
            source_config_update: None,
        })
    }
}

/// Copy `source` to `dest`, branch it, and print the source branch
pub(crate) fn fork_script(source: &str, dest: &str, new_branch: &str) -> Result<String> {
    Ok(format!(
        r#"src={src}; dst={dst}
[ -d "$src" ] || {{ echo "source workspace $src not found" >&2; exit 4; }}
[ -e "$dst" ] && {{ echo "$dst already exists" >&2; exit 3; }}
branch="$(git -C "$src" rev-parse --abbrev-ref HEAD 2>/dev/null || true)"
cp -a "$src" "$dst" || {{ rm -rf "$dst"; echo "copy failed" >&2; exit 1; }}
git -C "$dst" checkout -q -b {branch} || exit 5
printf '%s\n' "$branch""#,
        src = quote_path(source)?,
        dst = quote_path(dest)?,
        branch = quote(new_branch)?,
    ))
}
