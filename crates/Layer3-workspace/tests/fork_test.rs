//! Fork orchestration 통합 테스트 - fake runtime / factory / discovery
//!
//! `cargo test -p anvil-workspace --test fork_test`

use anvil_foundation::{AbortSignal, Error, Result};
use anvil_process::ExecHandle;
use anvil_runtime::{
    ByteStream, Capabilities, CreateWorkspaceParams, CreatedWorkspace, DeleteWorkspaceParams,
    ExecOptions, FileSink, FileStat, ForkWorkspaceParams, ForkedWorkspace, LifecycleFailure,
    LifecycleResult, RenameWorkspaceParams, RenamedWorkspace, Runtime, RuntimeConfig,
    RuntimeContext, RuntimeFactory, RuntimeKind,
};
use anvil_workspace::{orchestrate_fork, BranchDiscovery, ForkRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Fakes
// ============================================================================

struct FakeRuntime {
    config: RuntimeConfig,
    fork_result: LifecycleResult<ForkedWorkspace>,
    create_result: LifecycleResult<CreatedWorkspace>,
    create_calls: Mutex<Vec<String>>,
    fork_calls: AtomicUsize,
}

impl FakeRuntime {
    fn new(fork_result: LifecycleResult<ForkedWorkspace>) -> Self {
        Self {
            config: RuntimeConfig::Local,
            fork_result,
            create_result: Ok(CreatedWorkspace {
                workspace_path: PathBuf::from("/ws/created"),
            }),
            create_calls: Mutex::new(Vec::new()),
            fork_calls: AtomicUsize::new(0),
        }
    }

    fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    fn with_create_result(mut self, result: LifecycleResult<CreatedWorkspace>) -> Self {
        self.create_result = result;
        self
    }

    /// Trunks passed to `create_workspace`, in call order
    fn create_trunks(&self) -> Vec<String> {
        self.create_calls.lock().clone()
    }
}

fn unsupported<T>() -> Result<T> {
    Err(Error::Runtime("not used by fork tests".into()))
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn kind(&self) -> RuntimeKind {
        self.config.kind()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_fork: true,
            supports_tilde_expansion: false,
            isolated: true,
        }
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn workspace_path(&self) -> PathBuf {
        PathBuf::from("/ws/source")
    }

    async fn exec(&self, _command: &str, _options: ExecOptions) -> Result<ExecHandle> {
        unsupported()
    }

    async fn read_file(&self, _path: &str, _abort: Option<&AbortSignal>) -> Result<ByteStream> {
        unsupported()
    }

    async fn write_file(
        &self,
        _path: &str,
        _abort: Option<&AbortSignal>,
    ) -> Result<Box<dyn FileSink>> {
        unsupported()
    }

    async fn stat(&self, _path: &str, _abort: Option<&AbortSignal>) -> Result<FileStat> {
        unsupported()
    }

    fn get_workspace_path(&self, _project_path: &Path, workspace_name: &str) -> PathBuf {
        PathBuf::from("/ws").join(workspace_name)
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> LifecycleResult<CreatedWorkspace> {
        self.create_calls.lock().push(params.trunk_branch);
        self.create_result.clone()
    }

    async fn delete_workspace(&self, _params: DeleteWorkspaceParams) -> LifecycleResult<()> {
        Ok(())
    }

    async fn rename_workspace(
        &self,
        _params: RenameWorkspaceParams,
    ) -> LifecycleResult<RenamedWorkspace> {
        Err(LifecycleFailure::recoverable("not used"))
    }

    async fn fork_workspace(
        &self,
        _params: ForkWorkspaceParams,
    ) -> LifecycleResult<ForkedWorkspace> {
        self.fork_calls.fetch_add(1, Ordering::SeqCst);
        self.fork_result.clone()
    }
}

#[derive(Default)]
struct FakeFactory {
    calls: Mutex<Vec<(RuntimeConfig, RuntimeContext)>>,
    fail: bool,
}

impl RuntimeFactory for FakeFactory {
    fn create(&self, config: &RuntimeConfig, context: &RuntimeContext) -> Result<Arc<dyn Runtime>> {
        self.calls.lock().push((config.clone(), context.clone()));
        if self.fail {
            return Err(Error::Runtime("docker daemon unreachable".into()));
        }
        Ok(Arc::new(
            FakeRuntime::new(Err(LifecycleFailure::recoverable("n/a"))).with_config(config.clone()),
        ))
    }
}

/// `None` models a discovery error
struct FakeDiscovery {
    branch_exists: Option<bool>,
    trunk: Option<String>,
    calls: AtomicUsize,
}

impl FakeDiscovery {
    fn new(branch_exists: Option<bool>, trunk: Option<&str>) -> Self {
        Self {
            branch_exists,
            trunk: trunk.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BranchDiscovery for FakeDiscovery {
    async fn branch_exists(&self, _project_path: &Path, _branch: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.branch_exists
            .ok_or_else(|| Error::Runtime("not a git repository".into()))
    }

    async fn detect_trunk(&self, _project_path: &Path) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.trunk
            .clone()
            .ok_or_else(|| Error::Runtime("not a git repository".into()))
    }
}

fn forked(source_branch: Option<&str>) -> LifecycleResult<ForkedWorkspace> {
    Ok(ForkedWorkspace {
        workspace_path: PathBuf::from("/ws/new"),
        source_branch: source_branch.map(str::to_string),
        source_config_update: None,
    })
}

fn request(config: RuntimeConfig) -> ForkRequest {
    ForkRequest::new("/code/app", "base", "new", config)
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_recoverable_failure_falls_back_to_create_once() {
    let source = FakeRuntime::new(Err(LifecycleFailure::recoverable("unsupported")));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(false), Some("develop"));

    let outcome = orchestrate_fork(&source, &factory, &discovery, request(RuntimeConfig::Local))
        .await
        .unwrap();

    assert!(!outcome.forked);
    assert_eq!(outcome.workspace_path, PathBuf::from("/ws/created"));
    assert_eq!(outcome.trunk_branch, "develop");
    assert_eq!(source.create_trunks(), vec!["develop"]);
    assert_eq!(source.fork_calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_fallback_disabled_returns_failure() {
    let source = FakeRuntime::new(Err(LifecycleFailure::recoverable("unsupported")));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let failure = orchestrate_fork(
        &source,
        &factory,
        &discovery,
        request(RuntimeConfig::Local).allow_create_fallback(false),
    )
    .await
    .unwrap_err();

    assert_eq!(failure.failure.error, "unsupported");
    assert!(!failure.is_fatal());
    assert!(source.create_trunks().is_empty());
    assert!(factory.calls.lock().is_empty());
}

#[tokio::test]
async fn test_fatal_failure_never_creates() {
    let source = FakeRuntime::new(Err(LifecycleFailure::fatal("destination exists")));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let failure = orchestrate_fork(&source, &factory, &discovery, request(RuntimeConfig::Local))
        .await
        .unwrap_err();

    assert!(failure.is_fatal());
    assert_eq!(failure.failure.error, "destination exists");
    assert!(source.create_trunks().is_empty());
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_failure_propagates_untouched() {
    let source = FakeRuntime::new(Err(LifecycleFailure::recoverable("unsupported")))
        .with_create_result(Err(LifecycleFailure::recoverable("disk full")));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(false), Some("main"));

    let failure = orchestrate_fork(&source, &factory, &discovery, request(RuntimeConfig::Local))
        .await
        .unwrap_err();

    assert_eq!(failure.failure, LifecycleFailure::recoverable("disk full"));
    assert_eq!(source.create_trunks().len(), 1);
    assert!(factory.calls.lock().is_empty());
}

// ============================================================================
// Trunk resolution
// ============================================================================

#[tokio::test]
async fn test_source_branch_beats_fallback_trunk() {
    let source = FakeRuntime::new(forked(Some("feature/x")));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let outcome = orchestrate_fork(
        &source,
        &factory,
        &discovery,
        request(RuntimeConfig::Local).fallback_trunk("release"),
    )
    .await
    .unwrap();

    assert!(outcome.forked);
    assert_eq!(outcome.trunk_branch, "feature/x");
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fallback_trunk_beats_discovery() {
    let source = FakeRuntime::new(forked(None));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let outcome = orchestrate_fork(
        &source,
        &factory,
        &discovery,
        request(RuntimeConfig::Local).fallback_trunk("release"),
    )
    .await
    .unwrap();

    assert_eq!(outcome.trunk_branch, "release");
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_discovery_uses_source_name_when_branch_exists() {
    let source = FakeRuntime::new(forked(None));
    let factory = FakeFactory::default();

    let exists = FakeDiscovery::new(Some(true), Some("develop"));
    let outcome = orchestrate_fork(&source, &factory, &exists, request(RuntimeConfig::Local))
        .await
        .unwrap();
    assert_eq!(outcome.trunk_branch, "base");

    let missing = FakeDiscovery::new(Some(false), Some("develop"));
    let outcome = orchestrate_fork(&source, &factory, &missing, request(RuntimeConfig::Local))
        .await
        .unwrap();
    assert_eq!(outcome.trunk_branch, "develop");
}

#[tokio::test]
async fn test_discovery_errors_fall_back_to_main() {
    let source = FakeRuntime::new(forked(None));
    let factory = FakeFactory::default();

    let broken = FakeDiscovery::new(None, Some("develop"));
    let outcome = orchestrate_fork(&source, &factory, &broken, request(RuntimeConfig::Local))
        .await
        .unwrap();
    assert_eq!(outcome.trunk_branch, "main");

    let no_trunk = FakeDiscovery::new(Some(false), None);
    let outcome = orchestrate_fork(&source, &factory, &no_trunk, request(RuntimeConfig::Local))
        .await
        .unwrap();
    assert_eq!(outcome.trunk_branch, "main");
}

// ============================================================================
// Target runtime
// ============================================================================

#[tokio::test]
async fn test_docker_config_is_bound_to_new_workspace() {
    let project = Path::new("/code/app");
    let source_config = RuntimeConfig::docker("ubuntu:22.04").for_workspace(project, "base");
    let source = FakeRuntime::new(forked(Some("main"))).with_config(source_config.clone());
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let outcome = orchestrate_fork(&source, &factory, &discovery, request(source_config.clone()))
        .await
        .unwrap();

    let expected = RuntimeConfig::docker("ubuntu:22.04").for_workspace(project, "new");
    assert_ne!(outcome.runtime_config, source_config);
    assert_eq!(outcome.runtime_config, expected);

    let calls = factory.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, expected);
    assert_eq!(calls[0].1, RuntimeContext::new("/code/app", "new"));
    assert_eq!(outcome.runtime.config(), &expected);
}

#[tokio::test]
async fn test_failure_still_carries_normalized_config() {
    let project = Path::new("/code/app");
    let source_config = RuntimeConfig::docker("ubuntu:22.04").for_workspace(project, "base");
    let source = FakeRuntime::new(Err(LifecycleFailure::fatal("container exists")));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let failure = orchestrate_fork(&source, &factory, &discovery, request(source_config))
        .await
        .unwrap_err();
    assert_eq!(
        failure.runtime_config,
        RuntimeConfig::docker("ubuntu:22.04").for_workspace(project, "new")
    );
}

#[tokio::test]
async fn test_source_config_update_is_passed_through() {
    let update = RuntimeConfig::docker("ubuntu:22.04").for_workspace(Path::new("/code/app"), "base");
    let source = FakeRuntime::new(Ok(ForkedWorkspace {
        workspace_path: PathBuf::from("/src"),
        source_branch: Some("main".into()),
        source_config_update: Some(update.clone()),
    }));
    let factory = FakeFactory::default();
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let outcome = orchestrate_fork(
        &source,
        &factory,
        &discovery,
        request(RuntimeConfig::docker("ubuntu:22.04")),
    )
    .await
    .unwrap();
    assert_eq!(outcome.source_config_update, Some(update));
}

#[tokio::test]
async fn test_factory_error_after_success_is_fatal() {
    let source = FakeRuntime::new(forked(Some("main")));
    let factory = FakeFactory {
        fail: true,
        ..Default::default()
    };
    let discovery = FakeDiscovery::new(Some(true), Some("main"));

    let failure = orchestrate_fork(&source, &factory, &discovery, request(RuntimeConfig::Local))
        .await
        .unwrap_err();
    assert!(failure.is_fatal());
    assert!(failure.failure.error.contains("docker daemon unreachable"));
}
