//! # anvil-workspace
//!
//! Workspace lifecycle on top of the runtime backends:
//! - Fork: 백엔드 fork + create fallback + trunk 결정
//! - Metadata: 워크스페이스별 `metadata.json`
//! - GitStatus: stale-write 차단되는 git 상태 캐시
//! - InitHook: 새 워크스페이스에서 `.anvil/init` 실행
//! - Service: create / fork / delete / rename 조합

pub mod fork;
pub mod git_status;
pub mod init_hook;
pub mod metadata;
pub mod service;

// ============================================================================
// Fork
// ============================================================================
pub use fork::{
    orchestrate_fork, resolve_trunk, BranchDiscovery, ForkFailure, ForkOutcome, ForkRequest,
    GitBranchDiscovery, DEFAULT_TRUNK,
};

// ============================================================================
// Metadata / Git status
// ============================================================================
pub use git_status::{compute_git_status, GitStatusSummary, GIT_STATUS_FILE};
pub use metadata::{project_sessions_dir, MetadataStore, WorkspaceMetadata, METADATA_FILE};

// ============================================================================
// Init hook / Service
// ============================================================================
pub use init_hook::{run_init_hook, InitHookOutcome};
pub use service::{CreateOptions, ServiceError, ServiceResult, WorkspaceService};
