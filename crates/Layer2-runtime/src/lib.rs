//! # anvil-runtime
//!
//! Uniform execution contract over heterogeneous workspace backends:
//! - `Runtime`: exec, file I/O, stat, workspace lifecycle
//! - Backends: local (pass-through), git worktree, ssh, docker
//! - `RuntimeConfig`: persisted, tagged backend descriptor
//! - `RuntimeFactory`: config + identity -> bound runtime
//! - Ignore sync: copy selected git-ignored files into new workspaces
//! - Askpass bridge: ssh prompts routed through the prompt broker

pub mod askpass;
pub mod backend;
pub mod config;
pub mod factory;
pub mod file;
pub mod git;
pub mod ignore_sync;
pub mod runtime;

// ============================================================================
// Runtime contract
// ============================================================================
pub use runtime::{
    null_logger, project_name, Capabilities, CreateWorkspaceParams, CreatedWorkspace,
    DeleteWorkspaceParams, ExecOptions, FileStat, ForkWorkspaceParams, ForkedWorkspace,
    InitLogger, LifecycleFailure, LifecycleResult, NullInitLogger, RenameWorkspaceParams,
    RenamedWorkspace, Runtime, RuntimeKind, TracingInitLogger,
};

// ============================================================================
// Backends / Config / Factory
// ============================================================================
pub use backend::{DockerRuntime, LocalRuntime, SshRuntime, WorktreeRuntime};
pub use config::{container_name_for, project_key, RuntimeConfig};
pub use factory::{DefaultRuntimeFactory, RuntimeContext, RuntimeFactory};

// ============================================================================
// Files / Git / Sync
// ============================================================================
pub use askpass::AskpassBridge;
pub use file::{ByteStream, FileSink};
pub use git::{Git, GitError};
pub use ignore_sync::{parse_ignore_sync, sync_ignored_files, SyncReport};
