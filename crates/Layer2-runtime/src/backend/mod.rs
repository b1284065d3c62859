//! Runtime backends
//!
//! - `local`: pass-through, the project directory itself
//! - `worktree`: one git worktree per workspace
//! - `ssh`: remote host through the system ssh client
//! - `docker`: one container per workspace

mod docker;
mod local;
pub mod remote;
mod ssh;
mod worktree;

pub use docker::{DockerRuntime, CONTAINER_WORKDIR};
pub use local::LocalRuntime;
pub use ssh::SshRuntime;
pub use worktree::WorktreeRuntime;
