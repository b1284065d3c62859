//! Git helpers
//!
//! Thin async wrappers over the `git` CLI, run through the exec primitive so
//! they honor abort signals.

use anvil_foundation::AbortSignal;
use anvil_process::{exec_buffered, ExecOutput, ExecRequest};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git is not installed")]
    NotInstalled,

    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("git {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Uncommitted changes exist")]
    DirtyWorkingTree,

    #[error("git operation aborted")]
    Aborted,

    #[error(transparent)]
    Exec(#[from] anvil_foundation::Error),
}

pub type GitResult<T> = std::result::Result<T, GitError>;

// ============================================================================
// Git
// ============================================================================

/// `git -C <dir>` runner
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    abort: Option<AbortSignal>,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            abort: None,
        }
    }

    pub fn with_abort(mut self, abort: Option<AbortSignal>) -> Self {
        self.abort = abort;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_available() -> bool {
        which::which("git").is_ok()
    }

    fn request(&self, args: &[&str]) -> ExecRequest {
        ExecRequest::new("git")
            .arg("-C")
            .arg(self.dir.to_string_lossy())
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0")
            .abort_opt(self.abort.clone())
    }

    /// Run and return the raw output, whatever the exit code
    pub async fn output(&self, args: &[&str]) -> GitResult<ExecOutput> {
        let out = exec_buffered(self.request(args), None).await.map_err(|e| match e {
            anvil_foundation::Error::Cancelled => GitError::Aborted,
            anvil_foundation::Error::Process(_) if !Self::is_available() => GitError::NotInstalled,
            other => GitError::Exec(other),
        })?;
        if out.aborted {
            return Err(GitError::Aborted);
        }
        Ok(out)
    }

    /// Run and return trimmed stdout; non-zero exit is an error
    pub async fn run(&self, args: &[&str]) -> GitResult<String> {
        debug!(dir = %self.dir.display(), args = ?args, "git");
        let out = self.output(args).await?;
        if !out.success() {
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                message: out.error_text(),
            });
        }
        Ok(out.stdout.trim_end().to_string())
    }

    pub async fn is_repository(&self) -> bool {
        matches!(
            self.run(&["rev-parse", "--is-inside-work-tree"]).await.as_deref(),
            Ok("true")
        )
    }

    /// Current branch, `None` when detached
    pub async fn current_branch(&self) -> GitResult<Option<String>> {
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(if branch == "HEAD" { None } else { Some(branch) })
    }

    pub async fn head_commit(&self) -> GitResult<String> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    pub async fn branch_exists(&self, branch: &str) -> GitResult<bool> {
        let reference = format!("refs/heads/{}", branch);
        let out = self
            .output(&["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.success())
    }

    pub async fn resolves(&self, rev: &str) -> bool {
        let spec = format!("{}^{{commit}}", rev);
        self.output(&["rev-parse", "--verify", "--quiet", &spec])
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    /// `origin/HEAD`, then the first of main / master / trunk / develop
    pub async fn detect_trunk(&self) -> GitResult<String> {
        if let Ok(head) = self
            .run(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            if let Some(branch) = head.strip_prefix("origin/") {
                if !branch.is_empty() {
                    return Ok(branch.to_string());
                }
            }
        }

        for candidate in ["main", "master", "trunk", "develop"] {
            if self.branch_exists(candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        Err(GitError::BranchNotFound("trunk".into()))
    }

    pub async fn is_dirty(&self) -> GitResult<bool> {
        Ok(!self.run(&["status", "--porcelain"]).await?.is_empty())
    }

    // ------------------------------------------------------------------------
    // Worktrees
    // ------------------------------------------------------------------------

    /// Check out an existing branch into `dest`
    pub async fn worktree_add_existing(&self, dest: &Path, branch: &str) -> GitResult<()> {
        let dest = dest.to_string_lossy();
        self.run(&["worktree", "add", &dest, branch]).await.map(drop)
    }

    /// Create `branch` at `start_point` and check it out into `dest`
    pub async fn worktree_add_new(
        &self,
        dest: &Path,
        branch: &str,
        start_point: &str,
    ) -> GitResult<()> {
        let dest = dest.to_string_lossy();
        self.run(&["worktree", "add", "-b", branch, &dest, start_point])
            .await
            .map(drop)
    }

    pub async fn worktree_remove(&self, path: &Path, force: bool) -> GitResult<()> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path);
        match self.run(&args).await {
            Err(GitError::CommandFailed { message, .. })
                if !force && message.contains("modified or untracked") =>
            {
                Err(GitError::DirtyWorkingTree)
            }
            other => other.map(drop),
        }
    }

    pub async fn worktree_move(&self, from: &Path, to: &Path) -> GitResult<()> {
        let from = from.to_string_lossy();
        let to = to.to_string_lossy();
        self.run(&["worktree", "move", &from, &to]).await.map(drop)
    }

    pub async fn worktree_prune(&self) -> GitResult<()> {
        self.run(&["worktree", "prune"]).await.map(drop)
    }

    /// Ignored, untracked files matching `pathspecs`, relative to the repo root
    pub async fn ls_ignored(&self, pathspecs: &[String]) -> GitResult<Vec<String>> {
        if pathspecs.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![
            "ls-files",
            "-z",
            "--others",
            "--ignored",
            "--exclude-standard",
            "--",
        ];
        args.extend(pathspecs.iter().map(String::as_str));
        let out = self.output(&args).await?;
        if !out.success() {
            return Err(GitError::CommandFailed {
                command: "ls-files".into(),
                message: out.error_text(),
            });
        }
        Ok(out
            .stdout
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `git bundle create <file> --all`
    pub async fn bundle_all(&self, file: &Path) -> GitResult<()> {
        let file = file.to_string_lossy();
        self.run(&["bundle", "create", &file, "--all"]).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo() -> Option<tempfile::TempDir> {
        if !Git::is_available() {
            eprintln!("git not installed, skipping");
            return None;
        }
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path());
        git.run(&["init", "-q", "-b", "main"]).await.unwrap();
        git.run(&["config", "user.email", "t@example.com"]).await.unwrap();
        git.run(&["config", "user.name", "t"]).await.unwrap();
        std::fs::write(dir.path().join("README"), "hi").unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-q", "-m", "init"]).await.unwrap();
        Some(dir)
    }

    #[tokio::test]
    async fn test_branch_queries() {
        let Some(dir) = init_repo().await else { return };
        let git = Git::new(dir.path());

        assert!(git.is_repository().await);
        assert_eq!(git.current_branch().await.unwrap().as_deref(), Some("main"));
        assert!(git.branch_exists("main").await.unwrap());
        assert!(!git.branch_exists("nope").await.unwrap());
        assert_eq!(git.detect_trunk().await.unwrap(), "main");
        assert!(git.resolves("main").await);
        assert!(!git.resolves("nope").await);
        assert!(!git.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn test_worktree_add_move_remove() {
        let Some(dir) = init_repo().await else { return };
        let git = Git::new(dir.path());
        let trees = tempfile::tempdir().unwrap();
        let a = trees.path().join("a");
        let b = trees.path().join("b");

        git.worktree_add_new(&a, "feature-a", "main").await.unwrap();
        assert!(a.join("README").exists());
        git.worktree_move(&a, &b).await.unwrap();
        assert!(b.join("README").exists());
        git.worktree_remove(&b, false).await.unwrap();
        assert!(!b.exists());
        assert!(git.branch_exists("feature-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let Some(dir) = init_repo().await else { return };
        let err = Git::new(dir.path())
            .run(&["checkout", "does-not-exist"])
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::CommandFailed { ref command, .. } if command == "checkout"));
    }
}
