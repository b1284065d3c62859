//! Disposable process wrapper
//!
//! Features:
//! - Spawns into its own process group (Unix) so the whole tree can be killed
//! - Background waiter records exit code and exit instant
//! - Idempotent `dispose()`; cleanup callbacks run exactly once
//! - Dropping the wrapper disposes it

use anvil_foundation::{Error, Result};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; signal deaths map to `128 + signal`, unknown to -1
    pub code: i32,
    pub exited_at: Instant,
}

/// Result of a `dispose()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeOutcome {
    /// Process tree was still running and has been killed
    Killed,
    /// Leader had already exited; only leftover group members were signalled
    AlreadyExited,
    /// An earlier call already disposed the wrapper
    AlreadyDisposed,
}

/// Pipes taken from the child at spawn time
#[derive(Debug, Default)]
pub struct ProcessPipes {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// A child process that is torn down (with its descendants) on dispose or drop
pub struct DisposableProcess {
    pid: Option<u32>,
    started_at: Instant,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    disposed: AtomicBool,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl std::fmt::Debug for DisposableProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposableProcess")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl DisposableProcess {
    /// Spawn `command` with piped stdio. Must be called inside a tokio runtime.
    pub fn spawn(mut command: Command) -> Result<(Self, ProcessPipes)> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let mut child = command
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn {}: {}", program, e)))?;

        let pid = child.id();
        let pipes = ProcessPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("Failed to wait for process: {}", e);
                    -1
                }
            };
            let _ = exit_tx.send(Some(ExitInfo {
                code,
                exited_at: Instant::now(),
            }));
        });

        debug!(pid = ?pid, program = %program, "spawned process");

        Ok((
            Self {
                pid,
                started_at: Instant::now(),
                exit_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
                disposed: AtomicBool::new(false),
                cleanups: Mutex::new(Vec::new()),
            },
            pipes,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Register a callback for dispose time. Runs immediately if already disposed.
    pub fn add_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            cleanup();
            return;
        }
        self.cleanups.lock().push(Box::new(cleanup));
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let info = match rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or(ExitInfo {
                code: -1,
                exited_at: Instant::now(),
            }),
            // waiter vanished (runtime shutting down)
            Err(_) => ExitInfo {
                code: -1,
                exited_at: Instant::now(),
            },
        };
        info
    }

    /// Kill the process tree if it is still running, then run cleanups.
    ///
    /// Safe to call any number of times from any path.
    pub fn dispose(&self) -> DisposeOutcome {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return DisposeOutcome::AlreadyDisposed;
        }

        let outcome = if self.has_exited() {
            self.kill_stragglers();
            DisposeOutcome::AlreadyExited
        } else {
            self.kill_tree();
            DisposeOutcome::Killed
        };

        let cleanups: Vec<Cleanup> = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }

        debug!(pid = ?self.pid, ?outcome, "disposed process");
        outcome
    }

    /// Signal what is left of the group once the leader is gone.
    ///
    /// Background descendants keep the group (and its id) alive; an empty
    /// group just reports ESRCH.
    fn kill_stragglers(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
    }

    fn kill_tree(&self) {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        // direct child, in case the group signal didn't reach it
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for DisposableProcess {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // spawned with process_group(0), so pgid == pid
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result != 0 {
        debug!(pid, "killpg failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(windows)]
fn kill_process_group(pid: u32) {
    let spawned = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        debug!(pid, "taskkill failed: {}", e);
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_exit_code_recorded() {
        let (process, _pipes) = DisposableProcess::spawn(sh("exit 3")).unwrap();
        let info = process.wait().await;
        assert_eq!(info.code, 3);
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_dispose_kills_running_process() {
        let (process, _pipes) = DisposableProcess::spawn(sh("sleep 30")).unwrap();
        assert_eq!(process.dispose(), DisposeOutcome::Killed);

        let info = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("process should die");
        assert_eq!(info.code, 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn test_double_dispose_is_noop() {
        let (process, _pipes) = DisposableProcess::spawn(sh("true")).unwrap();
        process.wait().await;

        assert_eq!(process.dispose(), DisposeOutcome::AlreadyExited);
        assert_eq!(process.dispose(), DisposeOutcome::AlreadyDisposed);
    }

    #[tokio::test]
    async fn test_cleanups_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let (process, _pipes) = DisposableProcess::spawn(sh("sleep 30")).unwrap();
        for _ in 0..2 {
            let count = Arc::clone(&count);
            process.add_cleanup(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        process.dispose();
        process.dispose();
        drop(process);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispose_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch {}) & wait", marker.display());

        let (process, _pipes) = DisposableProcess::spawn(sh(&script)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.dispose();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_dispose_after_exit_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch {}) &", marker.display());

        let (process, _pipes) = DisposableProcess::spawn(sh(&script)).unwrap();
        assert_eq!(process.wait().await.code, 0);
        assert_eq!(process.dispose(), DisposeOutcome::AlreadyExited);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_drop_disposes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1; touch {}", marker.display());

        let (process, _pipes) = DisposableProcess::spawn(sh(&script)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(process);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
