//! Exec primitive - streaming and buffered command execution
//!
//! Every exec is supervised: the process tree is disposed when the timeout
//! elapses, the abort signal trips, or the handle is dropped. Supervision
//! lasts until the handle is awaited, not just until the leader exits, since
//! background descendants can keep the output pipes open.

use crate::disposable::{DisposableProcess, DisposeOutcome};
use crate::stream_error::is_ignorable_stream_error;
use anvil_foundation::{AbortScope, AbortSignal, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code reported when the abort signal killed the process
pub const EXIT_CODE_ABORTED: i32 = -997;

/// Exit code reported when the timeout killed the process
pub const EXIT_CODE_TIMEOUT: i32 = -998;

/// How long readers keep draining after a teardown before giving up
const STREAM_GRACE: Duration = Duration::from_millis(500);

// ============================================================================
// Deadline
// ============================================================================

/// Pushes the timeout of running execs back, e.g. while a user answers an
/// interactive prompt. Clones share the same total.
#[derive(Debug, Clone, Default)]
pub struct DeadlineExtender {
    extra: Arc<Mutex<Duration>>,
}

impl DeadlineExtender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, by: Duration) {
        *self.extra.lock() += by;
    }

    /// Everything ever added through any clone
    pub fn total(&self) -> Duration {
        *self.extra.lock()
    }
}

// ============================================================================
// Request
// ============================================================================

/// A command to run on the local machine
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overrides on top of the inherited environment
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub abort: Option<AbortSignal>,
    pub extender: Option<DeadlineExtender>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: None,
            abort: None,
            extender: None,
        }
    }

    /// Run a command line through the platform shell
    pub fn shell(command: impl Into<String>) -> Self {
        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        Self::new(shell).arg(shell_arg).arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn abort_opt(mut self, signal: Option<AbortSignal>) -> Self {
        self.abort = signal;
        self
    }

    /// Extensions added after spawn move the timeout back
    pub fn deadline_extender(mut self, extender: DeadlineExtender) -> Self {
        self.extender = Some(extender);
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Printable form for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ============================================================================
// Status / Output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
    pub aborted: bool,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Fully buffered result of `exec_buffered`
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
    pub aborted: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if non-empty, else stdout, trimmed
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Streaming handle for a running command.
///
/// Take the pipes with `Option::take`. Dropping the handle disposes the
/// process tree.
pub struct ExecHandle {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    process: Arc<DisposableProcess>,
    supervisor: Option<JoinHandle<ExecStatus>>,
    /// Cancelled once the consumer is done with the streams
    finished: CancellationToken,
    /// Cancelled a grace period after a timeout/abort teardown
    released: CancellationToken,
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHandle")
            .field("process", &self.process)
            .finish()
    }
}

impl ExecHandle {
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn process(&self) -> &Arc<DisposableProcess> {
        &self.process
    }

    /// Close stdin so the child sees EOF
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Kill the process tree now
    pub fn dispose(&self) -> DisposeOutcome {
        self.process.dispose()
    }

    /// Cancelled shortly after a timeout or abort teardown. Readers still
    /// blocked on a pipe at that point should stop.
    pub fn released(&self) -> CancellationToken {
        self.released.clone()
    }

    /// Wait for exit (or timeout / abort teardown).
    ///
    /// Call this after the streams are drained: until then the timeout and
    /// abort signal stay armed even if the leader has already exited.
    pub async fn wait(mut self) -> Result<ExecStatus> {
        self.finished.cancel();
        let supervisor = self
            .supervisor
            .take()
            .ok_or_else(|| Error::Internal("exec handle already awaited".into()))?;
        supervisor
            .await
            .map_err(|e| Error::Process(format!("exec supervisor failed: {}", e)))
    }
}

impl Drop for ExecHandle {
    fn drop(&mut self) {
        self.finished.cancel();
        self.process.dispose();
    }
}

enum Ending {
    Exited,
    TimedOut,
    Aborted,
}

/// Timeout clock for one exec, counting only extensions made after spawn
struct Deadline {
    at: Option<Instant>,
    extender: Option<DeadlineExtender>,
    baseline: Duration,
}

impl Deadline {
    fn new(timeout: Option<Duration>, extender: Option<DeadlineExtender>) -> Self {
        let baseline = extender.as_ref().map(DeadlineExtender::total).unwrap_or_default();
        Self {
            at: timeout.map(|t| Instant::now() + t),
            extender,
            baseline,
        }
    }

    fn extra(&self) -> Duration {
        self.extender
            .as_ref()
            .map(|e| e.total().saturating_sub(self.baseline))
            .unwrap_or_default()
    }

    async fn elapsed(&self) {
        let Some(at) = self.at else {
            return std::future::pending().await;
        };
        loop {
            let extra = self.extra();
            tokio::time::sleep_until(at + extra).await;
            if self.extra() == extra {
                return;
            }
        }
    }
}

/// Spawn a supervised command with piped stdio
pub fn spawn_exec(request: ExecRequest) -> Result<ExecHandle> {
    let scope = AbortScope::bridge(request.abort.as_ref());
    scope.check()?;

    debug!(command = %request.display(), cwd = ?request.cwd, "exec");
    let (process, pipes) = DisposableProcess::spawn(request.to_command())?;
    let process = Arc::new(process);

    let supervised = Arc::clone(&process);
    let timeout = request.timeout;
    let deadline = Deadline::new(timeout, request.extender.clone());
    let finished = CancellationToken::new();
    let released = CancellationToken::new();
    let consumer_done = finished.clone();
    let release = released.clone();

    let supervisor = tokio::spawn(async move {
        let token = scope.token().clone();
        let mut ending = tokio::select! {
            biased;
            _ = supervised.wait() => Ending::Exited,
            _ = token.cancelled() => Ending::Aborted,
            _ = deadline.elapsed() => Ending::TimedOut,
        };
        let exit = match ending {
            Ending::Exited => Some(supervised.wait().await),
            _ => None,
        };

        if exit.is_some() {
            // leader is gone; descendants may still hold stdout/stderr
            ending = tokio::select! {
                biased;
                _ = consumer_done.cancelled() => Ending::Exited,
                _ = token.cancelled() => Ending::Aborted,
                _ = deadline.elapsed() => Ending::TimedOut,
            };
        }

        match ending {
            Ending::Exited => {}
            Ending::TimedOut => {
                warn!(pid = ?supervised.pid(), ?timeout, "exec timed out, killing process tree");
                supervised.dispose();
            }
            Ending::Aborted => {
                debug!(pid = ?supervised.pid(), "exec aborted, killing process tree");
                supervised.dispose();
            }
        }

        if !matches!(ending, Ending::Exited) {
            tokio::spawn(async move {
                tokio::time::sleep(STREAM_GRACE).await;
                release.cancel();
            });
        }

        let ended_at = match (&ending, exit) {
            (Ending::Exited, Some(exit)) => exit.exited_at,
            (_, Some(_)) => std::time::Instant::now(),
            (_, None) => supervised.wait().await.exited_at,
        };
        let duration = ended_at.saturating_duration_since(supervised.started_at());
        let (exit_code, timed_out, aborted) = match (ending, exit) {
            (Ending::Exited, Some(exit)) => (exit.code, false, false),
            (Ending::Exited, None) => (-1, false, false),
            (Ending::TimedOut, _) => (EXIT_CODE_TIMEOUT, true, false),
            (Ending::Aborted, _) => (EXIT_CODE_ABORTED, false, true),
        };
        ExecStatus {
            exit_code,
            duration,
            timed_out,
            aborted,
        }
    });

    Ok(ExecHandle {
        stdin: pipes.stdin,
        stdout: pipes.stdout,
        stderr: pipes.stderr,
        process,
        supervisor: Some(supervisor),
        finished,
        released,
    })
}

/// Write all of `input` then close stdin. Broken pipes are not errors.
pub async fn feed_stdin(mut stdin: ChildStdin, input: &[u8]) -> Result<()> {
    let result = async {
        stdin.write_all(input).await?;
        stdin.shutdown().await
    }
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) if is_ignorable_stream_error(&e) => {
            debug!("stdin closed early by child: {}", e);
            Ok(())
        }
        Err(e) => Err(Error::Process(format!("failed to write stdin: {}", e))),
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>, released: &CancellationToken) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut reader) = reader else {
        return buf;
    };
    let mut chunk = vec![0u8; 8192];
    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    if !is_ignorable_stream_error(&e) {
                        warn!("failed to read process output: {}", e);
                    }
                    break;
                }
            },
            _ = released.cancelled() => {
                debug!("process output still open after teardown, giving up");
                break;
            }
        }
    }
    buf
}

/// Run a command to completion, buffering both streams.
///
/// With `stdin: None` the child's stdin is closed immediately.
pub async fn exec_buffered(request: ExecRequest, stdin: Option<Vec<u8>>) -> Result<ExecOutput> {
    collect_output(spawn_exec(request)?, stdin).await
}

/// Drive an already spawned handle to completion, buffering both streams
pub async fn collect_output(mut handle: ExecHandle, stdin: Option<Vec<u8>>) -> Result<ExecOutput> {
    let released = handle.released();
    let stdin_pipe = handle.stdin.take();
    let writer = async {
        match (stdin_pipe, stdin) {
            (Some(pipe), Some(input)) => tokio::select! {
                written = feed_stdin(pipe, &input) => written,
                _ = released.cancelled() => Ok(()),
            },
            // dropping the pipe closes it
            _ => Ok(()),
        }
    };

    let (write_result, stdout, stderr) = tokio::join!(
        writer,
        read_all(handle.stdout.take(), &released),
        read_all(handle.stderr.take(), &released)
    );
    let status = handle.wait().await?;
    write_result?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.exit_code,
        duration: status.duration,
        timed_out: status.timed_out,
        aborted: status.aborted,
    })
}
