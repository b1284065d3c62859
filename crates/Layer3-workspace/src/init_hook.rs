//! Project init hook - `.anvil/init` run inside a freshly created workspace
//!
//! Best effort: a missing hook is skipped and a failing hook is logged, never
//! turned into a lifecycle failure.

use anvil_foundation::{AbortSignal, Error, InitHookSettings};
use anvil_runtime::{ExecOptions, InitLogger, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

/// Output is still collected this long after the hook itself exits
const HOOK_OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// What happened when the hook was considered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitHookOutcome {
    Disabled,
    Missing,
    Completed { exit_code: i32 },
    /// Could not be started or was aborted
    Failed,
}

async fn pump_lines<R, F>(reader: Option<R>, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink(&line),
            Ok(None) => break,
            Err(e) => {
                debug!("init hook stream closed: {}", e);
                break;
            }
        }
    }
}

/// Run the hook inside `runtime`'s workspace, streaming output to `logger`
pub async fn run_init_hook(
    runtime: &dyn Runtime,
    settings: &InitHookSettings,
    logger: Arc<dyn InitLogger>,
    abort: Option<AbortSignal>,
) -> InitHookOutcome {
    if settings.disabled {
        return InitHookOutcome::Disabled;
    }

    let hook = settings.path();
    let workspace = runtime.workspace_path();
    let hook_path = format!("{}/{}", workspace.to_string_lossy().trim_end_matches('/'), hook);
    match runtime.stat(&hook_path, abort.as_ref()).await {
        Ok(meta) if !meta.is_directory => {}
        Ok(_) | Err(Error::NotFound(_)) => return InitHookOutcome::Missing,
        Err(e) => {
            warn!(hook = %hook_path, "cannot check init hook: {}", e);
            return InitHookOutcome::Failed;
        }
    }

    let command = match shlex::try_quote(&hook) {
        Ok(quoted) => format!("sh {}", quoted),
        Err(e) => {
            warn!(hook = %hook, "unusable init hook path: {}", e);
            return InitHookOutcome::Failed;
        }
    };

    logger.log_step(&format!("Running {}", hook));
    let mut handle = match runtime.exec(&command, ExecOptions::new().abort(abort)).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(hook = %hook, "init hook failed to start: {}", e);
            logger.log_stderr(&e.to_string());
            return InitHookOutcome::Failed;
        }
    };
    handle.close_stdin();

    let out_logger = Arc::clone(&logger);
    let err_logger = Arc::clone(&logger);
    let stdout = handle.stdout.take();
    let stderr = handle.stderr.take();
    let pumps = async {
        tokio::join!(
            pump_lines(stdout, |line| out_logger.log_stdout(line)),
            pump_lines(stderr, |line| err_logger.log_stderr(line)),
        )
    };
    // background jobs started by the hook inherit its pipes
    let process = Arc::clone(handle.process());
    let released = handle.released();
    tokio::select! {
        _ = pumps => {}
        _ = async {
            process.wait().await;
            tokio::time::sleep(HOOK_OUTPUT_GRACE).await;
        } => {
            debug!(hook = %hook, "init hook left processes holding its output");
        }
        _ = released.cancelled() => {}
    }

    match handle.wait().await {
        Ok(status) if status.aborted => {
            logger.log_stderr("init hook aborted");
            InitHookOutcome::Failed
        }
        Ok(status) => {
            logger.log_complete(status.exit_code);
            if !status.success() {
                warn!(hook = %hook, exit_code = status.exit_code, "init hook exited non-zero");
            }
            InitHookOutcome::Completed {
                exit_code: status.exit_code,
            }
        }
        Err(e) => {
            warn!(hook = %hook, "init hook wait failed: {}", e);
            InitHookOutcome::Failed
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use anvil_runtime::LocalRuntime;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl InitLogger for Recorder {
        fn log_step(&self, message: &str) {
            self.lines.lock().push(format!("step:{}", message));
        }
        fn log_stdout(&self, line: &str) {
            self.lines.lock().push(format!("out:{}", line));
        }
        fn log_stderr(&self, line: &str) {
            self.lines.lock().push(format!("err:{}", line));
        }
        fn log_complete(&self, exit_code: i32) {
            self.lines.lock().push(format!("done:{}", exit_code));
        }
    }

    #[tokio::test]
    async fn test_missing_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let logger = Arc::new(Recorder::default());

        let outcome =
            run_init_hook(&runtime, &InitHookSettings::default(), logger.clone(), None).await;
        assert_eq!(outcome, InitHookOutcome::Missing);

        let disabled = InitHookSettings {
            disabled: true,
            ..Default::default()
        };
        assert_eq!(
            run_init_hook(&runtime, &disabled, logger.clone(), None).await,
            InitHookOutcome::Disabled
        );
        assert!(logger.lines.lock().is_empty());
    }

    #[tokio::test]
    async fn test_streams_output_to_logger() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".anvil")).unwrap();
        std::fs::write(
            dir.path().join(".anvil/init"),
            "echo installing\necho warn >&2\nexit 3\n",
        )
        .unwrap();

        let runtime = LocalRuntime::new(dir.path());
        let logger = Arc::new(Recorder::default());
        let outcome =
            run_init_hook(&runtime, &InitHookSettings::default(), logger.clone(), None).await;

        assert_eq!(outcome, InitHookOutcome::Completed { exit_code: 3 });
        let lines = logger.lines.lock().clone();
        assert_eq!(lines.first().map(String::as_str), Some("step:Running .anvil/init"));
        assert!(lines.contains(&"out:installing".to_string()));
        assert!(lines.contains(&"err:warn".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("done:3"));
    }

    #[tokio::test]
    async fn test_background_job_does_not_block_hook() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".anvil")).unwrap();
        std::fs::write(
            dir.path().join(".anvil/init"),
            "sleep 30 &\necho ready\n",
        )
        .unwrap();

        let runtime = LocalRuntime::new(dir.path());
        let logger = Arc::new(Recorder::default());
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run_init_hook(&runtime, &InitHookSettings::default(), logger.clone(), None),
        )
        .await
        .expect("hook must finish once its script exits");

        assert_eq!(outcome, InitHookOutcome::Completed { exit_code: 0 });
        let lines = logger.lines.lock().clone();
        assert!(lines.contains(&"out:ready".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("done:0"));
    }
}
