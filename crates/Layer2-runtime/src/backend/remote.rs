//! Shell-script plumbing shared by the SSH and Docker backends
//!
//! Both reach their target through a local client process (`ssh`, `docker
//! exec`) that runs a POSIX `sh` script on the other side. File I/O, stat and
//! lifecycle steps are all expressed as scripts.

use crate::file::{
    parse_stat_output, remote_stat_script, remote_write_script, ByteStream, ExecFileSink,
    ExecReader, FileSink, STAT_MISSING_EXIT,
};
use crate::git::Git;
use crate::runtime::{ExecOptions, FileStat, LifecycleFailure, LifecycleResult};
use anvil_foundation::{AbortSignal, Error, Result};
use anvil_process::{exec_buffered, spawn_exec, ExecHandle, ExecOutput, ExecRequest};
use std::path::Path;

/// Exit code for "destination already exists"
pub const EXIT_EXISTS: i32 = 3;
/// Exit code for "source does not exist"
pub const EXIT_MISSING: i32 = 4;
/// Exit code for a failure after the destination was partially created
pub const EXIT_PARTIAL: i32 = 5;

/// Something that can run a `sh` script on the target
pub trait RemoteShell: Send + Sync {
    /// Local command that runs `script` remotely with stdio attached
    fn shell_request(&self, script: &str) -> Result<ExecRequest>;
}

// ============================================================================
// Quoting
// ============================================================================

pub fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|e| Error::invalid_input(format!("cannot quote {:?}: {}", value, e)))
}

/// Quote a remote path, leaving a leading `~` to the remote shell's `$HOME`
pub fn quote_path(path: &str) -> Result<String> {
    if path == "~" {
        return Ok("\"$HOME\"".to_string());
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return Ok(format!("\"$HOME\"/{}", quote(rest)?));
    }
    quote(path)
}

fn valid_env_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `cd` + `export` prefix followed by the user command
pub fn exec_script(command: &str, default_cwd: &str, options: &ExecOptions) -> Result<String> {
    let cwd = options.cwd.as_deref().unwrap_or(default_cwd);
    let mut script = format!("cd {} || exit 1\n", quote_path(cwd)?);

    let mut keys: Vec<_> = options.env.keys().collect();
    keys.sort();
    for key in keys {
        if !valid_env_key(key) {
            return Err(Error::invalid_input(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }
        script.push_str(&format!("export {}={}\n", key, quote(&options.env[key])?));
    }
    script.push_str(command);
    Ok(script)
}

// ============================================================================
// Operations
// ============================================================================

/// Run `script` and buffer its output
pub async fn run_script(
    shell: &dyn RemoteShell,
    script: &str,
    stdin: Option<Vec<u8>>,
    abort: Option<&AbortSignal>,
) -> Result<ExecOutput> {
    let request = shell.shell_request(script)?.abort_opt(abort.cloned());
    exec_buffered(request, stdin).await
}

pub fn spawn_script(
    shell: &dyn RemoteShell,
    script: &str,
    options: &ExecOptions,
) -> Result<ExecHandle> {
    let request = shell
        .shell_request(script)?
        .timeout_opt(options.timeout)
        .abort_opt(options.abort.clone());
    spawn_exec(request)
}

pub async fn stat(
    shell: &dyn RemoteShell,
    path: &str,
    abort: Option<&AbortSignal>,
) -> Result<FileStat> {
    let out = run_script(shell, &remote_stat_script(&quote_path(path)?), None, abort).await?;
    if out.aborted {
        return Err(Error::Cancelled);
    }
    match out.exit_code {
        0 => parse_stat_output(&out.stdout),
        STAT_MISSING_EXIT => Err(Error::NotFound(path.to_string())),
        code => Err(Error::Runtime(format!(
            "stat {} failed ({}): {}",
            path,
            code,
            out.error_text()
        ))),
    }
}

pub async fn read_file(
    shell: &dyn RemoteShell,
    path: &str,
    abort: Option<&AbortSignal>,
) -> Result<ByteStream> {
    let meta = stat(shell, path, abort).await?;
    if meta.is_directory {
        return Err(Error::invalid_input(format!("{} is a directory", path)));
    }
    let script = format!("exec cat -- {}", quote_path(path)?);
    let request = shell.shell_request(&script)?.abort_opt(abort.cloned());
    Ok(Box::pin(ExecReader::new(spawn_exec(request)?)?))
}

pub async fn write_file(
    shell: &dyn RemoteShell,
    path: &str,
    abort: Option<&AbortSignal>,
) -> Result<Box<dyn FileSink>> {
    let script = remote_write_script(&quote_path(path)?);
    let request = shell.shell_request(&script)?.abort_opt(abort.cloned());
    Ok(Box::new(ExecFileSink::new(path, spawn_exec(request)?)?))
}

/// `git bundle create --all` of the project, read into memory
pub async fn bundle_project(
    project_path: &Path,
    abort: Option<AbortSignal>,
) -> LifecycleResult<Vec<u8>> {
    let dir = tempfile::tempdir()
        .map_err(|e| LifecycleFailure::recoverable(format!("temp dir: {}", e)))?;
    let bundle = dir.path().join("project.bundle");
    Git::new(project_path)
        .with_abort(abort)
        .bundle_all(&bundle)
        .await
        .map_err(|e| LifecycleFailure::recoverable(format!("git bundle failed: {}", e)))?;
    tokio::fs::read(&bundle)
        .await
        .map_err(|e| LifecycleFailure::recoverable(format!("read bundle: {}", e)))
}

/// Clone the git bundle arriving on stdin into `dest` and check out `branch`.
///
/// With `must_not_exist` an existing `dest` exits with `EXIT_EXISTS`;
/// otherwise `dest` may be an existing empty directory.
pub fn clone_bundle_script(
    dest: &str,
    branch: &str,
    trunk: &str,
    must_not_exist: bool,
) -> Result<String> {
    let guard = if must_not_exist {
        "if [ -e \"$ws\" ]; then echo \"$ws already exists\" >&2; exit 3; fi\n"
    } else {
        ""
    };
    Ok(format!(
        r#"set -e
ws={ws}
{guard}mkdir -p "$(dirname "$ws")"
tmp="$(mktemp)"
trap 'rm -f "$tmp"' EXIT
cat > "$tmp"
git clone -q "$tmp" "$ws"
cd "$ws"
git checkout -q {branch} 2>/dev/null || git checkout -q -b {branch} {upstream} 2>/dev/null || git checkout -q -b {branch}"#,
        ws = quote_path(dest)?,
        guard = guard,
        branch = quote(branch)?,
        upstream = quote(&format!("origin/{}", trunk))?,
    ))
}

/// Map a lifecycle script's exit code onto a failure
pub fn lifecycle_failure(action: &str, out: &ExecOutput) -> LifecycleFailure {
    let detail = out.error_text();
    let message = if detail.is_empty() {
        format!("{} failed with exit code {}", action, out.exit_code)
    } else {
        format!("{} failed: {}", action, detail)
    };
    if out.aborted {
        return LifecycleFailure::recoverable(format!("{} aborted", action));
    }
    match out.exit_code {
        EXIT_EXISTS | EXIT_PARTIAL => LifecycleFailure::fatal(message),
        _ => LifecycleFailure::recoverable(message),
    }
}
