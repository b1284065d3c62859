//! File streams shared by the backends
//!
//! Local backends read and write the filesystem directly. Remote backends
//! pipe through an exec'd shell (`cat`), keeping the `ExecHandle` alive for
//! as long as the stream is.

use anvil_foundation::storage::temp_path_for;
use anvil_foundation::{Error, Result};
use anvil_process::{ExecHandle, ExecRequest};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, warn};

/// Readable byte stream returned by `Runtime::read_file`
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Writable sink returned by `Runtime::write_file`.
///
/// Nothing is visible at the target path until `commit()` succeeds; dropping
/// an uncommitted sink discards the data.
#[async_trait]
pub trait FileSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;
}

// ============================================================================
// Paths
// ============================================================================

/// Expand a leading `~` segment to the local home directory
pub fn expand_local_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `~` and resolve relative paths against `base`
pub fn resolve_local(base: &Path, path: &str) -> PathBuf {
    let expanded = expand_local_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn map_io(path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.display().to_string())
    } else {
        Error::Storage(format!("{}: {}", path.display(), e))
    }
}

// ============================================================================
// Local
// ============================================================================

pub async fn local_read(path: &Path) -> Result<ByteStream> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| map_io(path, e))?;
    Ok(Box::pin(file))
}

pub async fn local_stat(path: &Path) -> Result<crate::runtime::FileStat> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| map_io(path, e))?;
    Ok(crate::runtime::FileStat {
        size: if meta.is_dir() { 0 } else { meta.len() },
        is_directory: meta.is_dir(),
    })
}

/// Temp file beside the target, renamed into place on commit
pub struct LocalFileSink {
    target: PathBuf,
    temp: PathBuf,
    file: Option<tokio::fs::File>,
    committed: bool,
}

impl LocalFileSink {
    pub async fn open(target: PathBuf) -> Result<Self> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(parent, e))?;
        }
        let temp = temp_path_for(&target);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await
            .map_err(|e| map_io(&temp, e))?;
        Ok(Self {
            target,
            temp,
            file: Some(file),
            committed: false,
        })
    }
}

#[async_trait]
impl FileSink for LocalFileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Storage("sink already committed".into()))?;
        file.write_all(chunk).await.map_err(|e| map_io(&self.temp, e))
    }

    async fn commit(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::Storage("sink already committed".into()))?;
        file.flush().await.map_err(|e| map_io(&self.temp, e))?;
        file.sync_all().await.map_err(|e| map_io(&self.temp, e))?;
        drop(file);

        tokio::fs::rename(&self.temp, &self.target)
            .await
            .map_err(|e| map_io(&self.target, e))?;
        self.committed = true;
        debug!(path = %self.target.display(), "file committed");
        Ok(())
    }
}

impl Drop for LocalFileSink {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

// ============================================================================
// Remote (exec-backed)
// ============================================================================

/// stdout of an exec'd process; the process lives as long as the reader
pub struct ExecReader {
    stdout: ChildStdout,
    _handle: ExecHandle,
}

impl ExecReader {
    pub fn new(mut handle: ExecHandle) -> Result<Self> {
        let stdout = handle
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("exec stdout not piped".into()))?;
        // stderr is unused; closing it keeps the child from blocking on it
        handle.stderr.take();
        handle.close_stdin();
        Ok(Self {
            stdout,
            _handle: handle,
        })
    }
}

impl AsyncRead for ExecReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

/// Sink backed by a remote `cat > tmp && mv tmp target` process
pub struct ExecFileSink {
    target: String,
    stdin: Option<ChildStdin>,
    handle: Option<ExecHandle>,
}

impl ExecFileSink {
    pub fn new(target: impl Into<String>, mut handle: ExecHandle) -> Result<Self> {
        let stdin = handle
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("exec stdin not piped".into()))?;
        Ok(Self {
            target: target.into(),
            stdin: Some(stdin),
            handle: Some(handle),
        })
    }
}

#[async_trait]
impl FileSink for ExecFileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Storage("sink already committed".into()))?;
        stdin
            .write_all(chunk)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", self.target, e)))
    }

    async fn commit(&mut self) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Storage("sink already committed".into()))?;
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                warn!(path = %self.target, "failed to close remote stdin: {}", e);
            }
        }

        let stderr = handle.stderr.take();
        let status = handle.wait().await?;
        if !status.success() {
            let mut message = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut message).await;
            }
            return Err(Error::Storage(format!(
                "failed to write {}: {}",
                self.target,
                message.trim()
            )));
        }
        Ok(())
    }
}

/// Build the remote write script for `quoted_target`
pub fn remote_write_script(quoted_target: &str) -> String {
    format!(
        "t={target}; mkdir -p \"$(dirname \"$t\")\" && tmp=\"$t.anvil-tmp.$$\" && cat > \"$tmp\" && mv -f \"$tmp\" \"$t\"",
        target = quoted_target
    )
}

/// Build the remote stat script; exits 44 when the path does not exist
pub fn remote_stat_script(quoted_target: &str) -> String {
    format!(
        "p={target}; if [ -d \"$p\" ]; then echo 'd 0'; elif [ -e \"$p\" ]; then echo \"f $(wc -c < \"$p\")\"; else exit 44; fi",
        target = quoted_target
    )
}

/// Exit code of `remote_stat_script` for a missing path
pub const STAT_MISSING_EXIT: i32 = 44;

pub fn parse_stat_output(output: &str) -> Result<crate::runtime::FileStat> {
    let mut parts = output.split_whitespace();
    let kind = parts.next();
    let size = parts.next().and_then(|s| s.parse::<u64>().ok());
    match (kind, size) {
        (Some("d"), Some(size)) => Ok(crate::runtime::FileStat {
            size,
            is_directory: true,
        }),
        (Some("f"), Some(size)) => Ok(crate::runtime::FileStat {
            size,
            is_directory: false,
        }),
        _ => Err(Error::Runtime(format!("unexpected stat output: {:?}", output))),
    }
}

/// Spawn helper used by remote readers and sinks
pub fn spawn_remote(request: ExecRequest) -> Result<ExecHandle> {
    anvil_process::spawn_exec(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_local_tilde("~/x/y"), home.join("x/y"));
        assert_eq!(expand_local_tilde("~"), home);
        assert_eq!(expand_local_tilde("/abs/~/x"), PathBuf::from("/abs/~/x"));
        assert_eq!(expand_local_tilde("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn test_resolve_relative() {
        assert_eq!(
            resolve_local(Path::new("/ws"), "src/main.rs"),
            PathBuf::from("/ws/src/main.rs")
        );
        assert_eq!(resolve_local(Path::new("/ws"), "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_parse_stat_output() {
        assert_eq!(
            parse_stat_output("f 12\n").unwrap(),
            crate::runtime::FileStat {
                size: 12,
                is_directory: false
            }
        );
        assert!(parse_stat_output("d 0").unwrap().is_directory);
        assert!(parse_stat_output("garbage").is_err());
    }

    #[tokio::test]
    async fn test_local_sink_commit_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out.txt");

        let mut sink = LocalFileSink::open(target.clone()).await.unwrap();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        assert!(!target.exists());
        sink.commit().await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello world");

        let mut discarded = LocalFileSink::open(target.clone()).await.unwrap();
        discarded.write(b"partial").await.unwrap();
        drop(discarded);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello world");
        let leftovers = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_local_read_and_stat_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(local_read(&missing).await, Err(Error::NotFound(_))));
        assert!(matches!(local_stat(&missing).await, Err(Error::NotFound(_))));

        std::fs::write(dir.path().join("a"), "abc").unwrap();
        let mut buf = String::new();
        local_read(&dir.path().join("a"))
            .await
            .unwrap()
            .read_to_string(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, "abc");
        assert_eq!(local_stat(&dir.path().join("a")).await.unwrap().size, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_scripts_through_local_shell() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/file.txt");
        let quoted = shlex::try_quote(target.to_str().unwrap()).unwrap().into_owned();

        let handle = spawn_remote(ExecRequest::shell(remote_write_script(&quoted))).unwrap();
        let mut sink = ExecFileSink::new(target.to_string_lossy(), handle).unwrap();
        sink.write(b"remote bytes").await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "remote bytes");

        let out = anvil_process::exec_buffered(
            ExecRequest::shell(remote_stat_script(&quoted)),
            None,
        )
        .await
        .unwrap();
        assert_eq!(parse_stat_output(&out.stdout).unwrap().size, 12);

        let missing = shlex::try_quote(dir.path().join("nope").to_str().unwrap())
            .unwrap()
            .into_owned();
        let out = anvil_process::exec_buffered(ExecRequest::shell(remote_stat_script(&missing)), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, STAT_MISSING_EXIT);
    }
}
