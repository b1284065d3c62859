//! SSH askpass bridge
//!
//! `ssh` is pointed at a generated `SSH_ASKPASS` script. The script drops the
//! prompt into `<id>.req` in a private directory and polls for `<id>.resp`.
//! A poller task picks up requests (consuming the `.req` file), runs them
//! through the `PromptSession`, and writes the answer back atomically.

use anvil_foundation::{
    write_atomic, AbortSignal, Error, PromptInput, PromptSession, Result,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SCRIPT_NAME: &str = "askpass.sh";
/// Tail of ssh stderr kept as context for the next prompt
const CONTEXT_LIMIT: usize = 4096;

/// Append `text`, keeping only the last `limit` bytes on a char boundary
fn push_tail(buf: &mut String, text: &str, limit: usize) {
    buf.push_str(text);
    if buf.len() > limit {
        let mut cut = buf.len() - limit;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

fn script_body(dir: &Path, give_up_after: Duration) -> Result<String> {
    let dir = shlex::try_quote(&dir.to_string_lossy())
        .map(|q| q.into_owned())
        .map_err(|e| Error::invalid_input(format!("askpass dir: {}", e)))?;
    // ten polls per second
    let max_polls = give_up_after.as_millis() / 100 + 1;
    Ok(format!(
        r#"#!/bin/sh
dir={dir}
id="$$.$(date +%s)"
printf '%s' "$1" > "$dir/$id.tmp" && mv "$dir/$id.tmp" "$dir/$id.req" || exit 1
n=0
while [ ! -f "$dir/$id.resp" ]; do
  n=$((n + 1))
  if [ "$n" -gt {max_polls} ]; then rm -f "$dir/$id.req" "$dir/$id.resp"; exit 1; fi
  sleep 0.1
done
cat "$dir/$id.resp"
echo
rm -f "$dir/$id.req" "$dir/$id.resp"
"#
    ))
}

/// Private askpass endpoint for one SSH target
pub struct AskpassBridge {
    dir: TempDir,
    script: PathBuf,
    stop: AbortSignal,
    session: Arc<PromptSession>,
    context: Arc<Mutex<String>>,
}

impl std::fmt::Debug for AskpassBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AskpassBridge")
            .field("dir", &self.dir.path())
            .finish()
    }
}

impl AskpassBridge {
    /// Create the script and start polling. Must be called inside a tokio runtime.
    pub fn start(session: Arc<PromptSession>, dedupe_key: impl Into<String>) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("anvil-askpass-").tempdir()?;
        let script = dir.path().join(SCRIPT_NAME);
        let give_up_after = session.policy().response_timeout + Duration::from_secs(5);
        std::fs::write(&script, script_body(dir.path(), give_up_after)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))?;
        }

        let stop = AbortSignal::new();
        let context = Arc::new(Mutex::new(String::new()));
        tokio::spawn(poll_requests(
            dir.path().to_path_buf(),
            Arc::clone(&session),
            dedupe_key.into(),
            Arc::clone(&context),
            stop.clone(),
        ));

        debug!(dir = %dir.path().display(), "askpass bridge started");
        Ok(Self {
            dir,
            script,
            stop,
            session,
            context,
        })
    }

    /// Record ssh stderr; it is handed to the next prompt as context
    pub fn note_stderr(&self, text: &str) {
        push_tail(&mut self.context.lock(), text, CONTEXT_LIMIT);
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    pub fn session(&self) -> &Arc<PromptSession> {
        &self.session
    }

    /// Environment that routes ssh prompts through the bridge
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "SSH_ASKPASS".to_string(),
            self.script.to_string_lossy().into_owned(),
        );
        env.insert("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string());
        env.insert(
            "DISPLAY".to_string(),
            std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()),
        );
        env
    }
}

impl Drop for AskpassBridge {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn poll_requests(
    dir: PathBuf,
    session: Arc<PromptSession>,
    dedupe_key: String,
    context: Arc<Mutex<String>>,
    stop: AbortSignal,
) {
    // ids whose request file could not be removed; pruned once it disappears
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("askpass directory unreadable, stopping: {}", e);
                break;
            }
        };

        let mut present = HashSet::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".req") else {
                continue;
            };
            present.insert(id.to_string());
            if seen.contains(id) {
                continue;
            }

            let prompt = match tokio::fs::read_to_string(entry.path()).await {
                Ok(prompt) => prompt,
                Err(e) => {
                    warn!(request = %id, "failed to read askpass request: {}", e);
                    seen.insert(id.to_string());
                    continue;
                }
            };
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                debug!(request = %id, "failed to consume askpass request: {}", e);
                seen.insert(id.to_string());
            }

            let response_path = dir.join(format!("{}.resp", id));
            let session = Arc::clone(&session);
            let stderr = std::mem::take(&mut *context.lock());
            let mut input = PromptInput::new(prompt).with_dedupe_key(dedupe_key.clone());
            if !stderr.is_empty() {
                input = input.with_stderr_context(stderr);
            }
            tokio::spawn(async move {
                let resolution = session.mediate(input).await;
                debug!(reason = ?resolution.reason, "askpass prompt resolved");
                if let Err(e) = write_atomic(&response_path, resolution.response.as_bytes()).await
                {
                    warn!(path = %response_path.display(), "failed to write askpass response: {}", e);
                }
            });
        }
        seen.retain(|id| present.contains(id));
    }
}
