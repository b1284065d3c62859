//! Cached git status per workspace (`git-status.json`)
//!
//! Recomputations may overlap; only the most recently started one persists.

use anvil_foundation::{AbortSignal, Error, Result, SequencedStore};
use anvil_process::collect_output;
use anvil_runtime::{ExecOptions, Runtime};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const GIT_STATUS_FILE: &str = "git-status.json";

const STATUS_COMMAND: &str = "git status --porcelain=v1 -b";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusSummary {
    /// `None` on a detached HEAD
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub staged: u32,
    pub modified: u32,
    pub untracked: u32,
    pub conflicted: u32,
    pub computed_at: Option<DateTime<Utc>>,
}

impl GitStatusSummary {
    pub fn is_clean(&self) -> bool {
        self.staged == 0 && self.modified == 0 && self.untracked == 0 && self.conflicted == 0
    }

    /// Parse `git status --porcelain=v1 -b`
    pub fn parse(output: &str) -> Self {
        let mut summary = Self::default();
        for line in output.lines() {
            if let Some(header) = line.strip_prefix("## ") {
                summary.parse_header(header);
                continue;
            }
            let mut chars = line.chars();
            let (Some(x), Some(y)) = (chars.next(), chars.next()) else {
                continue;
            };
            match (x, y) {
                ('?', '?') => summary.untracked += 1,
                ('!', '!') => {}
                ('U', _) | (_, 'U') | ('A', 'A') | ('D', 'D') => summary.conflicted += 1,
                _ => {
                    if x != ' ' {
                        summary.staged += 1;
                    }
                    if y != ' ' {
                        summary.modified += 1;
                    }
                }
            }
        }
        summary
    }

    fn parse_header(&mut self, header: &str) {
        // "main...origin/main [ahead 1, behind 2]", "HEAD (no branch)",
        // "No commits yet on main"
        let (refs, tracking) = match header.split_once(" [") {
            Some((refs, rest)) => (refs, rest.trim_end_matches(']')),
            None => (header, ""),
        };

        if let Some(branch) = refs.strip_prefix("No commits yet on ") {
            self.branch = Some(branch.to_string());
        } else if refs.starts_with("HEAD (no branch)") {
            self.branch = None;
        } else {
            match refs.split_once("...") {
                Some((local, upstream)) => {
                    self.branch = Some(local.to_string());
                    self.upstream = Some(upstream.to_string());
                }
                None => self.branch = Some(refs.to_string()),
            }
        }

        for part in tracking.split(", ") {
            if let Some(n) = part.strip_prefix("ahead ") {
                self.ahead = n.parse().unwrap_or(0);
            } else if let Some(n) = part.strip_prefix("behind ") {
                self.behind = n.parse().unwrap_or(0);
            }
        }
    }
}

/// Run `git status` through `runtime` and summarize it
pub async fn compute_git_status(
    runtime: &dyn Runtime,
    abort: Option<AbortSignal>,
) -> Result<GitStatusSummary> {
    let handle = runtime
        .exec(STATUS_COMMAND, ExecOptions::new().abort(abort))
        .await?;
    let out = collect_output(handle, None).await?;
    if out.aborted {
        return Err(Error::Cancelled);
    }
    if !out.success() {
        return Err(Error::Runtime(format!(
            "git status failed ({}): {}",
            out.exit_code,
            out.error_text()
        )));
    }

    let mut summary = GitStatusSummary::parse(&out.stdout);
    summary.computed_at = Some(Utc::now());
    Ok(summary)
}

/// Compute and persist, unless a later refresh for the same workspace started
/// in the meantime. Returns the summary and whether it was written.
pub async fn refresh(
    store: &SequencedStore<GitStatusSummary>,
    workspace_id: &str,
    runtime: &dyn Runtime,
    abort: Option<AbortSignal>,
) -> Result<(GitStatusSummary, bool)> {
    let ticket = store.begin(workspace_id);
    let summary = compute_git_status(runtime, abort).await?;
    let written = store.commit(&ticket, &summary).await?;
    debug!(workspace = workspace_id, written, clean = summary.is_clean(), "git status refreshed");
    Ok((summary, written))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tracking_branch() {
        let out = "## main...origin/main [ahead 2, behind 1]\n M src/lib.rs\nM  Cargo.toml\nMM README.md\n?? notes.txt\nUU conflict.rs\n";
        let s = GitStatusSummary::parse(out);
        assert_eq!(s.branch.as_deref(), Some("main"));
        assert_eq!(s.upstream.as_deref(), Some("origin/main"));
        assert_eq!((s.ahead, s.behind), (2, 1));
        assert_eq!(s.staged, 2);
        assert_eq!(s.modified, 2);
        assert_eq!(s.untracked, 1);
        assert_eq!(s.conflicted, 1);
        assert!(!s.is_clean());
    }

    #[test]
    fn test_parse_headers() {
        assert_eq!(
            GitStatusSummary::parse("## feature\n").branch.as_deref(),
            Some("feature")
        );
        assert_eq!(GitStatusSummary::parse("## HEAD (no branch)\n").branch, None);
        let fresh = GitStatusSummary::parse("## No commits yet on main\n");
        assert_eq!(fresh.branch.as_deref(), Some("main"));
        assert!(fresh.is_clean());
    }

    #[test]
    fn test_parse_gone_upstream() {
        let s = GitStatusSummary::parse("## topic...origin/topic [gone]\n");
        assert_eq!(s.upstream.as_deref(), Some("origin/topic"));
        assert_eq!((s.ahead, s.behind), (0, 0));
    }
}
