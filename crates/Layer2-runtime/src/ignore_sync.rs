//! Ignore-pattern sync
//!
//! Copies selected git-ignored files (`.env`, local secrets) from a source
//! checkout into a fresh workspace. The selection file uses gitignore syntax
//! but only its negation lines count:
//!
//! ```text
//! # copy every .env file
//! !.env*
//! # but not the example
//! !!.env.example
//! ```
//!
//! Best effort: nothing here fails workspace creation.

use crate::git::Git;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: Vec<PathBuf>,
    pub skipped_existing: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.copied.is_empty() && self.skipped_existing.is_empty() && self.failed.is_empty()
    }
}

/// Extract the copy patterns from an ignore-sync file.
///
/// `!x` yields `x` (copy), `!!x` yields `!x` (exception). Everything else
/// is inert.
pub fn parse_ignore_sync(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix('!'))
        .filter(|pattern| !pattern.is_empty() && *pattern != "!")
        .map(str::to_string)
        .collect()
}

/// Git pathspecs that cover every candidate of the positive patterns
pub fn pathspecs_for(patterns: &[String]) -> Vec<String> {
    let mut specs = Vec::new();
    for pattern in patterns.iter().filter(|p| !p.starts_with('!')) {
        let dir_only = pattern.ends_with('/');
        let body = pattern.trim_end_matches('/');
        let rooted = body.starts_with('/') || body.contains('/');
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            continue;
        }

        let mut bases = vec![body.to_string()];
        if !rooted {
            bases.push(format!("**/{}", body));
        }
        for base in bases {
            if !dir_only {
                specs.push(format!(":(glob){}", base));
            }
            specs.push(format!(":(glob){}/**", base));
        }
    }
    specs.dedup();
    specs
}

fn build_matcher(root: &Path, patterns: &[String]) -> Option<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        if let Err(e) = builder.add_line(None, pattern) {
            warn!(pattern = %pattern, "invalid ignore-sync pattern: {}", e);
        }
    }
    match builder.build() {
        Ok(matcher) => Some(matcher),
        Err(e) => {
            warn!("failed to build ignore-sync matcher: {}", e);
            None
        }
    }
}

/// Copy matching ignored files from `source` to `dest`, never overwriting.
///
/// `file_name` is the selection file, read from `source`.
pub async fn sync_ignored_files(source: &Path, dest: &Path, file_name: &str) -> SyncReport {
    let mut report = SyncReport::default();

    let content = match tokio::fs::read_to_string(source.join(file_name)).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(source = %source.display(), "no {} file, nothing to sync", file_name);
            return report;
        }
        Err(e) => {
            warn!(source = %source.display(), "failed to read {}: {}", file_name, e);
            return report;
        }
    };

    let patterns = parse_ignore_sync(&content);
    if patterns.is_empty() {
        return report;
    }

    let candidates = match Git::new(source).ls_ignored(&pathspecs_for(&patterns)).await {
        Ok(files) => files,
        Err(e) => {
            warn!(source = %source.display(), "failed to list ignored files: {}", e);
            return report;
        }
    };

    let Some(matcher) = build_matcher(source, &patterns) else {
        return report;
    };

    for relative in candidates {
        let relative = PathBuf::from(relative);
        // an "ignore" match is a copy pattern; a whitelist match is a `!!` exception
        if !matcher
            .matched_path_or_any_parents(&relative, false)
            .is_ignore()
        {
            continue;
        }

        let from = source.join(&relative);
        let to = dest.join(&relative);
        if tokio::fs::symlink_metadata(&to).await.is_ok() {
            debug!(path = %relative.display(), "destination exists, not overwriting");
            report.skipped_existing.push(relative);
            continue;
        }

        match copy_one(&from, &to).await {
            Ok(()) => report.copied.push(relative),
            Err(e) => {
                warn!(path = %relative.display(), "failed to copy ignored file: {}", e);
                report.failed.push(relative);
            }
        }
    }

    if !report.copied.is_empty() {
        info!(
            dest = %dest.display(),
            copied = report.copied.len(),
            skipped = report.skipped_existing.len(),
            "synced ignored files"
        );
    }
    report
}

async fn copy_one(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await.map(drop)
}
