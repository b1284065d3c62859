//! Subcommand handlers

use crate::cli::{parse_runtime, Command};
use crate::console::ConsoleLogger;
use anvil_foundation::AbortSignal;
use anvil_runtime::{ExecOptions, InitLogger, RuntimeConfig};
use anvil_workspace::{CreateOptions, WorkspaceMetadata, WorkspaceService};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

fn logger() -> Arc<dyn InitLogger> {
    Arc::new(ConsoleLogger)
}

/// Map a child exit code onto ours; signals and sentinels become 1
fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

pub async fn run(
    command: Command,
    service: &WorkspaceService,
    abort: AbortSignal,
) -> anyhow::Result<ExitCode> {
    match command {
        Command::Exec {
            workspace,
            runtime,
            command,
        } => exec(service, &workspace, runtime.as_deref(), &command, abort).await,

        Command::Create {
            name,
            trunk,
            runtime,
        } => {
            let mut options = CreateOptions::default();
            if let Some(raw) = runtime {
                options = options.runtime(parse_runtime(&raw, service.settings())?);
            }
            if let Some(trunk) = trunk {
                options = options.trunk(trunk);
            }
            let meta = service
                .create(&name, options, logger(), Some(abort))
                .await?;
            println!("{}", meta.workspace_path.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Fork {
            source,
            new,
            no_fallback,
        } => {
            let meta = service
                .fork(&source, &new, !no_fallback, logger(), Some(abort))
                .await?;
            println!("{}", meta.workspace_path.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Delete { name, force } => {
            service.delete(&name, force, Some(abort)).await?;
            eprintln!("deleted {}", name);
            Ok(ExitCode::SUCCESS)
        }

        Command::Rename { old, new } => {
            let meta = service.rename(&old, &new, Some(abort)).await?;
            println!("{}", meta.workspace_path.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::SyncIgnored { source, dest } => {
            let report = service.sync_ignored(&source, &dest).await?;
            for path in &report.copied {
                println!("copied   {}", path.display());
            }
            for path in &report.skipped_existing {
                println!("skipped  {}", path.display());
            }
            for path in &report.failed {
                println!("failed   {}", path.display());
            }
            if report.is_empty() {
                eprintln!("nothing to sync");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::List => {
            let workspaces = service.list().await?;
            if workspaces.is_empty() {
                eprintln!("no workspaces for {}", service.project_path().display());
            }
            for meta in &workspaces {
                println!("{}", list_row(meta));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn list_row(meta: &WorkspaceMetadata) -> String {
    let mut row = format!(
        "{:<24} {:<9} {:<16} {}",
        meta.name,
        meta.runtime_config.kind().as_str(),
        meta.trunk_branch,
        meta.workspace_path.display()
    );
    if let Some(source) = &meta.forked_from {
        row.push_str(&format!("  (from {})", source));
    }
    row
}

async fn exec(
    service: &WorkspaceService,
    workspace: &str,
    runtime: Option<&str>,
    command: &[String],
    abort: AbortSignal,
) -> anyhow::Result<ExitCode> {
    let runtime = match runtime {
        Some(raw) => {
            let config: RuntimeConfig = parse_runtime(raw, service.settings())?
                .for_workspace(service.project_path(), workspace);
            service.runtime_with(&config, workspace)?
        }
        None => service.runtime_for(workspace).await?,
    };

    let line = shlex::try_join(command.iter().map(String::as_str))?;
    let options = ExecOptions::new()
        .timeout(service.settings().exec.default_timeout())
        .abort(Some(abort));
    let mut handle = runtime.exec(&line, options).await?;
    handle.close_stdin();

    let stdout = handle.stdout.take();
    let stderr = handle.stderr.take();
    let pump_out = async {
        if let Some(mut out) = stdout {
            let mut sink = tokio::io::stdout();
            let _ = tokio::io::copy(&mut out, &mut sink).await;
            let _ = sink.flush().await;
        }
    };
    let pump_err = async {
        if let Some(mut err) = stderr {
            let mut sink = tokio::io::stderr();
            let _ = tokio::io::copy(&mut err, &mut sink).await;
        }
    };
    let released = handle.released();
    tokio::select! {
        _ = async { tokio::join!(pump_out, pump_err) } => {}
        _ = released.cancelled() => {}
    }

    let status = handle.wait().await?;
    if status.timed_out {
        eprintln!("timed out after {:?}", status.duration);
    } else if status.aborted {
        eprintln!("aborted");
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::from(exit_byte(status.exit_code)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_list_row_marks_forks() {
        let meta = WorkspaceMetadata::new(
            "feat-2",
            "/code/app",
            "/src/app/feat-2",
            RuntimeConfig::default(),
            "feat",
        )
        .forked_from("feat");
        let row = list_row(&meta);
        assert!(row.starts_with("feat-2"));
        assert!(row.contains("worktree"));
        assert!(row.ends_with("/src/app/feat-2  (from feat)"));

        let plain =
            WorkspaceMetadata::new("a", "/p", PathBuf::from("/p"), RuntimeConfig::Local, "main");
        assert!(!list_row(&plain).contains("from"));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_byte(0), 0);
        assert_eq!(exit_byte(3), 3);
        assert_eq!(exit_byte(-998), 1);
    }
}
