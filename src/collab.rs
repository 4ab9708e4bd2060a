//! External collaborators used by the update flow: pulling source and syncing
//! dependencies. Both run as child processes whose output is forwarded to the log.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

use crate::command::{dependency_sync_command, PackageManagerContext};
use crate::error::{DevrackError, Result};

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Brings the checkout in `working_dir` up to date.
    async fn pull(&self, working_dir: &Path) -> Result<()>;
}

#[async_trait]
pub trait DependencySync: Send + Sync {
    async fn sync(&self, ctx: &PackageManagerContext, working_dir: &Path) -> Result<()>;
}

/// `git pull --ff-only`.
#[derive(Debug, Clone, Default)]
pub struct GitSource;

#[async_trait]
impl SourceControl for GitSource {
    async fn pull(&self, working_dir: &Path) -> Result<()> {
        let mut command = Command::new("git");
        command.args(["pull", "--ff-only"]).current_dir(working_dir);
        run_logged(command, "git").await
    }
}

/// Runs `uv sync` or the pip install derived from the package manager context.
#[derive(Debug, Clone, Default)]
pub struct ShellDependencySync;

#[async_trait]
impl DependencySync for ShellDependencySync {
    async fn sync(&self, ctx: &PackageManagerContext, working_dir: &Path) -> Result<()> {
        let script = dependency_sync_command(ctx).ok_or_else(|| {
            DevrackError::update(format!(
                "no dependency manifest in {}",
                working_dir.display()
            ))
        })?;
        let mut command = Command::new("sh");
        command.args(["-c", &script]).current_dir(working_dir);
        run_logged(command, ctx.manager.as_str()).await
    }
}

async fn run_logged(mut command: Command, label: &'static str) -> Result<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|err| DevrackError::update(format!("failed to run {label}: {err}")))?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(label, out)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(label, err)));

    let status = child
        .wait()
        .await
        .map_err(|err| DevrackError::update(format!("{label} did not finish: {err}")))?;
    for task in [stdout, stderr].into_iter().flatten() {
        let _ = task.await;
    }

    if status.success() {
        Ok(())
    } else {
        Err(DevrackError::update(format!(
            "{label} exited with {}",
            status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "a signal".to_string())
        )))
    }
}

async fn forward_lines<R>(label: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "devrack::collab", "[{label}] {line}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::resolve_package_manager_context;
    use crate::descriptor::{AppDescriptor, AppKind};

    #[tokio::test]
    async fn reports_failing_commands_as_update_errors() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo nope >&2; exit 3"]);
        let err = run_logged(command, "sh").await.unwrap_err();
        assert_eq!(err.to_string(), "update error: sh exited with 3");
    }

    #[tokio::test]
    async fn sync_without_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppDescriptor::new("x", AppKind::Custom, dir.path()).with_custom_command("true");
        let ctx = resolve_package_manager_context(&app, dir.path());
        let err = ShellDependencySync.sync(&ctx, dir.path()).await.unwrap_err();
        assert!(matches!(err, DevrackError::Update(_)));
    }

    #[tokio::test]
    async fn pull_outside_a_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GitSource.pull(dir.path()).await,
            Err(DevrackError::Update(_))
        ));
    }
}
