//! tmux backend: every app is a window inside one shared tmux session.
//!
//! The shared session is created on demand with a placeholder window, because tmux
//! cannot create an empty session. The placeholder is removed as soon as the first app
//! window exists.

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{restart_loop_script, SessionBackend};
use crate::error::{DevrackError, Result};

const PLACEHOLDER_WINDOW: &str = "__devrack__";

#[derive(Debug, Clone)]
pub struct TmuxBackend {
    session: String,
}

/// A window as reported by `list-windows`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    index: u32,
    name: String,
}

impl TmuxBackend {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    async fn tmux(&self, args: &[&str]) -> Result<Output> {
        debug!(?args, "tmux");
        let output = Command::new("tmux").args(args).output().await.map_err(|err| {
            DevrackError::backend(format!("failed to run tmux: {err}"))
        })?;
        Ok(output)
    }

    async fn tmux_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.tmux(args).await?;
        if !output.status.success() {
            return Err(DevrackError::backend(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    fn session_target(&self) -> String {
        format!("={}", self.session)
    }

    async fn has_session(&self) -> bool {
        self.tmux(&["has-session", "-t", &self.session_target()])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn windows(&self) -> Vec<Window> {
        let target = self.session_target();
        match self
            .tmux(&[
                "list-windows",
                "-t",
                &target,
                "-F",
                "#{window_index}\t#{window_name}",
            ])
            .await
        {
            Ok(output) if output.status.success() => {
                parse_windows(&String::from_utf8_lossy(&output.stdout))
            }
            _ => Vec::new(),
        }
    }

    async fn find_window(&self, name: &str) -> Option<Window> {
        self.windows()
            .await
            .into_iter()
            .find(|window| window.name.eq_ignore_ascii_case(name))
    }

    fn window_target(&self, window: &Window) -> String {
        format!("={}:{}", self.session, window.index)
    }

    async fn send_keys(&self, name: &str, key: &str) -> Result<()> {
        let window = self
            .find_window(name)
            .await
            .ok_or_else(|| DevrackError::backend(format!("no tmux window named '{name}'")))?;
        self.tmux_checked(&["send-keys", "-t", &self.window_target(&window), key])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn supports_restart_in_place(&self) -> bool {
        true
    }

    async fn create_session(&self, name: &str, working_dir: &Path, command: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(PLACEHOLDER_WINDOW) {
            return Err(DevrackError::backend(format!("'{name}' is a reserved window name")));
        }
        if !self.has_session().await {
            self.tmux_checked(&[
                "new-session",
                "-d",
                "-s",
                &self.session,
                "-n",
                PLACEHOLDER_WINDOW,
            ])
            .await?;
        } else if self.find_window(name).await.is_some() {
            return Err(DevrackError::SessionExists(name.to_string()));
        }

        let script = restart_loop_script(name, command);
        let dir = working_dir.to_string_lossy();
        let target = format!("{}:", self.session_target());
        self.tmux_checked(&[
            "new-window", "-d", "-t", &target, "-n", name, "-c", &dir, "sh", "-c", &script,
        ])
        .await?;

        if let Some(placeholder) = self.find_window(PLACEHOLDER_WINDOW).await {
            if let Err(err) = self
                .tmux_checked(&["kill-window", "-t", &self.window_target(&placeholder)])
                .await
            {
                warn!(error = %err, "failed to remove placeholder window");
            }
        }
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.find_window(name).await.is_some()
    }

    async fn send_interrupt(&self, name: &str) -> Result<()> {
        self.send_keys(name, "C-c").await
    }

    async fn send_continue(&self, name: &str) -> Result<()> {
        self.send_keys(name, "Enter").await
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let Some(window) = self.find_window(name).await else {
            return Ok(());
        };
        self.tmux_checked(&["kill-window", "-t", &self.window_target(&window)])
            .await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self
            .windows()
            .await
            .into_iter()
            .filter(|window| window.name != PLACEHOLDER_WINDOW)
            .map(|window| window.name)
            .collect())
    }
}

fn parse_windows(raw: &str) -> Vec<Window> {
    raw.lines()
        .filter_map(|line| {
            let (index, name) = line.split_once('\t')?;
            Some(Window {
                index: index.trim().parse().ok()?,
                name: name.to_string(),
            })
        })
        .collect()
}
