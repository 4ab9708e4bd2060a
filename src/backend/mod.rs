//! Session backends.
//!
//! A session is a named execution context that runs one app's command. The orchestrator
//! only knows sessions by name; how they map to tmux windows, Terminal windows or plain
//! processes is up to the backend.
//!
//! # Restart-in-place protocol
//!
//! Backends that report `supports_restart_in_place` wrap the app command with
//! [`restart_loop_script`]: the wrapper runs the command, and when it exits prints a
//! prompt and blocks reading a line. `send_continue` delivers that line, which runs the
//! command again in the same session. End-of-input ends the session. The wrapper handles
//! SIGINT itself so an interrupt stops the app but not the loop.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Settings;
use crate::error::Result;

mod detached;
mod terminal;
mod tmux;

pub use detached::DetachedBackend;
pub use terminal::TerminalBackend;
pub use tmux::TmuxBackend;

/// Which session technology to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One tmux window per app inside a shared tmux session.
    #[default]
    Tmux,
    /// One macOS Terminal window per app.
    Terminal,
    /// Plain background processes tracked through pid files.
    Detached,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Short name used in logs and `Unsupported` errors.
    fn name(&self) -> &'static str;

    /// Whether sessions run the restart loop and accept `send_continue`.
    fn supports_restart_in_place(&self) -> bool;

    /// Runs `command` in `working_dir` under a new session called `name`.
    ///
    /// Fails with `SessionExists` if the name is taken, or `Backend` if the
    /// underlying technology refuses.
    async fn create_session(&self, name: &str, working_dir: &Path, command: &str) -> Result<()>;

    /// Names compare case-insensitively. Lookup failures read as "absent".
    async fn session_exists(&self, name: &str) -> bool;

    /// Best-effort Ctrl-C to the session's foreground process.
    async fn send_interrupt(&self, name: &str) -> Result<()>;

    /// Best-effort "run again" for a session parked in the restart loop.
    async fn send_continue(&self, name: &str) -> Result<()>;

    /// Destroys the session unconditionally.
    async fn kill_session(&self, name: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<String>>;
}

/// Builds the backend selected in the settings.
pub fn from_settings(settings: &Settings) -> Box<dyn SessionBackend> {
    from_kind(
        settings.backend,
        &settings.tmux_session,
        settings.state_dir.clone(),
    )
}

pub fn from_kind(kind: BackendKind, tmux_session: &str, state_dir: PathBuf) -> Box<dyn SessionBackend> {
    match kind {
        BackendKind::Tmux => Box::new(TmuxBackend::new(tmux_session)),
        BackendKind::Terminal => Box::new(TerminalBackend::new()),
        BackendKind::Detached => Box::new(DetachedBackend::new(state_dir)),
    }
}

/// Wraps `command` in the restart loop described in the module docs.
pub fn restart_loop_script(name: &str, command: &str) -> String {
    let prompt = format!("[devrack] {name} exited; press Enter to restart");
    format!(
        "trap : INT; while :; do ( {command}\n ); printf '\\n%s\\n' {}; read -r _ || break; done",
        shell_words::quote(&prompt)
    )
}
