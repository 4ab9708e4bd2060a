//! Runtime settings for devrack.
//!
//! This module defines the structure of the optional `devrack.toml` settings file.
//! Every field is optional; `Settings::resolve` fills in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backend::BackendKind;

pub const DEFAULT_SETTINGS_FILE: &str = "devrack.toml";
pub const DEFAULT_TMUX_SESSION: &str = "devrack";

/// Top-level structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Session technology: "tmux", "terminal" or "detached".
    pub backend: Option<BackendKind>,
    /// Name of the tmux session that holds one window per app.
    pub tmux_session: Option<String>,
    /// Upper bound for waiting on a port to be released (milliseconds).
    pub port_wait_timeout_ms: Option<u64>,
    /// Interval between port ownership polls (milliseconds).
    pub port_poll_interval_ms: Option<u64>,
    /// Pause between consecutive launches in batch operations (milliseconds).
    pub launch_delay_ms: Option<u64>,
    /// Whether restarts reuse the existing session when the backend allows it.
    pub restart_in_place: Option<bool>,
    /// How deep to search for `manage.py` in Django apps.
    pub django_search_depth: Option<usize>,
    /// Where the detached backend keeps pid and log files.
    pub state_dir: Option<PathBuf>,
}

/// Settings with defaults applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendKind,
    pub tmux_session: String,
    pub port_wait_timeout: Duration,
    pub port_poll_interval: Duration,
    pub launch_delay: Duration,
    pub restart_in_place: bool,
    pub django_search_depth: usize,
    pub state_dir: PathBuf,
}

impl Settings {
    pub fn resolve(config: Config) -> Self {
        Self {
            backend: config.backend.unwrap_or_default(),
            tmux_session: config
                .tmux_session
                .unwrap_or_else(|| DEFAULT_TMUX_SESSION.to_string()),
            port_wait_timeout: Duration::from_millis(config.port_wait_timeout_ms.unwrap_or(10_000)),
            port_poll_interval: Duration::from_millis(
                config.port_poll_interval_ms.unwrap_or(250).max(10),
            ),
            launch_delay: Duration::from_millis(config.launch_delay_ms.unwrap_or(500)),
            restart_in_place: config.restart_in_place.unwrap_or(true),
            django_search_depth: config.django_search_depth.unwrap_or(3),
            state_dir: config.state_dir.unwrap_or_else(default_state_dir),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::resolve(Config::default())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("devrack")
}

/// Loads and parses the settings from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
