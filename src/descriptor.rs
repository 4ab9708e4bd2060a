//! Declarative app descriptors.
//!
//! An `AppDescriptor` is one entry of the JSON descriptor file. Field names follow the
//! on-disk format (`Name`, `Type`, `AppPath`, `IndexPath`, ...); keys this crate does
//! not know about are kept in `extra` so a load/save cycle does not drop them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DevrackError, Result};

/// The framework an app is built with, which decides how it is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum AppKind {
    Streamlit,
    Django,
    Flask,
    Dash,
    Custom,
}

impl AppKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AppKind::Streamlit => "streamlit",
            AppKind::Django => "django",
            AppKind::Flask => "flask",
            AppKind::Dash => "dash",
            AppKind::Custom => "custom",
        }
    }

    /// Custom commands pick their own port and Django falls back to the framework default.
    pub fn requires_port(self) -> bool {
        !matches!(self, AppKind::Custom | AppKind::Django)
    }

    pub fn requires_entry_point(self) -> bool {
        matches!(self, AppKind::Streamlit | AppKind::Flask | AppKind::Dash)
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppKind {
    type Err = DevrackError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "streamlit" => Ok(AppKind::Streamlit),
            "django" => Ok(AppKind::Django),
            "flask" => Ok(AppKind::Flask),
            "dash" => Ok(AppKind::Dash),
            "custom" => Ok(AppKind::Custom),
            other => Err(DevrackError::config(format!("unsupported app type '{other}'"))),
        }
    }
}

impl TryFrom<String> for AppKind {
    type Error = DevrackError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Package manager used to run and sync an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum PackageManager {
    /// `uv`: commands run through `uv run`, dependencies via `uv sync`.
    Uv,
    /// `pip`: commands run inside an activated virtual environment.
    Pip,
}

impl PackageManager {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Uv => "uv",
            PackageManager::Pip => "pip",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = DevrackError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "uv" => Ok(PackageManager::Uv),
            "pip" => Ok(PackageManager::Pip),
            other => Err(DevrackError::config(format!(
                "unsupported package manager '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for PackageManager {
    type Error = DevrackError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Declarative description of one manageable app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Unique key, compared case-insensitively. Also the session name.
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: AppKind,
    #[serde(rename = "Port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "AppPath")]
    pub working_dir: PathBuf,
    /// Relative to `working_dir`.
    #[serde(rename = "IndexPath", default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(rename = "VenvPath", default, skip_serializing_if = "Option::is_none")]
    pub venv_path: Option<PathBuf>,
    #[serde(
        rename = "PackageManager",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub package_manager: Option<PackageManager>,
    /// URL sub-path, only meaningful for Streamlit apps.
    #[serde(rename = "BasePath", default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    /// Required for custom apps; overrides the management command for Django apps.
    #[serde(
        rename = "CustomCommand",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_command: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AppDescriptor {
    /// Creates a descriptor with only the mandatory fields set.
    pub fn new(name: impl Into<String>, kind: AppKind, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            port: None,
            working_dir: working_dir.into(),
            entry_point: None,
            venv_path: None,
            package_manager: None,
            base_path: None,
            custom_command: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_entry_point(mut self, entry: impl Into<String>) -> Self {
        self.entry_point = Some(entry.into());
        self
    }

    pub fn with_package_manager(mut self, manager: PackageManager) -> Self {
        self.package_manager = Some(manager);
        self
    }

    pub fn with_custom_command(mut self, command: impl Into<String>) -> Self {
        self.custom_command = Some(command.into());
        self
    }

    pub fn with_venv_path(mut self, venv: impl Into<PathBuf>) -> Self {
        self.venv_path = Some(venv.into());
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Checks the fields that do not depend on filesystem state.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DevrackError::config("app name must not be empty"));
        }
        if self.port == Some(0) {
            return Err(DevrackError::config(format!(
                "{}: port must be a positive integer",
                self.name
            )));
        }
        if self.kind.requires_port() && self.port.is_none() {
            return Err(DevrackError::config(format!(
                "{}: {} apps require a port",
                self.name, self.kind
            )));
        }
        if self.kind.requires_entry_point() && non_blank(self.entry_point.as_deref()).is_none() {
            return Err(DevrackError::config(format!(
                "{}: {} apps require an entry point",
                self.name, self.kind
            )));
        }
        if self.kind == AppKind::Custom && non_blank(self.custom_command.as_deref()).is_none() {
            return Err(DevrackError::config(format!(
                "{}: custom apps require a command",
                self.name
            )));
        }
        Ok(())
    }

    /// Checks that the working directory (and entry point, where one is required) exist.
    ///
    /// Returns the working directory on success.
    pub fn resolve_paths(&self) -> Result<&Path> {
        let dir = self.working_dir.as_path();
        if !dir.is_absolute() {
            return Err(DevrackError::resolution(format!(
                "{}: working directory {} is not absolute",
                self.name,
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(DevrackError::resolution(format!(
                "{}: working directory {} does not exist",
                self.name,
                dir.display()
            )));
        }
        if self.kind.requires_entry_point() {
            if let Some(entry) = non_blank(self.entry_point.as_deref()) {
                let path = dir.join(entry);
                if !path.is_file() {
                    return Err(DevrackError::resolution(format!(
                        "{}: entry point {} does not exist",
                        self.name,
                        path.display()
                    )));
                }
            }
        }
        Ok(dir)
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
