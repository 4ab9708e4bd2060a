//! Config Store: the list of app descriptors backed by a JSON file.
//!
//! Loading normalizes the list (entries with unsupported types are dropped, names are
//! deduplicated case-insensitively keeping the first occurrence). Mutations only touch
//! the in-memory list; nothing is written until `save` is called.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use crate::descriptor::{AppDescriptor, AppKind};
use crate::error::DevrackError;

/// Default descriptor file name looked up in the current directory.
pub const DEFAULT_APPS_FILE: &str = "apps.json";

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    apps: Vec<AppDescriptor>,
}

impl ConfigStore {
    /// Creates an in-memory store. `save_to` is required to persist it.
    pub fn new(apps: Vec<AppDescriptor>) -> Self {
        Self {
            path: None,
            apps: normalize(apps),
        }
    }

    /// Loads and normalizes the descriptor file. A missing file yields an empty store
    /// bound to `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: Some(path.to_path_buf()),
                apps: Vec::new(),
            });
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read apps file {}", path.display()))?;
        let apps = parse_descriptors(&raw)
            .with_context(|| format!("failed to parse apps file {}", path.display()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            apps: normalize(apps),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn apps(&self) -> &[AppDescriptor] {
        &self.apps
    }

    pub fn names(&self) -> Vec<&str> {
        self.apps.iter().map(|app| app.name.as_str()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&AppDescriptor> {
        self.apps.iter().find(|app| app.matches_name(name))
    }

    /// Resolves every requested name, failing on the first one that is not configured.
    pub fn select(&self, names: &[String]) -> Result<Vec<AppDescriptor>, DevrackError> {
        names
            .iter()
            .map(|name| {
                self.find(name)
                    .cloned()
                    .ok_or_else(|| DevrackError::config(format!("no app named '{name}'")))
            })
            .collect()
    }

    pub fn add(&mut self, app: AppDescriptor) -> Result<(), DevrackError> {
        app.validate()?;
        if self.find(&app.name).is_some() {
            return Err(DevrackError::config(format!(
                "duplicate app name: {}",
                app.name
            )));
        }
        self.apps.push(app);
        Ok(())
    }

    /// Replaces the descriptor stored under `name`. Renames are allowed as long as the new
    /// name does not collide with another entry.
    pub fn update(&mut self, name: &str, app: AppDescriptor) -> Result<(), DevrackError> {
        app.validate()?;
        let idx = self
            .apps
            .iter()
            .position(|existing| existing.matches_name(name))
            .ok_or_else(|| DevrackError::config(format!("no app named '{name}'")))?;
        let collides = self
            .apps
            .iter()
            .enumerate()
            .any(|(other, existing)| other != idx && existing.matches_name(&app.name));
        if collides {
            return Err(DevrackError::config(format!(
                "duplicate app name: {}",
                app.name
            )));
        }
        self.apps[idx] = app;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<AppDescriptor> {
        let idx = self.apps.iter().position(|app| app.matches_name(name))?;
        Some(self.apps.remove(idx))
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .context("store has no backing file; use save_to")?;
        self.save_to(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let serialized =
            serde_json::to_string_pretty(&self.apps).context("failed to serialize apps")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, serialized + "\n")
            .with_context(|| format!("failed to write apps file {}", path.display()))?;
        Ok(())
    }
}

// Entries are decoded one by one: an entry whose `Type` is not supported is skipped,
// any other malformed entry rejects the whole file so that a later save cannot drop it.
fn parse_descriptors(raw: &str) -> Result<Vec<AppDescriptor>> {
    let values: Vec<Value> = serde_json::from_str(raw)?;
    let mut apps = Vec::with_capacity(values.len());
    for (idx, value) in values.into_iter().enumerate() {
        let label = value
            .get("Name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{idx}"));
        let unsupported_kind = value
            .get("Type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.parse::<AppKind>().is_err());
        match serde_json::from_value::<AppDescriptor>(value) {
            Ok(app) => apps.push(app),
            Err(err) if unsupported_kind => {
                warn!(app = %label, error = %err, "skipping app with unsupported type")
            }
            Err(err) => return Err(DevrackError::config(format!("{label}: {err}")).into()),
        }
    }
    Ok(apps)
}

/// Deduplicates by case-insensitive name, keeping the first occurrence and the input order.
pub fn normalize(apps: Vec<AppDescriptor>) -> Vec<AppDescriptor> {
    let mut seen = HashSet::new();
    apps.into_iter()
        .filter(|app| {
            let fresh = seen.insert(app.name.to_lowercase());
            if !fresh {
                warn!(app = %app.name, "dropping duplicate app name");
            }
            fresh
        })
        .collect()
}
