//! What the orchestrator observed and did, per app.

use std::fmt;

use crate::error::DevrackError;

/// Observed liveness of an app. Derived on every query, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppStatus {
    /// No session and nothing listening on the port.
    Stopped,
    /// The app's session exists (its port may or may not be listening yet).
    Running,
    /// The port is listening but the app has no session, e.g. a leftover process.
    Conflicted { pids: Vec<u32> },
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Stopped => f.write_str("stopped"),
            AppStatus::Running => f.write_str("running"),
            AppStatus::Conflicted { pids } => {
                let pids: Vec<String> = pids.iter().map(|pid| pid.to_string()).collect();
                write!(f, "conflicted (pid {})", pids.join(", "))
            }
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Started,
    Stopped,
    Restarted,
    Updated,
    Skipped(String),
    Failed(DevrackError),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Started => f.write_str("started"),
            Outcome::Stopped => f.write_str("stopped"),
            Outcome::Restarted => f.write_str("restarted"),
            Outcome::Updated => f.write_str("updated"),
            Outcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            Outcome::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Result of one operation on one app.
#[derive(Debug)]
pub struct AppReport {
    pub name: String,
    pub outcome: Outcome,
    /// The command that was (or, in dry-run mode, would have been) launched.
    pub command: Option<String>,
    /// Non-fatal problems hit along the way.
    pub warnings: Vec<String>,
}

impl AppReport {
    pub fn new(name: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            command: None,
            warnings: Vec::new(),
        }
    }

    pub fn failed(name: impl Into<String>, err: DevrackError) -> Self {
        Self::new(name, Outcome::Failed(err))
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn is_conflict(&self) -> bool {
        matches!(&self.outcome, Outcome::Failed(err) if err.is_conflict())
    }
}

impl fmt::Display for AppReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.outcome)?;
        for warning in &self.warnings {
            write!(f, "\n  warning: {warning}")?;
        }
        Ok(())
    }
}
