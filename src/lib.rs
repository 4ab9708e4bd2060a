//! devrack: keeps a set of local Python web apps running in named sessions.
//!
//! The library is organised around the [`Orchestrator`], which starts, stops, restarts
//! and updates apps described by [`AppDescriptor`]s. Commands come from the
//! [`command`] builder, sessions live in a [`backend`], and port ownership is resolved
//! through [`ports`].

pub mod backend;
pub mod collab;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod report;
pub mod store;

#[cfg(test)]
mod testing;

pub use descriptor::{AppDescriptor, AppKind, PackageManager};
pub use error::{DevrackError, Result};
pub use orchestrator::{ConflictPolicy, Operation, Orchestrator, OrchestratorOptions};
pub use report::{AppReport, AppStatus, Outcome};
pub use store::ConfigStore;
