//! In-memory stand-ins for the OS-facing traits, shared by unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::SessionBackend;
use crate::collab::{DependencySync, SourceControl};
use crate::command::PackageManagerContext;
use crate::error::{DevrackError, Result};
use crate::ports::{PortProbe, Termination};

/// Ordered record of side effects across all fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

#[derive(Debug, Default)]
struct PortsState {
    owners: HashMap<u16, Vec<u32>>,
    release_after: HashMap<u16, usize>,
    ignores_sigterm: bool,
    ignores_sigkill: bool,
    polls: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakePorts {
    state: Arc<Mutex<PortsState>>,
    journal: Journal,
}

impl FakePorts {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn listen(&self, port: u16, pid: u32) {
        let mut state = self.state.lock().unwrap();
        let owners = state.owners.entry(port).or_default();
        if !owners.contains(&pid) {
            owners.push(pid);
        }
    }

    pub fn release(&self, port: u16) {
        self.state.lock().unwrap().owners.remove(&port);
    }

    /// The port reports busy for `polls` more lookups, then frees itself.
    pub fn release_after_polls(&self, port: u16, polls: usize) {
        self.state.lock().unwrap().release_after.insert(port, polls);
    }

    pub fn ignore_sigterm(&self) {
        self.state.lock().unwrap().ignores_sigterm = true;
    }

    /// Owners survive every termination, so the port never frees up.
    pub fn pin(&self) {
        let mut state = self.state.lock().unwrap();
        state.ignores_sigterm = true;
        state.ignores_sigkill = true;
    }

    pub fn polls(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.state
            .lock()
            .unwrap()
            .owners
            .get(&port)
            .is_some_and(|owners| !owners.is_empty())
    }
}

#[async_trait]
impl PortProbe for FakePorts {
    async fn owning_pids(&self, port: u16) -> Result<Vec<u32>> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        let countdown = state.release_after.get(&port).copied();
        match countdown {
            Some(0) => {
                state.owners.remove(&port);
                state.release_after.remove(&port);
            }
            Some(left) => {
                state.release_after.insert(port, left - 1);
            }
            None => {}
        }
        let mut pids = state.owners.get(&port).cloned().unwrap_or_default();
        pids.sort_unstable();
        Ok(pids)
    }

    async fn terminate(&self, pid: u32, how: Termination) -> Result<()> {
        let label = match how {
            Termination::Graceful => "graceful",
            Termination::Forced => "forced",
        };
        self.journal.record(format!("terminate:{pid}:{label}"));
        let mut state = self.state.lock().unwrap();
        let ignored = match how {
            Termination::Graceful => state.ignores_sigterm,
            Termination::Forced => state.ignores_sigkill,
        };
        if ignored {
            return Ok(());
        }
        for owners in state.owners.values_mut() {
            owners.retain(|owner| *owner != pid);
        }
        state.owners.retain(|_, owners| !owners.is_empty());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackendState {
    sessions: Vec<(String, String)>,
    binds: HashMap<String, (u16, u32)>,
}

/// Session backend that keeps sessions in memory. Sessions registered with
/// `bind_on_create` start listening on their port when created, and release it
/// when killed.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
    journal: Journal,
    ports: FakePorts,
    in_place: bool,
    continue_fails: bool,
}

impl FakeBackend {
    pub fn new(journal: Journal, ports: FakePorts) -> Self {
        Self {
            state: Arc::default(),
            journal,
            ports,
            in_place: true,
            continue_fails: false,
        }
    }

    pub fn without_restart_in_place(mut self) -> Self {
        self.in_place = false;
        self
    }

    pub fn failing_continue(mut self) -> Self {
        self.continue_fails = true;
        self
    }

    pub fn bind_on_create(&self, name: &str, port: u16, pid: u32) {
        self.state
            .lock()
            .unwrap()
            .binds
            .insert(name.to_lowercase(), (port, pid));
    }

    /// Registers a session without going through `create_session`.
    pub fn seed(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .push((name.to_string(), "seeded".to_string()));
    }

    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|(session, _)| session.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn command_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|(session, _)| session.eq_ignore_ascii_case(name))
            .map(|(_, command)| command.clone())
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn supports_restart_in_place(&self) -> bool {
        self.in_place
    }

    async fn create_session(&self, name: &str, _working_dir: &Path, command: &str) -> Result<()> {
        if self.count(name) > 0 {
            return Err(DevrackError::SessionExists(name.to_string()));
        }
        self.journal.record(format!("create:{name}"));
        let bind = {
            let mut state = self.state.lock().unwrap();
            state.sessions.push((name.to_string(), command.to_string()));
            state.binds.get(&name.to_lowercase()).copied()
        };
        if let Some((port, pid)) = bind {
            self.ports.listen(port, pid);
        }
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    async fn send_interrupt(&self, name: &str) -> Result<()> {
        self.journal.record(format!("interrupt:{name}"));
        Ok(())
    }

    async fn send_continue(&self, name: &str) -> Result<()> {
        self.journal.record(format!("continue:{name}"));
        if self.continue_fails {
            return Err(DevrackError::backend("tab lost focus"));
        }
        let bind = self.state.lock().unwrap().binds.get(&name.to_lowercase()).copied();
        if let Some((port, pid)) = bind {
            self.ports.listen(port, pid);
        }
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.journal.record(format!("kill:{name}"));
        let bind = {
            let mut state = self.state.lock().unwrap();
            state
                .sessions
                .retain(|(session, _)| !session.eq_ignore_ascii_case(name));
            state.binds.get(&name.to_lowercase()).copied()
        };
        if let Some((port, _)) = bind {
            self.ports.release(port);
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    pub journal: Journal,
    pub fail: bool,
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn pull(&self, _working_dir: &Path) -> Result<()> {
        self.journal.record("pull");
        if self.fail {
            return Err(DevrackError::update("git exited with 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSync {
    pub journal: Journal,
    pub fail: bool,
}

#[async_trait]
impl DependencySync for FakeSync {
    async fn sync(&self, ctx: &PackageManagerContext, _working_dir: &Path) -> Result<()> {
        self.journal.record(format!("sync:{}", ctx.manager));
        if self.fail {
            return Err(DevrackError::update("pip exited with 1"));
        }
        Ok(())
    }
}
