//! Detached backend: every app is a plain background process.
//!
//! The process is spawned in its own process group and recorded in a pid file under the
//! state directory, together with a log file that collects stdout and stderr. The pid
//! file keeps the session addressable across invocations. There is no window to type
//! into, so `send_continue` is unsupported and the session ends with the command.
//!
//! Pid files outlive reboots and pids get reused, so a record only names a live session
//! while its pid still leads its own process group and still has the start time noted at
//! spawn. Anything else is a stale record and is deleted without signalling.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::SessionBackend;
use crate::error::{DevrackError, Result};

const PID_EXT: &str = "pid";
const LOG_EXT: &str = "log";
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DetachedBackend {
    state_dir: PathBuf,
}

/// Contents of a pid file: pid, session name and process start time, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PidRecord {
    pid: u32,
    name: String,
    /// Empty when the platform does not expose start times, `None` when the file has
    /// no third line.
    started: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl DetachedBackend {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.{LOG_EXT}", file_stem(name)))
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.{PID_EXT}", file_stem(name)))
    }

    /// Returns the live record for `name`, removing the pid file if it no longer
    /// describes a process this backend spawned.
    async fn live_record(&self, name: &str) -> Option<PidRecord> {
        let path = self.pid_path(name);
        if !path.exists() {
            return None;
        }
        let record = read_record(&path);
        let owned = match &record {
            Some(record) => owns_process(record).await,
            None => false,
        };
        if owned {
            return record;
        }
        debug!(name, pid = ?record.map(|r| r.pid), "removing stale pid file");
        let _ = fs::remove_file(&path);
        None
    }
}

#[async_trait]
impl SessionBackend for DetachedBackend {
    fn name(&self) -> &'static str {
        "detached"
    }

    fn supports_restart_in_place(&self) -> bool {
        false
    }

    async fn create_session(&self, name: &str, working_dir: &Path, command: &str) -> Result<()> {
        if self.live_record(name).await.is_some() {
            return Err(DevrackError::SessionExists(name.to_string()));
        }
        fs::create_dir_all(&self.state_dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(name))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|err| DevrackError::backend(format!("failed to spawn {name}: {err}")))?;
        let pid = child
            .id()
            .ok_or_else(|| DevrackError::backend(format!("{name} exited before reporting a pid")))?;
        let started = process_start_time(pid).await.unwrap_or_default();
        fs::write(self.pid_path(name), format!("{pid}\n{name}\n{started}\n"))?;
        debug!(name, pid, "spawned detached session");
        // Dropping the handle leaves the process running; tokio reaps it if it exits first.
        drop(child);
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.live_record(name).await.is_some()
    }

    async fn send_interrupt(&self, name: &str) -> Result<()> {
        let record = self
            .live_record(name)
            .await
            .ok_or_else(|| DevrackError::backend(format!("no detached session '{name}'")))?;
        send_group_signal(record.pid, GroupSignal::Interrupt)
    }

    async fn send_continue(&self, _name: &str) -> Result<()> {
        Err(DevrackError::unsupported("detached", "send_continue"))
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let Some(record) = self.live_record(name).await else {
            return Ok(());
        };
        send_group_signal(record.pid, GroupSignal::Terminate)?;
        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while process_alive(record.pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if process_alive(record.pid) {
            warn!(name, pid = record.pid, "session ignored SIGTERM; killing");
            send_group_signal(record.pid, GroupSignal::Kill)?;
        }
        let _ = fs::remove_file(self.pid_path(name));
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PID_EXT) {
                continue;
            }
            if let Some(record) = read_record(&path) {
                if self.live_record(&record.name).await.is_some() {
                    names.push(record.name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

// Lowercased so that names differing only in case share one pid file.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn read_record(path: &Path) -> Option<PidRecord> {
    let raw = fs::read_to_string(path).ok()?;
    let mut lines = raw.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let name = lines.next().map(str::to_string).unwrap_or_default();
    let started = lines.next().map(|line| line.trim().to_string());
    Some(PidRecord { pid, name, started })
}

// Records without a start time predate it being recorded and are never trusted.
async fn owns_process(record: &PidRecord) -> bool {
    let Some(started) = &record.started else {
        return false;
    };
    if !process_alive(record.pid) || !is_group_leader(record.pid) {
        return false;
    }
    process_start_time(record.pid).await.unwrap_or_default() == *started
}

#[cfg(unix)]
fn is_group_leader(pid: u32) -> bool {
    unsafe { libc::getpgid(pid as i32) == pid as i32 }
}

#[cfg(not(unix))]
fn is_group_leader(_pid: u32) -> bool {
    false
}

/// Start time in clock ticks since boot, field 22 of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
async fn process_start_time(pid: u32) -> Option<String> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_start_time(&stat)
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn process_start_time(pid: u32) -> Option<String> {
    let output = Command::new("ps")
        .args(["-o", "lstart=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let started = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!started.is_empty()).then_some(started)
}

#[cfg(not(unix))]
async fn process_start_time(_pid: u32) -> Option<String> {
    None
}

// The command name in field 2 may contain spaces and parentheses, so count from the
// last closing parenthesis: the field after it is field 3.
#[cfg(target_os = "linux")]
fn parse_stat_start_time(stat: &str) -> Option<String> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19).map(str::to_string)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_group_signal(pid: u32, signal: GroupSignal) -> Result<()> {
    let sig = match signal {
        GroupSignal::Interrupt => libc::SIGINT,
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
    Ok(())
}

#[cfg(all(not(unix), windows))]
fn send_group_signal(pid: u32, signal: GroupSignal) -> Result<()> {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the only console signal a new process group receives.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
    Ok(())
}

#[cfg(all(not(unix), not(windows)))]
fn send_group_signal(_pid: u32, _signal: GroupSignal) -> Result<()> {
    Err(DevrackError::unsupported("detached", "signal"))
}
