//! Port ownership lookups.
//!
//! Ownership is always recomputed from the OS; nothing here caches because the answer
//! reflects processes this crate does not control.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DevrackError, Result};

/// How hard to ask a process to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM.
    Graceful,
    /// SIGKILL.
    Forced,
}

/// Resolves and terminates the processes listening on a TCP port.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Pids bound as listeners on `port`, sorted and deduplicated. Empty if none.
    async fn owning_pids(&self, port: u16) -> Result<Vec<u32>>;

    /// Signals a single pid. A pid that no longer exists is not an error.
    async fn terminate(&self, pid: u32, how: Termination) -> Result<()>;
}

/// `PortProbe` backed by `lsof`.
#[derive(Debug, Clone)]
pub struct LsofProbe {
    program: PathBuf,
}

impl Default for LsofProbe {
    fn default() -> Self {
        Self::with_program("lsof")
    }
}

impl LsofProbe {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl PortProbe for LsofProbe {
    async fn owning_pids(&self, port: u16) -> Result<Vec<u32>> {
        let output = Command::new(&self.program)
            .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
            .output()
            .await?;
        read_lsof_output(output.status.code(), &output.stdout, &output.stderr)
    }

    async fn terminate(&self, pid: u32, how: Termination) -> Result<()> {
        debug!(pid, ?how, "terminating port owner");
        signal_pid(pid, how)
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, how: Termination) -> Result<()> {
    let sig = match how {
        Termination::Graceful => libc::SIGTERM,
        Termination::Forced => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as i32, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _how: Termination) -> Result<()> {
    Err(DevrackError::unsupported("lsof", "terminate"))
}

// lsof exits 1 when nothing matches, and may still print warnings (unreadable mounts
// and the like) on stderr. Only other exit codes are failures.
fn read_lsof_output(code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Result<Vec<u32>> {
    match code {
        Some(0) | Some(1) => {
            if !stderr.is_empty() {
                debug!(stderr = %String::from_utf8_lossy(stderr).trim(), "lsof warnings");
            }
            Ok(parse_pid_list(&String::from_utf8_lossy(stdout)))
        }
        _ => Err(DevrackError::Io(std::io::Error::other(format!(
            "lsof failed ({}): {}",
            code.map(|code| format!("exit {code}"))
                .unwrap_or_else(|| "killed by signal".to_string()),
            String::from_utf8_lossy(stderr).trim()
        )))),
    }
}

pub fn parse_pid_list(raw: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = raw
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Polls `owning_pids` until the port is free or `timeout` elapses.
///
/// Returns `true` as soon as no listener is found. On `false` at least `timeout` has
/// passed, and at most one poll interval more. Lookup errors count as "still busy".
pub async fn wait_for_port_free(
    ports: &dyn PortProbe,
    port: u16,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match ports.owning_pids(port).await {
            Ok(pids) if pids.is_empty() => return true,
            Ok(pids) => debug!(port, ?pids, "port still in use"),
            Err(err) => warn!(port, error = %err, "port lookup failed"),
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePorts;

    #[test]
    fn parses_lsof_terse_output() {
        assert_eq!(parse_pid_list("4312\n77\n4312\n\n"), vec![77, 4312]);
        assert!(parse_pid_list("").is_empty());
        assert_eq!(parse_pid_list("p12\n 13 \n"), vec![13]);
    }

    #[test]
    fn lsof_warnings_on_a_free_port_are_not_errors() {
        let stderr = b"lsof: WARNING: can't stat() overlay file system /\n";
        assert!(read_lsof_output(Some(1), b"", stderr).unwrap().is_empty());
        assert_eq!(read_lsof_output(Some(0), b"42\n", stderr).unwrap(), vec![42]);
        assert!(read_lsof_output(Some(2), b"", b"bad option").is_err());
        assert!(read_lsof_output(None, b"", b"").is_err());
    }

    #[cfg(unix)]
    fn stub_lsof(dir: &std::path::Path, body: &str) -> LsofProbe {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("lsof");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        LsofProbe::with_program(path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn free_port_with_lsof_warnings_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let lsof = stub_lsof(
            dir.path(),
            "echo \"lsof: WARNING: can't stat() overlay file system /\" >&2; exit 1",
        );
        assert!(lsof.owning_pids(8501).await.unwrap().is_empty());

        let start = std::time::Instant::now();
        let free = wait_for_port_free(
            &lsof,
            8501,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .await;
        assert!(free);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stub_lsof_listing_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let lsof = stub_lsof(dir.path(), "echo 77; echo 12; echo 77");
        assert_eq!(lsof.owning_pids(8501).await.unwrap(), vec![12, 77]);

        let dir = tempfile::tempdir().unwrap();
        let lsof = stub_lsof(dir.path(), "echo 'lsof: unsupported option' >&2; exit 2");
        assert!(lsof.owning_pids(8501).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn returns_true_once_port_is_released() {
        let ports = FakePorts::default();
        ports.listen(8501, 1234);
        ports.release_after_polls(8501, 3);

        let start = Instant::now();
        let free = wait_for_port_free(
            &ports,
            8501,
            Duration::from_secs(5),
            Duration::from_millis(200),
        )
        .await;
        assert!(free);
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_one_interval() {
        let ports = FakePorts::default();
        ports.listen(8501, 1234);

        let timeout = Duration::from_millis(1000);
        let interval = Duration::from_millis(300);
        let start = Instant::now();
        let free = wait_for_port_free(&ports, 8501, timeout, interval).await;
        let elapsed = start.elapsed();
        assert!(!free);
        assert!(elapsed >= timeout);
        assert!(elapsed <= timeout + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn free_port_returns_immediately() {
        let ports = FakePorts::default();
        let start = Instant::now();
        assert!(
            wait_for_port_free(&ports, 9000, Duration::from_secs(1), Duration::from_millis(50))
                .await
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
