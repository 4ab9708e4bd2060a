//! The reconciler.
//!
//! Every operation observes the app's state fresh (session existence plus port
//! ownership), acts, and returns an `AppReport`. Nothing is cached between calls and no
//! lock is taken: operations are expected to be issued one at a time by a single driver.
//!
//! Validation and command construction always happen before the first side effect, so a
//! descriptor that fails them leaves the system untouched.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::collab::{DependencySync, GitSource, ShellDependencySync, SourceControl};
use crate::command::{resolve_package_manager_context, BuiltCommand, CommandBuilder};
use crate::config::Settings;
use crate::descriptor::AppDescriptor;
use crate::error::{DevrackError, Result};
use crate::ports::{wait_for_port_free, PortProbe, Termination};
use crate::report::{AppReport, AppStatus, Outcome};

/// What to do when an app's session or port is already taken at start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Report `SessionExists` / `PortConflict` and leave everything as is.
    #[default]
    Refuse,
    /// Kill the existing session and the port's owners, then start.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Restart,
    Update,
}

impl Operation {
    fn launches(self) -> bool {
        !matches!(self, Operation::Stop)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub port_wait_timeout: Duration,
    pub port_poll_interval: Duration,
    /// Pause between session creations in batch operations.
    pub launch_delay: Duration,
    pub restart_in_place: bool,
    pub conflict_policy: ConflictPolicy,
    /// Build and report commands without touching sessions or processes.
    pub dry_run: bool,
    pub django_search_depth: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for OrchestratorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            port_wait_timeout: settings.port_wait_timeout,
            port_poll_interval: settings.port_poll_interval,
            launch_delay: settings.launch_delay,
            restart_in_place: settings.restart_in_place,
            conflict_policy: ConflictPolicy::Refuse,
            dry_run: false,
            django_search_depth: settings.django_search_depth,
        }
    }
}

pub struct Orchestrator {
    backend: Box<dyn SessionBackend>,
    ports: Box<dyn PortProbe>,
    source: Box<dyn SourceControl>,
    deps: Box<dyn DependencySync>,
    builder: CommandBuilder,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        backend: Box<dyn SessionBackend>,
        ports: Box<dyn PortProbe>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            backend,
            ports,
            source: Box::new(GitSource),
            deps: Box::new(ShellDependencySync),
            builder: CommandBuilder::new(options.django_search_depth),
            options,
        }
    }

    pub fn with_source_control(mut self, source: Box<dyn SourceControl>) -> Self {
        self.source = source;
        self
    }

    pub fn with_dependency_sync(mut self, deps: Box<dyn DependencySync>) -> Self {
        self.deps = deps;
        self
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn backend(&self) -> &dyn SessionBackend {
        self.backend.as_ref()
    }

    /// Validates the descriptor and builds its launch command. No side effects.
    pub fn command_for(&self, app: &AppDescriptor) -> Result<BuiltCommand> {
        app.validate()?;
        let dir = app.resolve_paths()?;
        let ctx = resolve_package_manager_context(app, dir);
        self.builder.build(app, dir, &ctx)
    }

    /// Read-only liveness query.
    pub async fn status(&self, app: &AppDescriptor) -> AppStatus {
        let session = self.backend.session_exists(&app.name).await;
        let pids = match app.port {
            Some(port) => self.owners(port).await,
            None => Vec::new(),
        };
        match (session, pids.is_empty()) {
            (true, _) => AppStatus::Running,
            (false, false) => AppStatus::Conflicted { pids },
            (false, true) => AppStatus::Stopped,
        }
    }

    pub async fn start_app(&self, app: &AppDescriptor) -> AppReport {
        self.run(Operation::Start, app, self.options.conflict_policy).await
    }

    pub async fn stop_app(&self, app: &AppDescriptor) -> AppReport {
        self.run(Operation::Stop, app, self.options.conflict_policy).await
    }

    pub async fn restart_app(&self, app: &AppDescriptor) -> AppReport {
        self.run(Operation::Restart, app, self.options.conflict_policy).await
    }

    pub async fn update_app(&self, app: &AppDescriptor) -> AppReport {
        self.run(Operation::Update, app, self.options.conflict_policy).await
    }

    /// Runs one operation on one app with an explicit conflict policy.
    pub async fn run(&self, op: Operation, app: &AppDescriptor, policy: ConflictPolicy) -> AppReport {
        info!(app = %app.name, ?op, ?policy, dry_run = self.options.dry_run, "running");
        let report = match op {
            Operation::Start => self.start(app, policy).await,
            Operation::Stop => self.stop(app).await,
            Operation::Restart => self.restart(app, policy).await,
            Operation::Update => self.update(app, policy).await,
        };
        match &report.outcome {
            Outcome::Failed(err) => warn!(app = %app.name, error = %err, "operation failed"),
            outcome => info!(app = %app.name, %outcome, "done"),
        }
        report
    }

    /// Runs `op` over `apps` in order, pausing `launch_delay` between launches.
    pub async fn run_all(
        &self,
        op: Operation,
        apps: &[AppDescriptor],
        policy: ConflictPolicy,
    ) -> Vec<AppReport> {
        let mut reports = Vec::with_capacity(apps.len());
        for (idx, app) in apps.iter().enumerate() {
            let pause = idx > 0
                && op.launches()
                && !self.options.dry_run
                && !self.options.launch_delay.is_zero();
            if pause {
                tokio::time::sleep(self.options.launch_delay).await;
            }
            reports.push(self.run(op, app, policy).await);
        }
        reports
    }

    pub async fn start_all(&self, apps: &[AppDescriptor]) -> Vec<AppReport> {
        self.run_all(Operation::Start, apps, self.options.conflict_policy).await
    }

    pub async fn stop_all(&self, apps: &[AppDescriptor]) -> Vec<AppReport> {
        self.run_all(Operation::Stop, apps, self.options.conflict_policy).await
    }

    pub async fn restart_all(&self, apps: &[AppDescriptor]) -> Vec<AppReport> {
        self.run_all(Operation::Restart, apps, self.options.conflict_policy).await
    }

    pub async fn update_all(&self, apps: &[AppDescriptor]) -> Vec<AppReport> {
        self.run_all(Operation::Update, apps, self.options.conflict_policy).await
    }

    /// Status of every app, in order.
    pub async fn statuses(&self, apps: &[AppDescriptor]) -> Vec<(String, AppStatus)> {
        let mut out = Vec::with_capacity(apps.len());
        for app in apps {
            out.push((app.name.clone(), self.status(app).await));
        }
        out
    }

    async fn start(&self, app: &AppDescriptor, policy: ConflictPolicy) -> AppReport {
        let built = match self.command_for(app) {
            Ok(built) => built,
            Err(err) => return AppReport::failed(&app.name, err),
        };
        if self.options.dry_run {
            return AppReport::new(&app.name, Outcome::Skipped("dry run".to_string()))
                .with_command(built.line);
        }
        let mut warnings = Vec::new();
        let report = match self.launch(app, &built, policy, &mut warnings).await {
            Ok(()) => AppReport::new(&app.name, Outcome::Started),
            Err(err) => AppReport::failed(&app.name, err),
        };
        report
            .with_command(built.line)
            .with_warnings(warnings)
    }

    // Clears conflicts according to `policy`, then creates the session.
    async fn launch(
        &self,
        app: &AppDescriptor,
        built: &BuiltCommand,
        policy: ConflictPolicy,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        if self.backend.session_exists(&app.name).await {
            if policy == ConflictPolicy::Refuse {
                return Err(DevrackError::SessionExists(app.name.clone()));
            }
            info!(app = %app.name, "killing existing session");
            self.backend.kill_session(&app.name).await?;
        }

        if let Some(port) = app.port {
            let pids = self.owners(port).await;
            if !pids.is_empty() {
                if policy == ConflictPolicy::Refuse {
                    return Err(DevrackError::PortConflict { port, pids });
                }
                info!(app = %app.name, port, ?pids, "terminating port owners");
                self.terminate_all(&pids, Termination::Graceful, warnings).await;
                self.settle_port(Some(port), warnings).await;
            }
        }

        let dir = app.working_dir.as_path();
        self.backend
            .create_session(&app.name, dir, &built.line)
            .await?;
        info!(app = %app.name, backend = self.backend.name(), "session created");
        Ok(())
    }

    async fn stop(&self, app: &AppDescriptor) -> AppReport {
        if let Err(err) = app.validate() {
            return AppReport::failed(&app.name, err);
        }
        if self.options.dry_run {
            return AppReport::new(&app.name, Outcome::Skipped("dry run".to_string()));
        }
        let mut warnings = Vec::new();
        let report = match self.stop_inner(app, true, &mut warnings).await {
            Ok(true) => AppReport::new(&app.name, Outcome::Stopped),
            Ok(false) => AppReport::new(&app.name, Outcome::Skipped("not running".to_string())),
            Err(err) => AppReport::failed(&app.name, err),
        };
        report.with_warnings(warnings)
    }

    /// Terminates the port's owners and, if `kill_session`, the session. Returns whether
    /// anything was found to stop.
    async fn stop_inner(
        &self,
        app: &AppDescriptor,
        kill_session: bool,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        let mut acted = false;
        if let Some(port) = app.port {
            let pids = self.owners(port).await;
            if pids.is_empty() {
                debug!(app = %app.name, port, "port not listening");
            } else {
                info!(app = %app.name, port, ?pids, "terminating port owners");
                self.terminate_all(&pids, Termination::Graceful, warnings).await;
                acted = true;
            }
        }
        if kill_session && self.backend.session_exists(&app.name).await {
            self.backend.kill_session(&app.name).await?;
            info!(app = %app.name, "session killed");
            acted = true;
        }
        Ok(acted)
    }

    async fn restart(&self, app: &AppDescriptor, policy: ConflictPolicy) -> AppReport {
        let built = match self.command_for(app) {
            Ok(built) => built,
            Err(err) => return AppReport::failed(&app.name, err),
        };
        if self.options.dry_run {
            return AppReport::new(&app.name, Outcome::Skipped("dry run".to_string()))
                .with_command(built.line);
        }

        let mut warnings = Vec::new();
        let in_place = self.options.restart_in_place
            && self.backend.supports_restart_in_place()
            && self.backend.session_exists(&app.name).await;
        if in_place {
            match self.restart_in_place(app, &mut warnings).await {
                Ok(()) => {
                    return AppReport::new(&app.name, Outcome::Restarted)
                        .with_command(built.line)
                        .with_warnings(warnings);
                }
                Err(err) => {
                    warn!(app = %app.name, error = %err, "restart in place failed; doing a full cycle");
                    warnings.push(format!("restart in place failed: {err}"));
                }
            }
        }

        let report = match self.full_cycle(app, &built, policy, &mut warnings).await {
            Ok(()) => AppReport::new(&app.name, Outcome::Restarted),
            Err(err) => AppReport::failed(&app.name, err),
        };
        report
            .with_command(built.line)
            .with_warnings(warnings)
    }

    // Stops the app's process but keeps its session, which then reruns the command.
    async fn restart_in_place(&self, app: &AppDescriptor, warnings: &mut Vec<String>) -> Result<()> {
        if app.port.is_some() {
            self.stop_inner(app, false, warnings).await?;
        } else if let Err(err) = self.backend.send_interrupt(&app.name).await {
            warn!(app = %app.name, error = %err, "interrupt failed");
            warnings.push(format!("interrupt failed: {err}"));
        }
        self.settle_port(app.port, warnings).await;
        self.backend.send_continue(&app.name).await
    }

    async fn full_cycle(
        &self,
        app: &AppDescriptor,
        built: &BuiltCommand,
        policy: ConflictPolicy,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        self.stop_inner(app, true, warnings).await?;
        self.settle_port(app.port, warnings).await;
        self.launch(app, built, policy, warnings).await
    }

    async fn update(&self, app: &AppDescriptor, policy: ConflictPolicy) -> AppReport {
        let built = match self.command_for(app) {
            Ok(built) => built,
            Err(err) => return AppReport::failed(&app.name, err),
        };
        if self.options.dry_run {
            return AppReport::new(&app.name, Outcome::Skipped("dry run".to_string()))
                .with_command(built.line);
        }
        let dir = app.working_dir.as_path();
        let mut warnings = Vec::new();

        if let Err(err) = self.stop_inner(app, true, &mut warnings).await {
            warn!(app = %app.name, error = %err, "stop before update failed");
            warnings.push(format!("stop failed: {err}"));
        }
        self.settle_port(app.port, &mut warnings).await;

        info!(app = %app.name, "pulling latest source");
        if let Err(err) = self.source.pull(dir).await {
            warn!(app = %app.name, error = %err, "pull failed");
            warnings.push(err.to_string());
        }

        let ctx = resolve_package_manager_context(app, dir);
        info!(app = %app.name, manager = %ctx.manager, "syncing dependencies");
        if let Err(err) = self.deps.sync(&ctx, dir).await {
            warn!(app = %app.name, error = %err, "dependency sync failed");
            warnings.push(err.to_string());
        }
        self.settle_port(app.port, &mut warnings).await;

        // The sync may have created the venv or pulled a new manage.py location.
        let built = match self.command_for(app) {
            Ok(rebuilt) => rebuilt,
            Err(err) => {
                warnings.push(format!("rebuilding command failed: {err}"));
                built
            }
        };
        let report = match self.launch(app, &built, policy, &mut warnings).await {
            Ok(()) => AppReport::new(&app.name, Outcome::Updated),
            Err(err) => AppReport::failed(&app.name, err),
        };
        report
            .with_command(built.line)
            .with_warnings(warnings)
    }

    /// Waits for the port to be released; if it is still held at the deadline, SIGKILLs
    /// the remaining owners and waits once more. Never fails: a port that stays busy is
    /// recorded as a timeout warning and left for the next bind to trip over.
    async fn settle_port(&self, port: Option<u16>, warnings: &mut Vec<String>) {
        let Some(port) = port else {
            return;
        };
        let timeout = self.options.port_wait_timeout;
        let interval = self.options.port_poll_interval;
        if wait_for_port_free(self.ports.as_ref(), port, timeout, interval).await {
            return;
        }
        let pids = self.owners(port).await;
        if !pids.is_empty() {
            warn!(port, ?pids, "port still busy; killing owners");
            self.terminate_all(&pids, Termination::Forced, warnings).await;
        }
        if !wait_for_port_free(self.ports.as_ref(), port, timeout, interval).await {
            let err = DevrackError::Timeout {
                port,
                waited_ms: (timeout * 2).as_millis(),
            };
            warn!(error = %err, "giving up on port");
            warnings.push(err.to_string());
        }
    }

    async fn owners(&self, port: u16) -> Vec<u32> {
        match self.ports.owning_pids(port).await {
            Ok(pids) => pids,
            Err(err) => {
                warn!(port, error = %err, "port lookup failed");
                Vec::new()
            }
        }
    }

    async fn terminate_all(&self, pids: &[u32], how: Termination, warnings: &mut Vec<String>) {
        for &pid in pids {
            if let Err(err) = self.ports.terminate(pid, how).await {
                warn!(pid, error = %err, "failed to terminate");
                warnings.push(format!("failed to terminate pid {pid}: {err}"));
            }
        }
    }
}
