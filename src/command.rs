//! Command construction for app descriptors.
//!
//! `CommandBuilder::build` turns a descriptor into a single shell command line. It only
//! inspects the filesystem (manifest, virtualenv and `manage.py` discovery) and never
//! executes anything, so identical inputs and filesystem state give identical output.
//!
//! Package manager handling lives in `resolve_package_manager_context`, which the
//! update path reuses to build its dependency sync command.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::descriptor::{non_blank, AppDescriptor, AppKind, PackageManager};
use crate::error::{DevrackError, Result};

/// Presence of this file in the working directory selects `uv`.
pub const UV_MANIFEST: &str = "pyproject.toml";
pub const DEFAULT_VENV_DIR: &str = ".venv";
pub const DJANGO_MANAGE_FILE: &str = "manage.py";
const ACTIVATE_SCRIPT: &str = "bin/activate";
const UV_RUN: &str = "uv run";
const DEPENDENCY_FILES: &[&str] = &[
    "requirements.txt",
    "requirements/base.txt",
    "requirements/dev.txt",
    "requirements-dev.txt",
];
const PROJECT_FILES: &[&str] = &["pyproject.toml", "setup.py"];
const SKIPPED_DIRS: &[&str] = &["node_modules", "site-packages", "venv", "env", "__pycache__"];

/// Package manager facts for one working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManagerContext {
    pub manager: PackageManager,
    /// True when the descriptor named the manager instead of it being inferred.
    pub explicit: bool,
    /// Virtualenv directory (pip only).
    pub venv_dir: Option<PathBuf>,
    /// `. <venv>/bin/activate && ` (pip only).
    pub activation_prefix: Option<String>,
    /// Creates the venv, activates it and installs dependencies. Only set for pip when
    /// the activation script is missing.
    pub bootstrap_prefix: Option<String>,
    /// Install step for pip, relative to the working directory.
    install_command: Option<String>,
}

impl PackageManagerContext {
    /// Shell text placed before the whole command: bootstrap when the venv is missing,
    /// plain activation otherwise. Empty for uv.
    pub fn shell_prefix(&self) -> &str {
        self.bootstrap_prefix
            .as_deref()
            .or(self.activation_prefix.as_deref())
            .unwrap_or("")
    }

    fn venv_ready(&self) -> bool {
        self.manager == PackageManager::Pip && self.bootstrap_prefix.is_none()
    }
}

/// Determines the package manager and virtualenv prefixes for an app.
pub fn resolve_package_manager_context(
    descriptor: &AppDescriptor,
    working_dir: &Path,
) -> PackageManagerContext {
    let (manager, explicit) = match descriptor.package_manager {
        Some(manager) => (manager, true),
        None if working_dir.join(UV_MANIFEST).is_file() => (PackageManager::Uv, false),
        None => (PackageManager::Pip, false),
    };

    if manager == PackageManager::Uv {
        return PackageManagerContext {
            manager,
            explicit,
            venv_dir: None,
            activation_prefix: None,
            bootstrap_prefix: None,
            install_command: None,
        };
    }

    let venv_dir = match &descriptor.venv_path {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => working_dir.join(path),
        None => working_dir.join(DEFAULT_VENV_DIR),
    };
    let script = venv_dir.join(ACTIVATE_SCRIPT);
    let activation = format!(". {} && ", quote_path(&script));
    let install_command = discover_install_command(working_dir);

    let bootstrap_prefix = if script.is_file() {
        None
    } else {
        let mut prefix = format!("python3 -m venv {} && {}", quote_path(&venv_dir), activation);
        if let Some(install) = &install_command {
            prefix.push_str(install);
            prefix.push_str(" && ");
        }
        Some(prefix)
    };

    PackageManagerContext {
        manager,
        explicit,
        venv_dir: Some(venv_dir),
        activation_prefix: Some(activation),
        bootstrap_prefix,
        install_command,
    }
}

fn discover_install_command(working_dir: &Path) -> Option<String> {
    if let Some(file) = DEPENDENCY_FILES
        .iter()
        .find(|file| working_dir.join(file).is_file())
    {
        return Some(format!("pip install -r {}", shell_words::quote(file)));
    }
    PROJECT_FILES
        .iter()
        .any(|file| working_dir.join(file).is_file())
        .then(|| "pip install -e .".to_string())
}

/// Shell command that brings dependencies up to date, or `None` when there is nothing
/// to install from.
pub fn dependency_sync_command(ctx: &PackageManagerContext) -> Option<String> {
    match ctx.manager {
        PackageManager::Uv => Some("uv sync".to_string()),
        PackageManager::Pip => {
            let install = ctx.install_command.as_deref()?;
            match &ctx.bootstrap_prefix {
                // Bootstrapping already installs; strip the trailing separator.
                Some(bootstrap) => Some(bootstrap.trim_end_matches(" && ").to_string()),
                None => Some(format!("{}{}", ctx.shell_prefix(), install)),
            }
        }
    }
}

/// A command line ready to hand to a session backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    /// Complete shell command, environment assignments included.
    pub line: String,
    /// Environment the command sets for itself (already part of `line`).
    pub env: Vec<(String, String)>,
    pub manager: PackageManager,
}

/// Builds launch commands from descriptors.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    django_search_depth: usize,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(3)
    }
}

impl CommandBuilder {
    pub fn new(django_search_depth: usize) -> Self {
        Self {
            django_search_depth: django_search_depth.max(1),
        }
    }

    pub fn build(
        &self,
        descriptor: &AppDescriptor,
        working_dir: &Path,
        ctx: &PackageManagerContext,
    ) -> Result<BuiltCommand> {
        let mut env = Vec::new();
        let program = match descriptor.kind {
            AppKind::Streamlit => {
                let entry = required_entry(descriptor)?;
                let mut parts = vec![
                    "streamlit".to_string(),
                    "run".to_string(),
                    quote(entry),
                ];
                push_port(&mut parts, "--port", descriptor.port);
                if let Some(base) = non_blank(descriptor.base_path.as_deref()) {
                    parts.push("--base-path".to_string());
                    parts.push(quote(base));
                }
                runner(ctx, parts)
            }
            AppKind::Django => {
                let manage = find_manage_file(working_dir, self.django_search_depth)?;
                let relative = manage.strip_prefix(working_dir).unwrap_or(&manage);
                let subcommand = non_blank(descriptor.custom_command.as_deref())
                    .unwrap_or("runserver")
                    .to_string();
                let mut parts = vec!["python".to_string(), quote_path(relative), subcommand];
                if let Some(port) = descriptor.port {
                    parts.push(format!("0.0.0.0:{port}"));
                }
                runner(ctx, parts)
            }
            AppKind::Flask => {
                let entry = required_entry(descriptor)?;
                env.push(("FLASK_APP".to_string(), entry.to_string()));
                env.push(("FLASK_DEBUG".to_string(), "1".to_string()));
                let mut parts = vec!["flask".to_string(), "run".to_string()];
                if descriptor.port.is_some() {
                    parts.push("--host".to_string());
                    parts.push("0.0.0.0".to_string());
                }
                push_port(&mut parts, "--port", descriptor.port);
                runner(ctx, parts)
            }
            AppKind::Dash => {
                let entry = required_entry(descriptor)?;
                let mut parts = vec!["python".to_string(), quote(entry)];
                push_port(&mut parts, "--port", descriptor.port);
                runner(ctx, parts)
            }
            AppKind::Custom => {
                let command = non_blank(descriptor.custom_command.as_deref()).ok_or_else(|| {
                    DevrackError::config(format!("{}: custom apps require a command", descriptor.name))
                })?;
                return Ok(BuiltCommand {
                    line: custom_line(command, ctx),
                    env,
                    manager: ctx.manager,
                });
            }
        };

        let assignments: String = env
            .iter()
            .map(|(key, value)| format!("{}={} ", key, quote(value)))
            .collect();
        Ok(BuiltCommand {
            line: format!("{}{}{}", ctx.shell_prefix(), assignments, program),
            env,
            manager: ctx.manager,
        })
    }
}

// Custom commands are emitted verbatim. A prefix is only added when the descriptor names
// its package manager, and never a bootstrap: the command owns its own setup.
fn custom_line(command: &str, ctx: &PackageManagerContext) -> String {
    if !ctx.explicit {
        return command.to_string();
    }
    match ctx.manager {
        PackageManager::Uv => format!("{UV_RUN} {command}"),
        PackageManager::Pip if ctx.venv_ready() => {
            format!("{}{}", ctx.shell_prefix(), command)
        }
        PackageManager::Pip => command.to_string(),
    }
}

fn runner(ctx: &PackageManagerContext, parts: Vec<String>) -> String {
    let program = parts.join(" ");
    match ctx.manager {
        PackageManager::Uv => format!("{UV_RUN} {program}"),
        PackageManager::Pip => program,
    }
}

fn push_port(parts: &mut Vec<String>, flag: &str, port: Option<u16>) {
    if let Some(port) = port {
        parts.push(flag.to_string());
        parts.push(port.to_string());
    }
}

fn required_entry(descriptor: &AppDescriptor) -> Result<&str> {
    non_blank(descriptor.entry_point.as_deref()).ok_or_else(|| {
        DevrackError::config(format!(
            "{}: {} apps require an entry point",
            descriptor.name, descriptor.kind
        ))
    })
}

/// Finds the shallowest `manage.py` below `root`, breaking ties by path.
pub fn find_manage_file(root: &Path, max_depth: usize) -> Result<PathBuf> {
    let walker = WalkBuilder::new(root)
        .max_depth(Some(max_depth))
        .standard_filters(false)
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut found: Option<(usize, PathBuf)> = None;
    for entry in walker.flatten() {
        if entry.file_name() != DJANGO_MANAGE_FILE {
            continue;
        }
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let candidate = (entry.depth(), entry.into_path());
        let better = match &found {
            Some(current) => candidate < *current,
            None => true,
        };
        if better {
            found = Some(candidate);
        }
    }

    found.map(|(_, path)| path).ok_or_else(|| {
        DevrackError::resolution(format!(
            "no {} found within {} levels of {}",
            DJANGO_MANAGE_FILE,
            max_depth,
            root.display()
        ))
    })
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_venv(root: &Path, dir: &str) {
        let bin = root.join(dir).join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("activate"), "").unwrap();
    }

    fn build(app: &AppDescriptor) -> Result<BuiltCommand> {
        let ctx = resolve_package_manager_context(app, &app.working_dir);
        CommandBuilder::default().build(app, &app.working_dir, &ctx)
    }

    #[test]
    fn streamlit_with_existing_venv_activates_then_runs() {
        let dir = tempfile::tempdir().unwrap();
        make_venv(dir.path(), ".venv");
        let app = AppDescriptor::new("A", AppKind::Streamlit, dir.path())
            .with_port(8501)
            .with_entry_point("app.py");

        let built = build(&app).unwrap();
        let activate = dir.path().join(".venv/bin/activate");
        assert!(built.line.starts_with(&format!(". {} && ", quote_path(&activate))));
        assert!(built.line.ends_with("run app.py --port 8501"));
        assert_eq!(built.manager, PackageManager::Pip);
    }

    #[test]
    fn pyproject_selects_uv_runner() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(UV_MANIFEST), "[project]\n").unwrap();
        let app = AppDescriptor::new("A", AppKind::Streamlit, dir.path())
            .with_port(8501)
            .with_entry_point("app.py")
            .with_base_path("/tools");

        let built = build(&app).unwrap();
        assert_eq!(
            built.line,
            "uv run streamlit run app.py --port 8501 --base-path /tools"
        );
    }

    #[test]
    fn missing_venv_emits_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "dash\n").unwrap();
        let app = AppDescriptor::new("D", AppKind::Dash, dir.path())
            .with_port(8050)
            .with_entry_point("app.py");

        let built = build(&app).unwrap();
        let venv = dir.path().join(".venv");
        let expected = format!(
            "python3 -m venv {} && . {} && pip install -r requirements.txt && python app.py --port 8050",
            quote_path(&venv),
            quote_path(&venv.join("bin/activate"))
        );
        assert_eq!(built.line, expected);
    }

    #[test]
    fn explicit_venv_path_is_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        make_venv(dir.path(), "envs/web");
        let app = AppDescriptor::new("F", AppKind::Flask, dir.path())
            .with_port(5000)
            .with_entry_point("server.py")
            .with_venv_path("envs/web");

        let ctx = resolve_package_manager_context(&app, dir.path());
        assert_eq!(ctx.venv_dir, Some(dir.path().join("envs/web")));
        assert!(ctx.bootstrap_prefix.is_none());

        let built = CommandBuilder::default()
            .build(&app, dir.path(), &ctx)
            .unwrap();
        assert!(built
            .line
            .ends_with("&& FLASK_APP=server.py FLASK_DEBUG=1 flask run --host 0.0.0.0 --port 5000"));
        assert_eq!(
            built.env,
            vec![
                ("FLASK_APP".to_string(), "server.py".to_string()),
                ("FLASK_DEBUG".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn flask_with_uv_puts_env_before_runner() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppDescriptor::new("F", AppKind::Flask, dir.path())
            .with_port(5000)
            .with_entry_point("my app.py")
            .with_package_manager(PackageManager::Uv);

        let built = build(&app).unwrap();
        assert_eq!(
            built.line,
            "FLASK_APP='my app.py' FLASK_DEBUG=1 uv run flask run --host 0.0.0.0 --port 5000"
        );
    }

    #[test]
    fn django_finds_shallowest_manage_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/site")).unwrap();
        fs::write(dir.path().join("src/site/manage.py"), "").unwrap();
        fs::write(dir.path().join("src/manage.py"), "").unwrap();
        let app = AppDescriptor::new("api", AppKind::Django, dir.path())
            .with_port(8000)
            .with_package_manager(PackageManager::Uv);

        let built = build(&app).unwrap();
        assert_eq!(built.line, "uv run python src/manage.py runserver 0.0.0.0:8000");
    }

    #[test]
    fn django_search_ignores_ignore_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("backend")).unwrap();
        fs::write(dir.path().join("backend/manage.py"), "").unwrap();
        fs::write(dir.path().join(".ignore"), "backend/\n").unwrap();
        fs::write(dir.path().join(".gitignore"), "manage.py\n").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();

        let found = find_manage_file(dir.path(), 3).unwrap();
        assert_eq!(found, dir.path().join("backend/manage.py"));
    }

    #[test]
    fn django_custom_management_command_without_port() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("manage.py"), "").unwrap();
        let app = AppDescriptor::new("api", AppKind::Django, dir.path())
            .with_package_manager(PackageManager::Uv)
            .with_custom_command("runserver_plus");

        let built = build(&app).unwrap();
        assert_eq!(built.line, "uv run python manage.py runserver_plus");
    }

    #[test]
    fn django_without_manage_file_is_a_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c/d")).unwrap();
        fs::write(dir.path().join("a/b/c/d/manage.py"), "").unwrap();
        let app = AppDescriptor::new("api", AppKind::Django, dir.path());

        assert!(matches!(build(&app), Err(DevrackError::Resolution(_))));
    }

    #[test]
    fn custom_command_is_verbatim_unless_manager_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppDescriptor::new("c", AppKind::Custom, dir.path())
            .with_custom_command("npm run dev -- --port 3000");
        assert_eq!(build(&app).unwrap().line, "npm run dev -- --port 3000");

        let uv = app.clone().with_package_manager(PackageManager::Uv);
        assert_eq!(
            build(&uv).unwrap().line,
            "uv run npm run dev -- --port 3000"
        );

        // pip without a venv does not bootstrap for custom commands
        let pip = app.clone().with_package_manager(PackageManager::Pip);
        assert_eq!(build(&pip).unwrap().line, "npm run dev -- --port 3000");

        make_venv(dir.path(), ".venv");
        let line = build(&pip).unwrap().line;
        assert!(line.starts_with(". "));
        assert!(line.ends_with(" && npm run dev -- --port 3000"));
    }

    #[test]
    fn build_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("manage.py"), "").unwrap();
        fs::write(dir.path().join("setup.py"), "").unwrap();
        let app = AppDescriptor::new("api", AppKind::Django, dir.path()).with_port(8000);

        let first = build(&app).unwrap();
        for _ in 0..5 {
            assert_eq!(build(&app).unwrap(), first);
        }
        assert!(first.line.contains("pip install -e ."));
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("my project");
        make_venv(&dir, ".venv");
        let app = AppDescriptor::new("d", AppKind::Dash, &dir)
            .with_port(8050)
            .with_entry_point("pages/main app.py");

        let built = build(&app).unwrap();
        let words = shell_words::split(&built.line).unwrap();
        assert_eq!(words[0], ".");
        assert_eq!(words[1], dir.join(".venv/bin/activate").to_string_lossy());
        assert_eq!(&words[3..], ["python", "pages/main app.py", "--port", "8050"]);
    }

    #[test]
    fn dependency_sync_commands() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppDescriptor::new("x", AppKind::Custom, dir.path()).with_custom_command("true");

        let ctx = resolve_package_manager_context(&app, dir.path());
        assert_eq!(dependency_sync_command(&ctx), None);

        fs::write(dir.path().join("requirements.txt"), "").unwrap();
        make_venv(dir.path(), ".venv");
        let ctx = resolve_package_manager_context(&app, dir.path());
        let sync = dependency_sync_command(&ctx).unwrap();
        assert!(sync.ends_with("&& pip install -r requirements.txt"));

        fs::write(dir.path().join(UV_MANIFEST), "").unwrap();
        let ctx = resolve_package_manager_context(&app, dir.path());
        assert_eq!(dependency_sync_command(&ctx).as_deref(), Some("uv sync"));
    }
}
