//! macOS Terminal backend: every app gets its own Terminal window, identified by the
//! custom title of the window's tab.
//!
//! Windows are driven through `osascript`. `do script` without a target always opens a
//! new window. Interrupt and continue have to focus the window and synthesize keystrokes
//! through System Events, which needs accessibility permission and can lose focus races,
//! so both are best-effort.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{restart_loop_script, SessionBackend};
use crate::error::{DevrackError, Result};

const FOUND: &str = "found";

#[derive(Debug, Clone, Default)]
pub struct TerminalBackend;

#[derive(Debug, Clone, Copy)]
enum Keystroke {
    Interrupt,
    Continue,
}

impl Keystroke {
    fn script(self) -> &'static str {
        match self {
            Keystroke::Interrupt => "keystroke \"c\" using control down",
            Keystroke::Continue => "key code 36",
        }
    }
}

impl TerminalBackend {
    pub fn new() -> Self {
        Self
    }

    fn ensure_supported(operation: &'static str) -> Result<()> {
        if cfg!(target_os = "macos") {
            Ok(())
        } else {
            Err(DevrackError::unsupported("terminal", operation))
        }
    }

    async fn osascript(&self, script: &str) -> Result<String> {
        debug!(script, "osascript");
        let output = Command::new("osascript")
            .args(["-e", script])
            .output()
            .await
            .map_err(|err| DevrackError::backend(format!("failed to run osascript: {err}")))?;
        if !output.status.success() {
            return Err(DevrackError::backend(format!(
                "osascript failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn titles(&self) -> Result<Vec<String>> {
        Self::ensure_supported("list_sessions")?;
        let raw = self.osascript(LIST_TITLES).await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn press(&self, name: &str, key: Keystroke) -> Result<()> {
        Self::ensure_supported(match key {
            Keystroke::Interrupt => "send_interrupt",
            Keystroke::Continue => "send_continue",
        })?;
        let result = self.osascript(&focus_and_press(name, key)).await?;
        if result != FOUND {
            return Err(DevrackError::backend(format!("no Terminal tab titled '{name}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for TerminalBackend {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn supports_restart_in_place(&self) -> bool {
        true
    }

    async fn create_session(&self, name: &str, working_dir: &Path, command: &str) -> Result<()> {
        if !cfg!(target_os = "macos") {
            return Err(DevrackError::backend(
                "the terminal backend requires macOS Terminal",
            ));
        }
        if self.session_exists(name).await {
            return Err(DevrackError::SessionExists(name.to_string()));
        }
        self.osascript(&new_window_script(name, working_dir, command))
            .await?;
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.titles()
            .await
            .map(|titles| titles.iter().any(|title| title.eq_ignore_ascii_case(name)))
            .unwrap_or(false)
    }

    async fn send_interrupt(&self, name: &str) -> Result<()> {
        self.press(name, Keystroke::Interrupt).await
    }

    async fn send_continue(&self, name: &str) -> Result<()> {
        self.press(name, Keystroke::Continue).await
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        if !cfg!(target_os = "macos") {
            return Err(DevrackError::backend(
                "the terminal backend requires macOS Terminal",
            ));
        }
        let tty = self.osascript(&tab_tty(name)).await?;
        if tty.is_empty() {
            return Ok(());
        }
        let output = Command::new("pkill")
            .args(["-HUP", "-t", tty.trim_start_matches("/dev/")])
            .output()
            .await?;
        // pkill exits 1 when the tty has no processes left
        if !output.status.success() && output.status.code() != Some(1) {
            return Err(DevrackError::backend(format!(
                "pkill failed for {tty}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        self.titles().await
    }
}

const LIST_TITLES: &str = "tell application \"Terminal\"\n\
set titles to {}\n\
repeat with w in windows\n\
repeat with t in tabs of w\n\
set end of titles to custom title of t\n\
end repeat\n\
end repeat\n\
set AppleScript's text item delimiters to linefeed\n\
return titles as text\n\
end tell";

// `do script` returns the tab of the window it opened.
fn new_window_script(name: &str, working_dir: &Path, command: &str) -> String {
    let shell = format!(
        "cd {} && exec sh -c {}",
        shell_words::quote(&working_dir.to_string_lossy()),
        shell_words::quote(&restart_loop_script(name, command))
    );
    format!(
        "tell application \"Terminal\"\n\
         set appTab to do script \"{}\"\n\
         set custom title of appTab to \"{}\"\n\
         set title displays custom title of appTab to true\n\
         end tell",
        applescript_escape(&shell),
        applescript_escape(name)
    )
}

// AppleScript `is` compares text case-insensitively, matching session name rules.
fn focus_and_press(name: &str, key: Keystroke) -> String {
    format!(
        "tell application \"Terminal\"\n\
         repeat with w in windows\n\
         repeat with t in tabs of w\n\
         if custom title of t is \"{name}\" then\n\
         set selected of t to true\n\
         set index of w to 1\n\
         activate\n\
         delay 0.2\n\
         tell application \"System Events\" to {key}\n\
         return \"{FOUND}\"\n\
         end if\n\
         end repeat\n\
         end repeat\n\
         end tell\n\
         return \"\"",
        name = applescript_escape(name),
        key = key.script(),
    )
}

// Returns the app tab's tty and clears its title so it stops resolving as a session.
fn tab_tty(name: &str) -> String {
    format!(
        "tell application \"Terminal\"\n\
         repeat with w in windows\n\
         repeat with t in tabs of w\n\
         if custom title of t is \"{name}\" then\n\
         set custom title of t to \"\"\n\
         return tty of t\n\
         end if\n\
         end repeat\n\
         end repeat\n\
         end tell\n\
         return \"\"",
        name = applescript_escape(name),
    )
}

fn applescript_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_applescript_strings() {
        assert_eq!(applescript_escape(r#"say "hi" \o/"#), r#"say \"hi\" \\o/"#);
    }

    #[test]
    fn new_window_script_titles_the_opened_tab() {
        let script = new_window_script("api", Path::new("/srv/my api"), "flask run");
        assert!(script.contains("set appTab to do script \"cd '/srv/my api' && exec sh -c"));
        assert!(!script.contains("\" in "));
        assert!(script.contains("set custom title of appTab to \"api\""));
        assert!(script.contains("flask run"));
    }

    #[test]
    fn focus_script_targets_title_and_key() {
        let script = focus_and_press("My \"App\"", Keystroke::Continue);
        assert!(script.contains("if custom title of t is \"My \\\"App\\\"\" then"));
        assert!(script.contains("tell application \"System Events\" to key code 36"));

        let script = focus_and_press("api", Keystroke::Interrupt);
        assert!(script.contains("keystroke \"c\" using control down"));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn signals_are_unsupported_off_macos() {
        let backend = TerminalBackend::new();
        assert!(matches!(
            backend.send_continue("api").await,
            Err(DevrackError::Unsupported { backend: "terminal", .. })
        ));
        assert!(!backend.session_exists("api").await);
        assert!(matches!(
            backend.create_session("api", Path::new("/"), "true").await,
            Err(DevrackError::Backend(_))
        ));
    }
}
