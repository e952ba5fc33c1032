//! Detached terminal sessions for worker processes.
//!
//! Workers are opaque external processes; the core only needs to spawn them
//! detached, probe them, scrape their output, and kill them. The
//! [`TerminalBackend`] trait is that narrow surface, and [`TmuxBackend`]
//! implements it by driving the `tmux` binary.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Error types for terminal-session operations
#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("Tmux not found or not installed")]
    TmuxNotFound,
    #[error("Session '{0}' not found")]
    SessionNotFound(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal multiplexer operations the supervision core depends on.
///
/// Object safe so tests can substitute a mock or an in-memory fake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Creates a detached session running `command` in `working_dir`.
    async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: &str,
        width: u16,
        height: u16,
    ) -> Result<(), TmuxError>;

    /// Kills a session. Killing an absent session is an error.
    async fn kill_session(&self, name: &str) -> Result<(), TmuxError>;

    /// Probes whether the session still exists.
    async fn session_exists(&self, name: &str) -> bool;

    /// Captures the visible pane content.
    async fn capture_output(&self, name: &str) -> Result<String, TmuxError>;

    /// Resizes the session's window.
    async fn resize(&self, name: &str, width: u16, height: u16) -> Result<(), TmuxError>;

    /// PID of the root process in the session's pane, if any.
    async fn session_pid(&self, name: &str) -> Result<Option<i32>, TmuxError>;

    /// Whether the session's window has raised a bell since it was last
    /// observed.
    async fn bell_flag(&self, name: &str) -> Result<bool, TmuxError>;

    /// Sends raw keys to the session.
    async fn send_keys(&self, name: &str, keys: &str) -> Result<(), TmuxError>;

    /// Suspends the session's process group (SIGTSTP).
    async fn suspend_session(&self, name: &str) -> Result<(), TmuxError>;

    /// Continues a suspended process group (SIGCONT).
    async fn resume_session(&self, name: &str) -> Result<(), TmuxError>;
}

/// `tmux`-backed implementation.
pub struct TmuxBackend;

impl TmuxBackend {
    /// Creates a backend, verifying that tmux is installed.
    pub async fn new() -> Result<Self, TmuxError> {
        let output = Command::new("tmux")
            .arg("-V")
            .output()
            .await
            .map_err(|_| TmuxError::TmuxNotFound)?;

        if !output.status.success() {
            return Err(TmuxError::TmuxNotFound);
        }

        Ok(Self)
    }

    /// Validates a session name.
    ///
    /// Tmux targets treat ':' and '.' as separators, so they are rejected.
    fn validate_session_name(name: &str) -> Result<(), TmuxError> {
        if name.is_empty() {
            return Err(TmuxError::InvalidSessionName(
                "Session name cannot be empty".to_string(),
            ));
        }

        if name.contains(':') || name.contains('.') {
            return Err(TmuxError::InvalidSessionName(
                "Session name cannot contain ':' or '.' characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Runs a tmux command and fails on non-zero exit.
    async fn run(args: &[&str]) -> Result<(), TmuxError> {
        let output = Command::new("tmux").args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmuxError::CommandFailed(stderr.to_string()));
        }

        Ok(())
    }

    /// Runs a tmux command and captures stdout.
    async fn run_with_output(args: &[&str]) -> Result<String, TmuxError> {
        let output = Command::new("tmux").args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmuxError::CommandFailed(stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: &str,
        width: u16,
        height: u16,
    ) -> Result<(), TmuxError> {
        Self::validate_session_name(name)?;

        if self.session_exists(name).await {
            return Err(TmuxError::CommandFailed(format!(
                "Session '{}' already exists",
                name
            )));
        }

        let dir = working_dir.to_str().ok_or_else(|| {
            TmuxError::CommandFailed(format!("Invalid UTF-8 in path: {:?}", working_dir))
        })?;
        let width = width.to_string();
        let height = height.to_string();

        Self::run(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            dir,
            "-x",
            &width,
            "-y",
            &height,
            command,
        ])
        .await?;

        // Bell detection relies on the monitor flag
        Self::run(&["set-option", "-t", name, "-w", "monitor-bell", "on"]).await?;

        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }

        Self::run(&["kill-session", "-t", name]).await
    }

    async fn session_exists(&self, name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn capture_output(&self, name: &str) -> Result<String, TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }

        Self::run_with_output(&["capture-pane", "-t", name, "-p"]).await
    }

    async fn resize(&self, name: &str, width: u16, height: u16) -> Result<(), TmuxError> {
        let width = width.to_string();
        let height = height.to_string();
        Self::run(&["resize-window", "-t", name, "-x", &width, "-y", &height]).await
    }

    async fn session_pid(&self, name: &str) -> Result<Option<i32>, TmuxError> {
        if !self.session_exists(name).await {
            return Ok(None);
        }

        let raw =
            Self::run_with_output(&["display-message", "-p", "-t", name, "#{pane_pid}"]).await?;
        Ok(raw.trim().parse::<i32>().ok())
    }

    async fn bell_flag(&self, name: &str) -> Result<bool, TmuxError> {
        let raw =
            Self::run_with_output(&["display-message", "-p", "-t", name, "#{window_bell_flag}"])
                .await?;
        Ok(raw.trim() == "1")
    }

    async fn send_keys(&self, name: &str, keys: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }

        Self::run(&["send-keys", "-t", name, keys]).await
    }

    async fn suspend_session(&self, name: &str) -> Result<(), TmuxError> {
        let pid = self
            .session_pid(name)
            .await?
            .ok_or_else(|| TmuxError::SessionNotFound(name.to_string()))?;
        signal_group(pid, GroupSignal::Stop)
    }

    async fn resume_session(&self, name: &str) -> Result<(), TmuxError> {
        let pid = self
            .session_pid(name)
            .await?
            .ok_or_else(|| TmuxError::SessionNotFound(name.to_string()))?;
        signal_group(pid, GroupSignal::Cont)
    }
}

enum GroupSignal {
    Stop,
    Cont,
}

/// The pane's root process is its group leader, so signalling the group by
/// the pane PID reaches the whole worker tree.
#[cfg(unix)]
fn signal_group(pid: i32, signal: GroupSignal) -> Result<(), TmuxError> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Stop => Signal::SIGTSTP,
        GroupSignal::Cont => Signal::SIGCONT,
    };
    killpg(Pid::from_raw(pid), signal)
        .map_err(|e| TmuxError::CommandFailed(format!("killpg({}) failed: {}", pid, e)))
}

#[cfg(not(unix))]
fn signal_group(_pid: i32, _signal: GroupSignal) -> Result<(), TmuxError> {
    Err(TmuxError::CommandFailed(
        "process-group signals require a unix host".to_string(),
    ))
}
