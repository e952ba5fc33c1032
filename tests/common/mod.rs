//! In-memory backends for integration tests: a terminal whose sessions the
//! test scripts by hand, and a worktree store that skips git entirely.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use claudio::config::ClaudioConfig;
use claudio::tmux::{TerminalBackend, TmuxError};
use claudio::worktree::{WorktreeBackend, WorktreeError, WorktreeInfo};

#[derive(Debug, Clone, Default)]
pub struct FakeSession {
    pub working_dir: PathBuf,
    pub command: String,
    pub output: String,
    pub alive: bool,
    pub suspended: bool,
    pub bell: bool,
    pub keys: Vec<String>,
}

/// Terminal backend the test drives: set output, ring bells, end sessions.
#[derive(Default)]
pub struct FakeTerminal {
    pub sessions: Mutex<HashMap<String, FakeSession>>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&self, name: &str, output: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(name) {
            session.output = output.to_string();
        }
    }

    pub fn end_session(&self, name: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(name) {
            session.alive = false;
        }
    }

    pub fn is_suspended(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.suspended)
            .unwrap_or(false)
    }
}

#[async_trait]
impl TerminalBackend for FakeTerminal {
    async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: &str,
        _width: u16,
        _height: u16,
    ) -> Result<(), TmuxError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.get(name).map(|s| s.alive).unwrap_or(false) {
            return Err(TmuxError::CommandFailed(format!(
                "Session '{}' already exists",
                name
            )));
        }
        sessions.insert(
            name.to_string(),
            FakeSession {
                working_dir: working_dir.to_path_buf(),
                command: command.to_string(),
                alive: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(name) {
            Some(session) if session.alive => {
                session.alive = false;
                Ok(())
            }
            _ => Err(TmuxError::SessionNotFound(name.to_string())),
        }
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.alive)
            .unwrap_or(false)
    }

    async fn capture_output(&self, name: &str) -> Result<String, TmuxError> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .filter(|s| s.alive)
            .map(|s| s.output.clone())
            .ok_or_else(|| TmuxError::SessionNotFound(name.to_string()))
    }

    async fn resize(&self, _name: &str, _width: u16, _height: u16) -> Result<(), TmuxError> {
        Ok(())
    }

    async fn session_pid(&self, name: &str) -> Result<Option<i32>, TmuxError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(name)
            .filter(|s| s.alive)
            .map(|_| 4242))
    }

    async fn bell_flag(&self, name: &str) -> Result<bool, TmuxError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.bell)
            .unwrap_or(false))
    }

    async fn send_keys(&self, name: &str, keys: &str) -> Result<(), TmuxError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(name) {
            Some(session) if session.alive => {
                session.keys.push(keys.to_string());
                Ok(())
            }
            _ => Err(TmuxError::SessionNotFound(name.to_string())),
        }
    }

    async fn suspend_session(&self, name: &str) -> Result<(), TmuxError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(name) {
            Some(session) if session.alive => {
                session.suspended = true;
                Ok(())
            }
            _ => Err(TmuxError::SessionNotFound(name.to_string())),
        }
    }

    async fn resume_session(&self, name: &str) -> Result<(), TmuxError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(name) {
            Some(session) if session.alive => {
                session.suspended = false;
                Ok(())
            }
            _ => Err(TmuxError::SessionNotFound(name.to_string())),
        }
    }
}

/// One recorded `create` call: path, branch, and the base it forked from.
#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub base: Option<String>,
}

/// Worktree backend that only touches the filesystem, no git.
#[derive(Default)]
pub struct FakeWorktrees {
    pub branches: Mutex<HashMap<PathBuf, String>>,
    pub dirty: Mutex<HashMap<PathBuf, Vec<String>>>,
    pub created: Mutex<Vec<CreatedWorktree>>,
}

impl FakeWorktrees {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self, path: &Path, files: Vec<String>) {
        self.dirty.lock().unwrap().insert(path.to_path_buf(), files);
    }

    /// The recorded create call for `branch`, if any.
    pub fn created_with_branch(&self, branch: &str) -> Option<CreatedWorktree> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.branch == branch)
            .cloned()
    }
}

#[async_trait]
impl WorktreeBackend for FakeWorktrees {
    async fn create<'a>(
        &self,
        path: &Path,
        branch: &str,
        base: Option<&'a str>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| WorktreeError::CreateFailed(e.to_string()))?;
        self.branches
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), branch.to_string());
        self.created.lock().unwrap().push(CreatedWorktree {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            base: base.map(str::to_string),
        });
        Ok(WorktreeInfo {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            head_commit: "fake".to_string(),
        })
    }

    async fn remove(&self, path: &Path, _force: bool) -> Result<(), WorktreeError> {
        let _ = tokio::fs::remove_dir_all(path).await;
        self.branches.lock().unwrap().remove(path);
        Ok(())
    }

    async fn delete_branch(&self, _branch: &str) -> Result<(), WorktreeError> {
        Ok(())
    }

    async fn is_dirty(&self, path: &Path) -> Result<bool, WorktreeError> {
        Ok(!self.dirty_files(path).await?.is_empty())
    }

    async fn dirty_files(&self, path: &Path) -> Result<Vec<String>, WorktreeError> {
        Ok(self
            .dirty
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    async fn diff(&self, _path: &Path) -> Result<String, WorktreeError> {
        Ok("fake diff\n".to_string())
    }

    async fn commit_count(&self, _path: &Path, _base: &str) -> Result<usize, WorktreeError> {
        Ok(1)
    }

    async fn current_branch(&self, path: &Path) -> Result<String, WorktreeError> {
        Ok(self
            .branches
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| "main".to_string()))
    }
}

/// Config tuned for fast test polling.
pub fn test_config() -> ClaudioConfig {
    claudio::utils::init_tracing();
    let mut config = ClaudioConfig::default();
    config.instance.poll_interval = Duration::from_millis(25);
    config.ultraplan.poll_interval = Duration::from_millis(25);
    config
}

/// Polls `predicate` until it returns `Some`, or panics after `timeout`.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut predicate: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = predicate().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
