//! Atomic on-disk session state.
//!
//! The session file is rewritten after every state-changing operation, so a
//! crashed orchestrator can be reconnected to its surviving tmux sessions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ClaudioConfig;
use crate::instance::Instance;
use crate::utils::atomic_write_json;

/// Directory layout constants under the base repository.
pub const CLAUDIO_DIR: &str = ".claudio";
pub const SESSIONS_DIR: &str = "sessions";
const SESSION_FILE: &str = "session.json";

/// Root directory for a session's metadata.
pub fn session_dir(base: &Path, session_id: &str) -> PathBuf {
    base.join(CLAUDIO_DIR).join(SESSIONS_DIR).join(session_id)
}

/// Persistent view of one orchestrator session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub name: String,
    pub base_repo: PathBuf,
    pub worktree_root: PathBuf,
    pub created_at: DateTime<Utc>,

    /// Instances in creation order.
    pub instances: Vec<Instance>,

    /// Config snapshot taken when the session was created.
    pub config: ClaudioConfig,
}

impl SessionState {
    pub fn new(name: String, base_repo: PathBuf, config: ClaudioConfig) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let worktree_root = base_repo.join(CLAUDIO_DIR).join("worktrees");
        Self {
            id,
            name,
            base_repo,
            worktree_root,
            created_at: Utc::now(),
            instances: Vec::new(),
            config,
        }
    }

    pub fn session_dir(&self) -> PathBuf {
        session_dir(&self.base_repo, &self.id)
    }

    fn session_file(&self) -> PathBuf {
        self.session_dir().join(SESSION_FILE)
    }

    /// Writes the state atomically (temp file + rename).
    pub async fn save(&self) -> Result<()> {
        atomic_write_json(&self.session_file(), self)
            .await
            .context("Failed to persist session state")
    }

    /// Loads a previously saved session. Returns `None` when no session
    /// file exists yet.
    pub async fn load(base: &Path, session_id: &str) -> Result<Option<Self>> {
        let path = session_dir(base, session_id).join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn instance(&self, instance_id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Status;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SessionState::new(
            "demo".to_string(),
            dir.path().to_path_buf(),
            ClaudioConfig::default(),
        );

        state.instances.push(Instance::new(
            "inst-1".to_string(),
            "Fix the login bug".to_string(),
            "Iron-Ham/abc12345/fix-the-login-bug".to_string(),
            dir.path().join("wt"),
            "claudio-inst-1".to_string(),
        ));

        state.save().await.unwrap();

        let loaded = SessionState::load(dir.path(), &state.id)
            .await
            .unwrap()
            .expect("session file should exist");
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.instances.len(), 1);
        assert_eq!(loaded.instances[0].status, Status::Pending);
        assert_eq!(loaded.config.pr.branch_prefix, "Iron-Ham");
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = SessionState::load(dir.path(), "nope").await.unwrap();
        assert!(loaded.is_none());
    }
}
