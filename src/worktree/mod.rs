//! Isolated git working copies, one per worker.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Failed to delete branch '{0}': {1}")]
    BranchDeleteFailed(String, String),

    #[error("Worktree not found: {0}")]
    NotFound(PathBuf),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Information about a created worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
}

/// Working-copy operations the core depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorktreeBackend: Send + Sync {
    /// Creates a worktree at `path` on a new branch forked from `base`.
    async fn create<'a>(
        &self,
        path: &Path,
        branch: &str,
        base: Option<&'a str>,
    ) -> Result<WorktreeInfo, WorktreeError>;

    /// Removes a worktree.
    async fn remove(&self, path: &Path, force: bool) -> Result<(), WorktreeError>;

    /// Deletes a branch in the base repository.
    async fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError>;

    /// Whether the worktree has uncommitted changes.
    async fn is_dirty(&self, path: &Path) -> Result<bool, WorktreeError>;

    /// Paths with uncommitted changes, relative to the worktree root.
    async fn dirty_files(&self, path: &Path) -> Result<Vec<String>, WorktreeError>;

    /// Unified diff of uncommitted changes.
    async fn diff(&self, path: &Path) -> Result<String, WorktreeError>;

    /// Number of commits on the worktree's branch past `base`.
    async fn commit_count(&self, path: &Path, base: &str) -> Result<usize, WorktreeError>;

    /// Name of the branch checked out in the worktree.
    async fn current_branch(&self, path: &Path) -> Result<String, WorktreeError>;
}

/// Shell-command-based git worktree management.
#[derive(Debug)]
pub struct GitWorktreeBackend {
    repo_path: PathBuf,
}

impl GitWorktreeBackend {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    /// Check if git is available on the system
    pub fn is_git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn head_commit(&self, path: &Path) -> Result<String, WorktreeError> {
        let raw = self.git(path, &["rev-parse", "HEAD"]).await?;
        Ok(raw.trim().to_string())
    }
}

#[async_trait]
impl WorktreeBackend for GitWorktreeBackend {
    async fn create<'a>(
        &self,
        path: &Path,
        branch: &str,
        base: Option<&'a str>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::CreateFailed(e.to_string()))?;
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| WorktreeError::CreateFailed(format!("Invalid UTF-8 path: {:?}", path)))?;

        let mut args = vec!["worktree", "add", "-b", branch, path_str];
        if let Some(base) = base {
            args.push(base);
        }

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::CreateFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let head_commit = self.head_commit(path).await?;

        info!(
            "Created worktree: {} on branch {}",
            path.display(),
            branch
        );

        Ok(WorktreeInfo {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            head_commit,
        })
    }

    async fn remove(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        if !path.exists() {
            return Err(WorktreeError::NotFound(path.to_path_buf()));
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| WorktreeError::RemoveFailed(format!("Invalid UTF-8 path: {:?}", path)))?;

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str);

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already detached from git's bookkeeping
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::RemoveFailed(stderr.to_string()));
            }
        }

        info!("Removed worktree: {}", path.display());
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["branch", "-D", branch])
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::BranchDeleteFailed(
                branch.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(())
    }

    async fn is_dirty(&self, path: &Path) -> Result<bool, WorktreeError> {
        Ok(!self.dirty_files(path).await?.is_empty())
    }

    async fn dirty_files(&self, path: &Path) -> Result<Vec<String>, WorktreeError> {
        if !path.exists() {
            return Err(WorktreeError::NotFound(path.to_path_buf()));
        }

        let raw = self.git(path, &["status", "--porcelain"]).await?;
        Ok(raw
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| line[3..].trim().to_string())
            .collect())
    }

    async fn diff(&self, path: &Path) -> Result<String, WorktreeError> {
        if !path.exists() {
            return Err(WorktreeError::NotFound(path.to_path_buf()));
        }

        self.git(path, &["diff", "HEAD"]).await
    }

    async fn commit_count(&self, path: &Path, base: &str) -> Result<usize, WorktreeError> {
        let range = format!("{}..HEAD", base);
        let raw = self.git(path, &["rev-list", "--count", &range]).await?;
        raw.trim()
            .parse::<usize>()
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }

    async fn current_branch(&self, path: &Path) -> Result<String, WorktreeError> {
        let raw = self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(raw.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_worktree_create_and_remove() {
        let repo = tempdir().unwrap();
        let trees = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let backend = GitWorktreeBackend::new(repo.path().to_path_buf());
        let path = trees.path().join("wt-1");

        let info = backend.create(&path, "test/wt-1", None).await.unwrap();
        assert!(info.path.exists());
        assert_eq!(info.branch, "test/wt-1");
        assert_eq!(backend.current_branch(&path).await.unwrap(), "test/wt-1");

        backend.remove(&path, false).await.unwrap();
        assert!(!path.exists());
        backend.delete_branch("test/wt-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_dirty_detection() {
        let repo = tempdir().unwrap();
        let trees = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let backend = GitWorktreeBackend::new(repo.path().to_path_buf());
        let path = trees.path().join("wt-dirty");
        backend.create(&path, "test/wt-dirty", None).await.unwrap();

        assert!(!backend.is_dirty(&path).await.unwrap());

        tokio::fs::write(path.join("new.txt"), "hello").await.unwrap();
        assert!(backend.is_dirty(&path).await.unwrap());

        let files = backend.dirty_files(&path).await.unwrap();
        assert_eq!(files, vec!["new.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_count() {
        let repo = tempdir().unwrap();
        let trees = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let backend = GitWorktreeBackend::new(repo.path().to_path_buf());
        let path = trees.path().join("wt-commits");
        backend
            .create(&path, "test/wt-commits", Some("main"))
            .await
            .unwrap();

        assert_eq!(backend.commit_count(&path, "main").await.unwrap(), 0);

        tokio::fs::write(path.join("a.txt"), "a").await.unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(&path)
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "add a"])
            .current_dir(&path)
            .output()
            .await
            .unwrap();

        assert_eq!(backend.commit_count(&path, "main").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_worktree() {
        let repo = tempdir().unwrap();
        let backend = GitWorktreeBackend::new(repo.path().to_path_buf());
        let result = backend.remove(Path::new("/nonexistent/wt"), false).await;
        assert!(matches!(result, Err(WorktreeError::NotFound(_))));
    }
}
