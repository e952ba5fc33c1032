//! Advisory detection of file-level conflicts between concurrent workers.
//!
//! Two instances touching the same path in their own worktrees will collide
//! at consolidation time; surfacing the overlap early lets the operator
//! intervene. Detection is best-effort and never blocks the orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::worktree::WorktreeBackend;

/// A file touched by more than one registered worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictReport {
    pub file: String,
    pub instance_ids: Vec<String>,
}

pub type ConflictCallback = Arc<dyn Fn(&ConflictReport) + Send + Sync>;

/// Watches registered worktrees for overlapping dirty files.
pub struct ConflictDetector {
    registrations: DashMap<String, PathBuf>,
    worktrees: Arc<dyn WorktreeBackend>,
    on_conflict: RwLock<Option<ConflictCallback>>,
}

impl ConflictDetector {
    pub fn new(worktrees: Arc<dyn WorktreeBackend>) -> Self {
        Self {
            registrations: DashMap::new(),
            worktrees,
            on_conflict: RwLock::new(None),
        }
    }

    pub async fn set_conflict_callback(&self, callback: ConflictCallback) {
        *self.on_conflict.write().await = Some(callback);
    }

    /// Registers an instance's worktree for scanning. The path must exist.
    pub fn register(&self, instance_id: &str, worktree_path: PathBuf) -> Result<()> {
        if !worktree_path.exists() {
            return Err(anyhow!(
                "Worktree {} does not exist",
                worktree_path.display()
            ));
        }

        self.registrations
            .insert(instance_id.to_string(), worktree_path);
        Ok(())
    }

    /// Removing an unknown id is a no-op.
    pub fn unregister(&self, instance_id: &str) {
        self.registrations.remove(instance_id);
    }

    pub fn registered_count(&self) -> usize {
        self.registrations.len()
    }

    /// Scans every registered worktree and reports files dirty in more than
    /// one of them. Worktrees that fail to report are skipped with a
    /// warning.
    pub async fn scan(&self) -> Vec<ConflictReport> {
        let snapshot: Vec<(String, PathBuf)> = self
            .registrations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut touched: HashMap<String, Vec<String>> = HashMap::new();
        for (instance_id, path) in snapshot {
            match self.worktrees.dirty_files(&path).await {
                Ok(files) => {
                    for file in files {
                        touched.entry(file).or_default().push(instance_id.clone());
                    }
                }
                Err(e) => warn!("Conflict scan skipped {}: {}", path.display(), e),
            }
        }

        let mut reports: Vec<ConflictReport> = touched
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(file, mut instance_ids)| {
                instance_ids.sort();
                ConflictReport { file, instance_ids }
            })
            .collect();
        reports.sort_by(|a, b| a.file.cmp(&b.file));

        if !reports.is_empty() {
            let callback = self.on_conflict.read().await.clone();
            for report in &reports {
                warn!(
                    "File {} modified by {} concurrent instances",
                    report.file,
                    report.instance_ids.len()
                );
                if let Some(callback) = &callback {
                    callback(report);
                }
            }
        }

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::MockWorktreeBackend;

    #[tokio::test]
    async fn test_overlap_detection() {
        let dir = tempfile::tempdir().unwrap();
        let wt_a = dir.path().join("a");
        let wt_b = dir.path().join("b");
        std::fs::create_dir_all(&wt_a).unwrap();
        std::fs::create_dir_all(&wt_b).unwrap();

        let mut worktrees = MockWorktreeBackend::new();
        let (a, b) = (wt_a.clone(), wt_b.clone());
        worktrees.expect_dirty_files().returning(move |path| {
            if path == a.as_path() {
                Ok(vec!["src/lib.rs".to_string(), "src/a.rs".to_string()])
            } else if path == b.as_path() {
                Ok(vec!["src/lib.rs".to_string()])
            } else {
                Ok(Vec::new())
            }
        });

        let detector = ConflictDetector::new(Arc::new(worktrees));
        detector.register("inst-a", wt_a).unwrap();
        detector.register("inst-b", wt_b).unwrap();

        let reports = detector.scan().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].file, "src/lib.rs");
        assert_eq!(reports[0].instance_ids, vec!["inst-a", "inst-b"]);
    }

    #[tokio::test]
    async fn test_register_missing_worktree_fails() {
        let detector = ConflictDetector::new(Arc::new(MockWorktreeBackend::new()));

        assert!(detector
            .register("ghost", PathBuf::from("/definitely/not/here"))
            .is_err());
        assert_eq!(detector.registered_count(), 0);

        // Unregister of an unknown id is a no-op
        detector.unregister("ghost");
    }
}
