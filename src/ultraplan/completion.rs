//! Sentinel files workers drop into their worktrees to signal phase
//! completion. Existence is the signal; the payload carries the result.
//!
//! Workers write these with write-then-rename, but every read still goes
//! through [`crate::utils::read_json_retry`]: a truncated read is transient,
//! never fatal. Unknown fields are tolerated everywhere.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Well-known sentinel file names, relative to a worker's worktree.
pub const PLAN_FILE: &str = ".claudio-plan.json";
pub const TASK_COMPLETION_FILE: &str = ".claudio-task-complete.json";
pub const SYNTHESIS_COMPLETION_FILE: &str = ".claudio-synthesis-complete.json";
pub const REVISION_COMPLETION_FILE: &str = ".claudio-revision-complete.json";
pub const CONSOLIDATION_COMPLETION_FILE: &str = ".claudio-consolidation-complete.json";
pub const GROUP_CONSOLIDATION_COMPLETION_FILE: &str = ".claudio-group-consolidation-complete.json";

/// A field workers may write as either a string or an array of strings.
/// The single accessor joins the array form with newlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlexibleString {
    One(String),
    Many(Vec<String>),
}

impl FlexibleString {
    pub fn joined(&self) -> String {
        match self {
            FlexibleString::One(s) => s.clone(),
            FlexibleString::Many(items) => items.join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FlexibleString::One(s) => s.is_empty(),
            FlexibleString::Many(items) => items.iter().all(|s| s.is_empty()),
        }
    }
}

impl Default for FlexibleString {
    fn default() -> Self {
        FlexibleString::One(String::new())
    }
}

/// Task outcome reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCompletionStatus {
    Complete,
    Blocked,
    Failed,
}

/// `.claudio-task-complete.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletionFile {
    pub task_id: String,
    pub status: TaskCompletionStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<FlexibleString>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskCompletionFile {
    /// Notes in joined form, regardless of how the worker wrote them.
    pub fn notes_text(&self) -> String {
        self.notes.as_ref().map(FlexibleString::joined).unwrap_or_default()
    }
}

/// Synthesis verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    Complete,
    NeedsRevision,
}

/// One issue the synthesis worker wants revised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisIssue {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub suggestion: String,
}

/// `.claudio-synthesis-complete.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisCompletionFile {
    pub status: SynthesisStatus,
    #[serde(default)]
    pub revision_round: u32,
    #[serde(default)]
    pub issues_found: Vec<SynthesisIssue>,
    #[serde(default)]
    pub tasks_affected: Vec<String>,
    #[serde(default)]
    pub integration_notes: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// `.claudio-revision-complete.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionCompletionFile {
    pub task_id: String,
    #[serde(default)]
    pub revision_round: u32,
    #[serde(default)]
    pub issues_addressed: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub remaining_issues: Vec<String>,
}

/// Consolidation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationStatus {
    Complete,
    Partial,
    Failed,
}

/// Result for one consolidated group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_index: usize,
    pub branch_name: String,
    #[serde(default)]
    pub tasks_included: Vec<String>,
    #[serde(default)]
    pub commit_count: usize,
    pub success: bool,
}

/// A PR opened during consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedPr {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub group_index: usize,
}

/// `.claudio-consolidation-complete.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationCompletionFile {
    pub status: ConsolidationStatus,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub group_results: Vec<GroupResult>,
    #[serde(default)]
    pub prs_created: Vec<CreatedPr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_context: Option<String>,
    #[serde(default)]
    pub total_commits: usize,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// A conflict the consolidator resolved while cherry-picking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub file: String,
    #[serde(default)]
    pub resolution: String,
}

/// One build/lint/test command the consolidator ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCommand {
    pub name: String,
    #[serde(default)]
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Verification summary for a consolidated group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    #[serde(default)]
    pub commands_run: Vec<VerificationCommand>,
    #[serde(default)]
    pub overall_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `.claudio-group-consolidation-complete.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConsolidationCompletionFile {
    pub group_index: usize,
    pub status: ConsolidationStatus,
    pub branch_name: String,
    #[serde(default)]
    pub tasks_consolidated: Vec<String>,
    #[serde(default)]
    pub conflicts_resolved: Vec<ConflictResolution>,
    #[serde(default)]
    pub verification: VerificationReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<FlexibleString>,
    #[serde(default)]
    pub issues_for_next_group: Vec<String>,
}

/// Checks for a sentinel without reading it.
pub fn sentinel_exists(worktree: &Path, file_name: &str) -> bool {
    worktree.join(file_name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flexible_string_forms_are_equivalent() {
        let one: FlexibleString = serde_json::from_str(r#""line1\nline2""#).unwrap();
        let many: FlexibleString = serde_json::from_str(r#"["line1", "line2"]"#).unwrap();
        assert_eq!(one.joined(), "line1\nline2");
        assert_eq!(many.joined(), "line1\nline2");
        assert_eq!(one.joined(), many.joined());
    }

    #[test]
    fn test_task_completion_notes_string_form() {
        let raw = r#"{
            "task_id": "A",
            "status": "complete",
            "summary": "renamed",
            "files_modified": ["src/lib.rs"],
            "notes": "watch the re-export"
        }"#;
        let file: TaskCompletionFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.status, TaskCompletionStatus::Complete);
        assert_eq!(file.notes_text(), "watch the re-export");
    }

    #[test]
    fn test_task_completion_notes_array_form() {
        let raw = r#"{
            "task_id": "A",
            "status": "blocked",
            "notes": ["first", "second"],
            "unexpected": {"ignored": true}
        }"#;
        let file: TaskCompletionFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.status, TaskCompletionStatus::Blocked);
        assert_eq!(file.notes_text(), "first\nsecond");
    }

    #[test]
    fn test_synthesis_round_trip() {
        let raw = r#"{
            "status": "needs_revision",
            "revision_round": 0,
            "issues_found": [
                {"task_id": "A", "description": "missed call site",
                 "files": ["src/main.rs"], "severity": "major",
                 "suggestion": "rename it too"}
            ],
            "tasks_affected": ["A"],
            "integration_notes": "",
            "recommendations": []
        }"#;
        let file: SynthesisCompletionFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.status, SynthesisStatus::NeedsRevision);
        assert_eq!(file.tasks_affected, vec!["A"]);
        assert_eq!(file.issues_found[0].severity, "major");
    }

    #[test]
    fn test_group_consolidation_minimal() {
        let raw = r#"{
            "group_index": 1,
            "status": "complete",
            "branch_name": "Iron-Ham/ultraplan-abc12345-group-1"
        }"#;
        let file: GroupConsolidationCompletionFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.group_index, 1);
        assert!(file.conflicts_resolved.is_empty());
        assert!(!file.verification.overall_success);
    }

    #[test]
    fn test_consolidation_with_prs() {
        let raw = r#"{
            "status": "complete",
            "mode": "per-group",
            "prs_created": [
                {"url": "https://github.com/x/y/pull/7", "title": "g1", "group_index": 1}
            ],
            "total_commits": 4,
            "files_changed": ["a.rs"]
        }"#;
        let file: ConsolidationCompletionFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.prs_created.len(), 1);
        assert_eq!(file.total_commits, 4);
    }
}
