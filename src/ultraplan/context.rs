//! Context aggregated from task completions, carried into synthesis and
//! the consolidated PR body.

use serde::{Deserialize, Serialize};

use super::completion::TaskCompletionFile;

/// Everything the completed tasks reported, merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedTaskContext {
    /// (task id, joined notes) pairs, in completion order.
    pub notes: Vec<(String, String)>,
    pub issues: Vec<(String, String)>,
    pub suggestions: Vec<(String, String)>,
    /// Deduplicated, order-preserving.
    pub dependencies: Vec<String>,
}

impl AggregatedTaskContext {
    pub fn from_completions(completions: &[TaskCompletionFile]) -> Self {
        let mut context = Self::default();

        for completion in completions {
            let notes = completion.notes_text();
            if !notes.is_empty() {
                context.notes.push((completion.task_id.clone(), notes));
            }
            for issue in &completion.issues {
                context
                    .issues
                    .push((completion.task_id.clone(), issue.clone()));
            }
            for suggestion in &completion.suggestions {
                context
                    .suggestions
                    .push((completion.task_id.clone(), suggestion.clone()));
            }
            for dependency in &completion.dependencies {
                if !context.dependencies.contains(dependency) {
                    context.dependencies.push(dependency.clone());
                }
            }
        }

        context
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
            && self.issues.is_empty()
            && self.suggestions.is_empty()
            && self.dependencies.is_empty()
    }

    /// Markdown for the PR body. A section appears only when it has
    /// content.
    pub fn to_pr_markdown(&self) -> String {
        let mut out = String::new();

        if !self.notes.is_empty() {
            out.push_str("## Implementation Notes\n\n");
            for (task_id, note) in &self.notes {
                out.push_str(&format!("- `{}`: {}\n", task_id, note.replace('\n', " ")));
            }
            out.push('\n');
        }

        if !self.issues.is_empty() {
            out.push_str("## Issues/Concerns Flagged\n\n");
            for (task_id, issue) in &self.issues {
                out.push_str(&format!("- `{}`: {}\n", task_id, issue));
            }
            out.push('\n');
        }

        if !self.suggestions.is_empty() {
            out.push_str("## Integration Suggestions\n\n");
            for (task_id, suggestion) in &self.suggestions {
                out.push_str(&format!("- `{}`: {}\n", task_id, suggestion));
            }
            out.push('\n');
        }

        if !self.dependencies.is_empty() {
            out.push_str("## New Dependencies\n\n");
            for dependency in &self.dependencies {
                out.push_str(&format!("- {}\n", dependency));
            }
            out.push('\n');
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ultraplan::completion::{FlexibleString, TaskCompletionStatus};
    use pretty_assertions::assert_eq;

    fn completion(task_id: &str) -> TaskCompletionFile {
        TaskCompletionFile {
            task_id: task_id.to_string(),
            status: TaskCompletionStatus::Complete,
            summary: String::new(),
            files_modified: Vec::new(),
            notes: None,
            issues: Vec::new(),
            suggestions: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_dependencies_deduplicated() {
        let mut a = completion("A");
        a.dependencies = vec!["serde".to_string(), "tokio".to_string()];
        let mut b = completion("B");
        b.dependencies = vec!["tokio".to_string(), "regex".to_string()];

        let context = AggregatedTaskContext::from_completions(&[a, b]);
        assert_eq!(context.dependencies, vec!["serde", "tokio", "regex"]);
    }

    #[test]
    fn test_markdown_emits_only_populated_sections() {
        let mut a = completion("A");
        a.notes = Some(FlexibleString::One("renamed carefully".to_string()));

        let context = AggregatedTaskContext::from_completions(&[a]);
        let markdown = context.to_pr_markdown();

        assert!(markdown.contains("## Implementation Notes"));
        assert!(markdown.contains("renamed carefully"));
        assert!(!markdown.contains("## Issues/Concerns Flagged"));
        assert!(!markdown.contains("## Integration Suggestions"));
        assert!(!markdown.contains("## New Dependencies"));
    }

    #[test]
    fn test_empty_context_renders_nothing() {
        let context = AggregatedTaskContext::from_completions(&[completion("A")]);
        assert!(context.is_empty());
        assert_eq!(context.to_pr_markdown(), "");
    }

    #[test]
    fn test_array_notes_fold_into_one_entry() {
        let mut a = completion("A");
        a.notes = Some(FlexibleString::Many(vec![
            "first".to_string(),
            "second".to_string(),
        ]));

        let context = AggregatedTaskContext::from_completions(&[a]);
        assert_eq!(context.notes.len(), 1);
        assert_eq!(context.notes[0].1, "first\nsecond");
    }
}
