//! Prompt builders for the workers the coordinators spawn. Templates are
//! deliberately small; richer prompt authoring lives outside the core.

use crate::review::ReviewerKind;
use crate::ultraplan::completion::{
    GROUP_CONSOLIDATION_COMPLETION_FILE, PLAN_FILE, REVISION_COMPLETION_FILE,
    SYNTHESIS_COMPLETION_FILE, TASK_COMPLETION_FILE,
};
use crate::ultraplan::completion::{SynthesisIssue, CONSOLIDATION_COMPLETION_FILE};
use crate::ultraplan::plan::{PlanSpec, PlannedTask};
use crate::ultraplan::PlanningStrategy;

// The marker is spelled in two pieces so the echoed prompt itself can never
// match the completion scanner.
const DONE_MARKER_NOTE: &str = "When you are completely finished, print the \
    completion marker on its own line: the word \"claudio\", then a colon, \
    then the word \"done\", joined without spaces.";

/// Prompt for a planning worker.
pub fn planning_prompt(objective: &str, strategy: Option<PlanningStrategy>) -> String {
    let strategy_note = match strategy {
        Some(strategy) => format!("\nPlanning strategy: {}.\n", strategy.instruction()),
        None => String::new(),
    };

    format!(
        "You are planning the objective below as a set of independent tasks \
         for parallel AI workers.\n\nObjective: {objective}\n{strategy_note}\n\
         Write the plan as JSON to `{PLAN_FILE}` in this directory, with \
         fields: id, summary, tasks (id, title, description, files, \
         depends_on, priority, estimated_complexity in low/medium/high), and \
         execution_order as topological groups of task ids.\n\n{DONE_MARKER_NOTE}"
    )
}

/// Prompt for the manager worker that merges the multi-pass plans.
pub fn plan_manager_prompt(objective: &str, plans: &[(PlanningStrategy, PlanSpec)]) -> String {
    let mut rendered = String::new();
    for (strategy, plan) in plans {
        rendered.push_str(&format!(
            "\n### Candidate ({})\n```json\n{}\n```\n",
            strategy,
            serde_json::to_string_pretty(plan).unwrap_or_default()
        ));
    }

    format!(
        "Three candidate plans were produced for this objective:\n\n\
         Objective: {objective}\n{rendered}\n\
         Select or merge them into one final plan and write it to \
         `{PLAN_FILE}`. Then print a `<plan_decision>` block explaining \
         which candidate(s) you kept and why, closed with \
         `</plan_decision>`.\n\n{DONE_MARKER_NOTE}"
    )
}

/// Prompt for one execution-phase task worker.
pub fn task_prompt(task: &PlannedTask, shared_context: &str) -> String {
    let files = if task.files.is_empty() {
        String::new()
    } else {
        format!("Files likely involved: {}\n", task.files.join(", "))
    };
    let context = if shared_context.is_empty() {
        String::new()
    } else {
        format!("\nContext from the rest of the session:\n{shared_context}\n")
    };

    format!(
        "Task {id}: {title}\n\n{description}\n{files}{context}\n\
         Commit your work in this worktree. When done, write \
         `{TASK_COMPLETION_FILE}` here as JSON with: task_id, status \
         (complete/blocked/failed), summary, files_modified, and optional \
         notes, issues, suggestions, dependencies.\n\n{DONE_MARKER_NOTE}",
        id = task.id,
        title = task.title,
        description = task.description,
    )
}

/// Prompt for the synthesis worker reviewing the executed tasks.
pub fn synthesis_prompt(task_summaries: &str, round: u32) -> String {
    format!(
        "Review the combined output of the executed tasks (revision round \
         {round}):\n\n{task_summaries}\n\n\
         Check the pieces integrate: naming, interfaces, missed call sites, \
         duplicated work. Write `{SYNTHESIS_COMPLETION_FILE}` as JSON with: \
         status (complete/needs_revision), revision_round, issues_found \
         (task_id, description, files, severity, suggestion), \
         tasks_affected, integration_notes, recommendations.\n\n\
         {DONE_MARKER_NOTE}"
    )
}

/// Prompt for a revision worker running inside the original task worktree.
pub fn revision_prompt(task_id: &str, issues: &[SynthesisIssue], round: u32) -> String {
    let mut rendered = String::new();
    for issue in issues {
        rendered.push_str(&format!(
            "- {} (severity: {})\n  suggestion: {}\n",
            issue.description, issue.severity, issue.suggestion
        ));
    }

    format!(
        "You are revising task {task_id} (revision round {round}) in its \
         original worktree. Synthesis flagged these issues:\n\n{rendered}\n\
         Fix them and commit. Then write `{REVISION_COMPLETION_FILE}` as \
         JSON with: task_id, revision_round, issues_addressed, summary, \
         files_modified, remaining_issues.\n\n{DONE_MARKER_NOTE}"
    )
}

/// Prompt for a per-group consolidation worker.
pub fn group_consolidation_prompt(
    group_index: usize,
    branch_name: &str,
    base_branch: &str,
    task_branches: &[(String, String)],
    issues_from_previous: &[String],
) -> String {
    let mut tasks = String::new();
    for (task_id, branch) in task_branches {
        tasks.push_str(&format!("- {} on branch `{}`\n", task_id, branch));
    }
    let carried = if issues_from_previous.is_empty() {
        String::new()
    } else {
        format!(
            "\nIssues carried from the previous group:\n{}\n",
            issues_from_previous
                .iter()
                .map(|i| format!("- {}", i))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };

    format!(
        "Consolidate execution group {group_index}. You are on branch \
         `{branch_name}` based on `{base_branch}`. Cherry-pick every commit \
         from these task branches, in order:\n\n{tasks}{carried}\n\
         Resolve conflicts as you go, then run the project's build/lint/test \
         commands. Write `{GROUP_CONSOLIDATION_COMPLETION_FILE}` as JSON \
         with: group_index, status, branch_name, tasks_consolidated, \
         conflicts_resolved, verification (commands_run, overall_success), \
         notes, issues_for_next_group.\n\n{DONE_MARKER_NOTE}"
    )
}

/// Prompt for the single-branch consolidation worker.
pub fn consolidation_prompt(
    branch_name: &str,
    task_branches: &[(String, String)],
) -> String {
    let mut tasks = String::new();
    for (task_id, branch) in task_branches {
        tasks.push_str(&format!("- {} on branch `{}`\n", task_id, branch));
    }

    format!(
        "Consolidate every task onto branch `{branch_name}`, cherry-picking \
         commits in execution order:\n\n{tasks}\n\
         Resolve conflicts, verify the result builds, and open the pull \
         request(s). Write `{CONSOLIDATION_COMPLETION_FILE}` as JSON with: \
         status, mode, group_results, prs_created (url, title, group_index), \
         total_commits, files_changed.\n\n{DONE_MARKER_NOTE}"
    )
}

/// Prompt for a reviewer of the given specialization.
pub fn reviewer_prompt(
    kind: ReviewerKind,
    target_instance: &str,
    diff: &str,
    custom: Option<&str>,
) -> String {
    if let Some(custom) = custom {
        return format!("{custom}\n\n{}", reviewer_output_contract());
    }

    let focus = match kind {
        ReviewerKind::Security => {
            "injection risks, secret handling, unsafe input paths, permission escalation"
        }
        ReviewerKind::Performance => {
            "algorithmic cost, redundant I/O, allocation churn, lock contention"
        }
        ReviewerKind::Style => "naming, dead code, inconsistent idioms, comment accuracy",
        ReviewerKind::TestCoverage => "untested branches, missing edge cases, brittle assertions",
        ReviewerKind::General => "correctness, error handling, API coherence",
        ReviewerKind::Custom => "whatever stands out as most important",
    };

    format!(
        "You are a {kind} reviewer for the work of instance {target_instance}. \
         Focus on: {focus}.\n\nCurrent diff:\n```diff\n{diff}\n```\n\n{}",
        reviewer_output_contract()
    )
}

fn reviewer_output_contract() -> String {
    format!(
        "Report findings as one JSON object on a single line: \
         {{\"issues\": [{{\"severity\": \"critical|major|minor|info\", \
         \"file\": ..., \"line_start\": ..., \"line_end\": ..., \
         \"title\": ..., \"description\": ..., \"suggestion\": ...}}]}}\n\n\
         {DONE_MARKER_NOTE}"
    )
}
