//! The multi-phase workflow: plan, execute over the task DAG, synthesize,
//! optionally revise, and consolidate onto deterministic branches.
//!
//! Phase boundaries are filesystem-signalled: each worker writes a sentinel
//! JSON file into its worktree when done, and the coordinator polls for it
//! at a coarse cadence, checking cancellation every iteration.

pub mod completion;
pub mod context;
pub mod plan;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UltraPlanConfig;
use crate::instance::Status;
use crate::orchestrator::Orchestrator;
use crate::pr::{PrContext, PrEvent, PrMode, PrRequest, PrTaskSummary, PRWorkflowManager, RelatedPr};
use crate::prompts;
use crate::utils::read_json_retry;

use completion::{
    ConsolidationCompletionFile, ConsolidationStatus, CreatedPr, GroupConsolidationCompletionFile,
    GroupResult, RevisionCompletionFile, SynthesisCompletionFile, SynthesisIssue, SynthesisStatus,
    TaskCompletionFile, TaskCompletionStatus, GROUP_CONSOLIDATION_COMPLETION_FILE, PLAN_FILE,
    REVISION_COMPLETION_FILE, SYNTHESIS_COMPLETION_FILE, TASK_COMPLETION_FILE,
    CONSOLIDATION_COMPLETION_FILE,
};
use context::AggregatedTaskContext;
use plan::PlanSpec;

/// Multi-pass planning strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanningStrategy {
    MaximizeParallelism,
    MinimizeComplexity,
    BalancedApproach,
}

impl PlanningStrategy {
    pub const ALL: [PlanningStrategy; 3] = [
        PlanningStrategy::MaximizeParallelism,
        PlanningStrategy::MinimizeComplexity,
        PlanningStrategy::BalancedApproach,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PlanningStrategy::MaximizeParallelism => "maximize-parallelism",
            PlanningStrategy::MinimizeComplexity => "minimize-complexity",
            PlanningStrategy::BalancedApproach => "balanced-approach",
        }
    }

    /// Instruction fragment for the planner prompt.
    pub fn instruction(&self) -> &'static str {
        match self {
            PlanningStrategy::MaximizeParallelism => {
                "split aggressively so as many tasks as possible run concurrently"
            }
            PlanningStrategy::MinimizeComplexity => {
                "prefer fewer, simpler tasks even if they serialize"
            }
            PlanningStrategy::BalancedApproach => {
                "balance parallelism against per-task complexity"
            }
        }
    }
}

impl std::fmt::Display for PlanningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How execution groups land on branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsolidationMode {
    /// One branch and one stacked PR per execution group.
    PerGroup,
    /// Everything onto a single branch and PR.
    Single,
}

/// Deterministic branch for execution group `group` (1-based).
pub fn group_branch_name(prefix: &str, session_id: &str, group: usize) -> String {
    format!("{}/ultraplan-{}-group-{}", prefix, short_id(session_id), group)
}

/// Deterministic branch for single-mode consolidation.
pub fn single_branch_name(prefix: &str, session_id: &str) -> String {
    format!("{}/ultraplan-{}", prefix, short_id(session_id))
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Where one task's work lives after execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorktree {
    pub task_id: String,
    pub instance_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub commit_count: usize,
}

/// Synthesis/revision loop bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevisionState {
    pub round: u32,
    pub max_rounds: u32,
    pub open_issues: Vec<SynthesisIssue>,
    pub tasks_to_revise: Vec<String>,
    pub revised_tasks: Vec<String>,
}

/// One ultra-plan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltraPlanSession {
    pub id: String,
    pub objective: String,
    pub config: UltraPlanConfig,
    pub plan: Option<PlanSpec>,
    /// The manager worker's `<plan_decision>` rationale, multi-pass only.
    pub plan_decision: Option<String>,
    pub task_worktrees: HashMap<String, TaskWorktree>,
    pub group_branches: Vec<String>,
    pub revision: RevisionState,
    pub created_at: DateTime<Utc>,
}

/// Final result handed back to the caller.
#[derive(Debug, Clone)]
pub struct UltraPlanOutcome {
    pub session: UltraPlanSession,
    pub consolidation: ConsolidationCompletionFile,
    pub aggregated_context: AggregatedTaskContext,
}

struct CoordinatorInner {
    orchestrator: Orchestrator,
    pr_workflows: Arc<PRWorkflowManager>,
    config: UltraPlanConfig,
    session: RwLock<UltraPlanSession>,
    completions: RwLock<HashMap<String, TaskCompletionFile>>,
    cancel: CancellationToken,
}

/// Drives one ultra-plan session through its phases.
#[derive(Clone)]
pub struct UltraPlanCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl UltraPlanCoordinator {
    pub fn new(
        orchestrator: Orchestrator,
        pr_workflows: Arc<PRWorkflowManager>,
        objective: &str,
        config: UltraPlanConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let session = UltraPlanSession {
            id: uuid::Uuid::new_v4().to_string(),
            objective: objective.to_string(),
            config: config.clone(),
            plan: None,
            plan_decision: None,
            task_worktrees: HashMap::new(),
            group_branches: Vec::new(),
            revision: RevisionState {
                max_rounds: config.max_revision_rounds,
                ..Default::default()
            },
            created_at: Utc::now(),
        };

        Self {
            inner: Arc::new(CoordinatorInner {
                orchestrator,
                pr_workflows,
                config,
                session: RwLock::new(session),
                completions: RwLock::new(HashMap::new()),
                cancel: cancel.child_token(),
            }),
        }
    }

    pub async fn session_snapshot(&self) -> UltraPlanSession {
        self.inner.session.read().await.clone()
    }

    /// Runs every phase to completion.
    pub async fn run(&self) -> Result<UltraPlanOutcome> {
        let plan = self.planning_phase().await?;
        self.execution_phase(&plan).await?;

        let mut round = 0u32;
        loop {
            let synthesis = self.synthesis_phase(round).await?;
            match synthesis.status {
                SynthesisStatus::Complete => break,
                SynthesisStatus::NeedsRevision => {
                    if round >= self.inner.config.max_revision_rounds {
                        warn!(
                            "Revision limit ({}) reached; consolidating with open issues",
                            self.inner.config.max_revision_rounds
                        );
                        break;
                    }
                    self.revision_phase(&synthesis, round).await?;
                    round += 1;
                }
            }
        }

        let aggregated = {
            let completions = self.inner.completions.read().await;
            let ordered: Vec<TaskCompletionFile> = self
                .ordered_task_ids(&plan)
                .into_iter()
                .filter_map(|id| completions.get(&id).cloned())
                .collect();
            AggregatedTaskContext::from_completions(&ordered)
        };

        let consolidation = self.consolidation_phase(&plan, &aggregated).await?;

        Ok(UltraPlanOutcome {
            session: self.session_snapshot().await,
            consolidation,
            aggregated_context: aggregated,
        })
    }

    // --- planning ---------------------------------------------------------

    async fn planning_phase(&self) -> Result<PlanSpec> {
        let objective = self.inner.session.read().await.objective.clone();

        let plan = if self.inner.config.multi_pass_planning {
            self.multi_pass_planning(&objective).await?
        } else {
            let prompt = prompts::planning_prompt(&objective, None);
            let (instance_id, worktree) =
                self.spawn_prompted_worker("ultraplan: planning", &prompt).await?;
            let plan: PlanSpec = self
                .wait_for_sentinel(&instance_id, &worktree, PLAN_FILE)
                .await?;
            self.retire_worker(&instance_id).await;
            plan
        };

        plan.validate().map_err(|e| anyhow!("Planner produced an invalid plan: {}", e))?;

        info!(
            "Plan accepted: {} tasks in {} layers",
            plan.tasks.len(),
            plan.execution_layers()?.len()
        );
        self.inner.session.write().await.plan = Some(plan.clone());
        Ok(plan)
    }

    async fn multi_pass_planning(&self, objective: &str) -> Result<PlanSpec> {
        let mut planners = JoinSet::new();
        for strategy in PlanningStrategy::ALL {
            let coordinator = self.clone();
            let objective = objective.to_string();
            planners.spawn(async move {
                let prompt = prompts::planning_prompt(&objective, Some(strategy));
                let label = format!("ultraplan: planning ({})", strategy);
                let (instance_id, worktree) =
                    coordinator.spawn_prompted_worker(&label, &prompt).await?;
                let plan: PlanSpec = coordinator
                    .wait_for_sentinel(&instance_id, &worktree, PLAN_FILE)
                    .await?;
                coordinator.retire_worker(&instance_id).await;
                Ok::<_, anyhow::Error>((strategy, plan))
            });
        }

        let mut candidates = Vec::new();
        while let Some(joined) = planners.join_next().await {
            candidates.push(joined.context("Planner task panicked")??);
        }
        candidates.sort_by_key(|(strategy, _)| strategy.name());

        let prompt = prompts::plan_manager_prompt(objective, &candidates);
        let (instance_id, worktree) = self
            .spawn_prompted_worker("ultraplan: plan selection", &prompt)
            .await?;
        let plan: PlanSpec = self
            .wait_for_sentinel(&instance_id, &worktree, PLAN_FILE)
            .await?;

        // The decision rationale lives in the manager's terminal output
        if let Some(manager) = self
            .inner
            .orchestrator
            .get_instance_manager(&instance_id)
            .await
        {
            let output = manager.last_output().await;
            if let Some(decision) = extract_plan_decision(&output) {
                self.inner.session.write().await.plan_decision = Some(decision);
            }
        }
        self.retire_worker(&instance_id).await;

        Ok(plan)
    }

    // --- execution --------------------------------------------------------

    /// Starts every task of a layer concurrently and blocks until the whole
    /// layer has produced completion files. Layer `k + 1` never starts
    /// before layer `k` is fully complete.
    async fn execution_phase(&self, plan: &PlanSpec) -> Result<()> {
        let layers = plan.execution_layers()?;

        for (layer_index, layer) in layers.iter().enumerate() {
            info!(
                "Executing layer {}/{} ({} tasks)",
                layer_index + 1,
                layers.len(),
                layer.len()
            );

            let mut workers = JoinSet::new();
            for task_id in layer {
                let coordinator = self.clone();
                let task = plan
                    .task(task_id)
                    .ok_or_else(|| anyhow!("Task {} missing from plan", task_id))?
                    .clone();
                workers.spawn(async move { coordinator.run_task(&task).await });
            }

            while let Some(joined) = workers.join_next().await {
                let (worktree, completion) = joined.context("Task worker panicked")??;
                let mut session = self.inner.session.write().await;
                session
                    .task_worktrees
                    .insert(completion.task_id.clone(), worktree);
                drop(session);
                self.inner
                    .completions
                    .write()
                    .await
                    .insert(completion.task_id.clone(), completion);
            }
        }

        Ok(())
    }

    /// Runs one task, retrying per policy. A task that cannot reach
    /// `complete` within the retry budget fails the plan.
    async fn run_task(
        &self,
        task: &plan::PlannedTask,
    ) -> Result<(TaskWorktree, TaskCompletionFile)> {
        let prompt = prompts::task_prompt(task, "");
        let attempts = self.inner.config.task_retry_limit + 1;

        let mut worktree: Option<(String, PathBuf)> = None;
        let mut last_failure = String::new();

        for attempt in 0..attempts {
            if self.inner.cancel.is_cancelled() {
                bail!("Cancelled while executing task {}", task.id);
            }

            let (instance_id, path) = match &worktree {
                // Retries reuse the worktree so partial work carries over
                Some((_, path)) => {
                    clear_sentinel(path, TASK_COMPLETION_FILE).await;
                    let branch = self
                        .inner
                        .orchestrator
                        .worktrees()
                        .current_branch(path)
                        .await?;
                    let id = self
                        .inner
                        .orchestrator
                        .add_instance_to_worktree(&task.title, path, &branch)
                        .await?;
                    self.start_and_prompt(&id, &prompt).await?;
                    (id, path.clone())
                }
                None => {
                    let label = format!("{}: {}", task.id, task.title);
                    self.spawn_prompted_worker(&label, &prompt).await?
                }
            };
            worktree = Some((instance_id.clone(), path.clone()));

            match self
                .wait_for_sentinel::<TaskCompletionFile>(&instance_id, &path, TASK_COMPLETION_FILE)
                .await
            {
                Ok(file) if file.status == TaskCompletionStatus::Complete => {
                    self.retire_worker(&instance_id).await;

                    let branch = self
                        .inner
                        .orchestrator
                        .worktrees()
                        .current_branch(&path)
                        .await
                        .unwrap_or_default();
                    let commit_count = self
                        .inner
                        .orchestrator
                        .worktrees()
                        .commit_count(&path, "main")
                        .await
                        .unwrap_or(0);

                    return Ok((
                        TaskWorktree {
                            task_id: task.id.clone(),
                            instance_id,
                            path,
                            branch,
                            commit_count,
                        },
                        file,
                    ));
                }
                Ok(file) => {
                    last_failure = format!("worker reported {:?}", file.status);
                }
                Err(e) => {
                    last_failure = e.to_string();
                }
            }

            self.retire_worker(&instance_id).await;
            warn!(
                "Task {} attempt {}/{} failed: {}",
                task.id,
                attempt + 1,
                attempts,
                last_failure
            );
        }

        bail!(
            "Task {} failed after {} attempts: {}",
            task.id,
            attempts,
            last_failure
        )
    }

    // --- synthesis & revision --------------------------------------------

    async fn synthesis_phase(&self, round: u32) -> Result<SynthesisCompletionFile> {
        let summary = {
            let completions = self.inner.completions.read().await;
            let mut lines = Vec::new();
            for completion in completions.values() {
                lines.push(format!(
                    "- {}: {} (files: {})",
                    completion.task_id,
                    completion.summary,
                    completion.files_modified.join(", ")
                ));
            }
            lines.sort();
            lines.join("\n")
        };

        let prompt = prompts::synthesis_prompt(&summary, round);
        // The label carries the round so each pass gets a distinct branch
        let (instance_id, worktree) = self
            .spawn_prompted_worker(&format!("ultraplan: synthesis round {}", round), &prompt)
            .await?;
        let synthesis: SynthesisCompletionFile = self
            .wait_for_sentinel(&instance_id, &worktree, SYNTHESIS_COMPLETION_FILE)
            .await?;
        self.retire_worker(&instance_id).await;

        {
            let mut session = self.inner.session.write().await;
            session.revision.round = round;
            session.revision.open_issues = synthesis.issues_found.clone();
            session.revision.tasks_to_revise = synthesis.tasks_affected.clone();
        }

        info!(
            "Synthesis round {}: {:?}, {} issues",
            round,
            synthesis.status,
            synthesis.issues_found.len()
        );
        Ok(synthesis)
    }

    /// Spawns one revision worker per affected task, inside that task's
    /// original worktree. Rounds never overlap.
    async fn revision_phase(&self, synthesis: &SynthesisCompletionFile, round: u32) -> Result<()> {
        let worktrees = {
            let session = self.inner.session.read().await;
            session.task_worktrees.clone()
        };

        let mut workers = JoinSet::new();
        for task_id in &synthesis.tasks_affected {
            let Some(task_worktree) = worktrees.get(task_id) else {
                warn!("Synthesis flagged unknown task {}; skipping", task_id);
                continue;
            };

            let issues: Vec<SynthesisIssue> = synthesis
                .issues_found
                .iter()
                .filter(|issue| &issue.task_id == task_id)
                .cloned()
                .collect();

            let coordinator = self.clone();
            let task_id = task_id.clone();
            let task_worktree = task_worktree.clone();
            workers.spawn(async move {
                coordinator
                    .run_revision(&task_id, &task_worktree, &issues, round)
                    .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let revised: RevisionCompletionFile = joined.context("Revision worker panicked")??;
            let mut session = self.inner.session.write().await;
            session.revision.revised_tasks.push(revised.task_id.clone());
        }

        Ok(())
    }

    async fn run_revision(
        &self,
        task_id: &str,
        task_worktree: &TaskWorktree,
        issues: &[SynthesisIssue],
        round: u32,
    ) -> Result<RevisionCompletionFile> {
        clear_sentinel(&task_worktree.path, REVISION_COMPLETION_FILE).await;

        let prompt = prompts::revision_prompt(task_id, issues, round);
        let instance_id = self
            .inner
            .orchestrator
            .add_instance_to_worktree(
                &format!("revise {}", task_id),
                &task_worktree.path,
                &task_worktree.branch,
            )
            .await?;
        self.start_and_prompt(&instance_id, &prompt).await?;

        let revision = self
            .wait_for_sentinel(&instance_id, &task_worktree.path, REVISION_COMPLETION_FILE)
            .await?;
        self.retire_worker(&instance_id).await;
        Ok(revision)
    }

    // --- consolidation ----------------------------------------------------

    async fn consolidation_phase(
        &self,
        plan: &PlanSpec,
        aggregated: &AggregatedTaskContext,
    ) -> Result<ConsolidationCompletionFile> {
        match self.inner.config.consolidation_mode {
            ConsolidationMode::PerGroup => self.consolidate_per_group(plan, aggregated).await,
            ConsolidationMode::Single => self.consolidate_single(plan, aggregated).await,
        }
    }

    /// Group mode: one deterministic branch per execution layer, each PR
    /// based on the previous group's branch. Groups are strictly ordered.
    async fn consolidate_per_group(
        &self,
        plan: &PlanSpec,
        aggregated: &AggregatedTaskContext,
    ) -> Result<ConsolidationCompletionFile> {
        let layers = plan.execution_layers()?;
        let (prefix, session_id, objective) = self.branch_inputs().await;

        let mut base_branch = "main".to_string();
        let mut carried_issues: Vec<String> = Vec::new();
        let mut group_results = Vec::new();
        let mut prs_created: Vec<CreatedPr> = Vec::new();
        let mut total_commits = 0usize;

        for (index, layer) in layers.iter().enumerate() {
            let group_number = index + 1;
            let branch = group_branch_name(&prefix, &session_id, group_number);

            let group = self
                .consolidate_group(group_number, &branch, &base_branch, layer, &carried_issues)
                .await?;

            carried_issues = group.issues_for_next_group.clone();
            let commit_count = {
                let session = self.inner.session.read().await;
                layer
                    .iter()
                    .filter_map(|id| session.task_worktrees.get(id))
                    .map(|wt| wt.commit_count)
                    .sum::<usize>()
            };
            total_commits += commit_count;

            let success = group.status == ConsolidationStatus::Complete
                && group.verification.overall_success;
            group_results.push(GroupResult {
                group_index: group_number,
                branch_name: branch.clone(),
                tasks_included: group.tasks_consolidated.clone(),
                commit_count,
                success,
            });

            let pr = self
                .open_group_pr(
                    group_number,
                    &branch,
                    &base_branch,
                    layer,
                    plan,
                    &objective,
                    &prs_created,
                    aggregated,
                )
                .await;
            match pr {
                Ok(created) => prs_created.push(created),
                Err(e) => warn!("PR for group {} failed: {}", group_number, e),
            }

            self.inner
                .session
                .write()
                .await
                .group_branches
                .push(branch.clone());
            base_branch = branch;
        }

        let files_changed = {
            let completions = self.inner.completions.read().await;
            let mut files: Vec<String> = Vec::new();
            for completion in completions.values() {
                for file in &completion.files_modified {
                    if !files.contains(file) {
                        files.push(file.clone());
                    }
                }
            }
            files.sort();
            files
        };

        let all_succeeded = group_results.iter().all(|g| g.success);
        Ok(ConsolidationCompletionFile {
            status: if all_succeeded {
                ConsolidationStatus::Complete
            } else {
                ConsolidationStatus::Partial
            },
            mode: "per-group".to_string(),
            group_results,
            prs_created,
            synthesis_context: None,
            total_commits,
            files_changed,
        })
    }

    async fn consolidate_group(
        &self,
        group_number: usize,
        branch: &str,
        base_branch: &str,
        layer: &[String],
        carried_issues: &[String],
    ) -> Result<GroupConsolidationCompletionFile> {
        let task_branches = self.task_branches(layer).await;

        let worktree_path = {
            let session_dir = self.inner.orchestrator.session_dir().await;
            session_dir
                .join("consolidation")
                .join(format!("group-{}", group_number))
        };

        self.inner
            .orchestrator
            .worktrees()
            .create(&worktree_path, branch, Some(base_branch))
            .await
            .context("Failed to create consolidation worktree")?;

        let prompt = prompts::group_consolidation_prompt(
            group_number,
            branch,
            base_branch,
            &task_branches,
            carried_issues,
        );
        let instance_id = self
            .inner
            .orchestrator
            .add_instance_to_worktree(
                &format!("consolidate group {}", group_number),
                &worktree_path,
                branch,
            )
            .await?;
        self.start_and_prompt(&instance_id, &prompt).await?;

        let group = self
            .wait_for_sentinel(&instance_id, &worktree_path, GROUP_CONSOLIDATION_COMPLETION_FILE)
            .await?;
        self.retire_worker(&instance_id).await;
        Ok(group)
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_group_pr(
        &self,
        group_number: usize,
        branch: &str,
        base_branch: &str,
        layer: &[String],
        plan: &PlanSpec,
        objective: &str,
        earlier_prs: &[CreatedPr],
        aggregated: &AggregatedTaskContext,
    ) -> Result<CreatedPr> {
        let tasks = layer
            .iter()
            .filter_map(|id| plan.task(id))
            .map(|task| PrTaskSummary {
                id: task.id.clone(),
                title: task.title.clone(),
            })
            .collect();

        let related_prs = earlier_prs
            .iter()
            .map(|pr| RelatedPr {
                group_index: pr.group_index,
                url: pr.url.clone(),
                title: pr.title.clone(),
            })
            .collect();

        let context = PrContext {
            session_name: objective.to_string(),
            group_name: Some(format!("group {}", group_number)),
            tasks,
            group_diagram: Some(self.group_diagram(plan).await?),
            related_prs,
            aggregated_context: Some(aggregated.to_pr_markdown()),
        };
        let title = PRWorkflowManager::build_title(&context);

        let pr_instance = format!("ultraplan-group-{}", group_number);
        let mut events = self.inner.pr_workflows.subscribe_events();
        self.inner
            .pr_workflows
            .start_workflow(PrRequest {
                instance_id: pr_instance.clone(),
                mode: PrMode::Stacked,
                head_branch: branch.to_string(),
                base_branch: Some(base_branch.to_string()),
                context,
            })
            .await?;

        let url = self.await_pr_event(&mut events, &pr_instance).await?;
        Ok(CreatedPr {
            url,
            title,
            group_index: group_number,
        })
    }

    /// Single mode: every task's commits cherry-picked onto one branch in
    /// execution order, then one PR.
    async fn consolidate_single(
        &self,
        plan: &PlanSpec,
        aggregated: &AggregatedTaskContext,
    ) -> Result<ConsolidationCompletionFile> {
        let (prefix, session_id, objective) = self.branch_inputs().await;
        let branch = single_branch_name(&prefix, &session_id);

        let ordered = self.ordered_task_ids(plan);
        let task_branches = self.task_branches(&ordered).await;

        let worktree_path = {
            let session_dir = self.inner.orchestrator.session_dir().await;
            session_dir.join("consolidation").join("single")
        };
        self.inner
            .orchestrator
            .worktrees()
            .create(&worktree_path, &branch, Some("main"))
            .await
            .context("Failed to create consolidation worktree")?;

        let prompt = prompts::consolidation_prompt(&branch, &task_branches);
        let instance_id = self
            .inner
            .orchestrator
            .add_instance_to_worktree("consolidate", &worktree_path, &branch)
            .await?;
        self.start_and_prompt(&instance_id, &prompt).await?;

        let mut consolidation: ConsolidationCompletionFile = self
            .wait_for_sentinel(&instance_id, &worktree_path, CONSOLIDATION_COMPLETION_FILE)
            .await?;
        self.retire_worker(&instance_id).await;

        self.inner
            .session
            .write()
            .await
            .group_branches
            .push(branch.clone());

        if consolidation.prs_created.is_empty() {
            let tasks = ordered
                .iter()
                .filter_map(|id| plan.task(id))
                .map(|task| PrTaskSummary {
                    id: task.id.clone(),
                    title: task.title.clone(),
                })
                .collect();

            let context = PrContext {
                session_name: objective.clone(),
                group_name: None,
                tasks,
                group_diagram: None,
                related_prs: Vec::new(),
                aggregated_context: Some(aggregated.to_pr_markdown()),
            };
            let title = PRWorkflowManager::build_title(&context);

            let mut events = self.inner.pr_workflows.subscribe_events();
            self.inner
                .pr_workflows
                .start_workflow(PrRequest {
                    instance_id: "ultraplan-single".to_string(),
                    mode: PrMode::Single,
                    head_branch: branch.clone(),
                    base_branch: Some("main".to_string()),
                    context,
                })
                .await?;

            match self.await_pr_event(&mut events, "ultraplan-single").await {
                Ok(url) => consolidation.prs_created.push(CreatedPr {
                    url,
                    title,
                    group_index: 0,
                }),
                Err(e) => warn!("Single consolidation PR failed: {}", e),
            }
        }

        Ok(consolidation)
    }

    // --- shared plumbing --------------------------------------------------

    async fn branch_inputs(&self) -> (String, String, String) {
        let session = self.inner.session.read().await;
        let prefix = self
            .inner
            .orchestrator
            .config()
            .pr
            .branch_prefix
            .clone();
        (prefix, session.id.clone(), session.objective.clone())
    }

    fn ordered_task_ids(&self, plan: &PlanSpec) -> Vec<String> {
        plan.execution_layers()
            .map(|layers| layers.into_iter().flatten().collect())
            .unwrap_or_default()
    }

    async fn task_branches(&self, task_ids: &[String]) -> Vec<(String, String)> {
        let session = self.inner.session.read().await;
        task_ids
            .iter()
            .filter_map(|id| {
                session
                    .task_worktrees
                    .get(id)
                    .map(|wt| (id.clone(), wt.branch.clone()))
            })
            .collect()
    }

    /// ASCII sketch of the layer chain for PR bodies.
    async fn group_diagram(&self, plan: &PlanSpec) -> Result<String> {
        let layers = plan.execution_layers()?;
        let mut out = String::from("main");
        for (index, layer) in layers.iter().enumerate() {
            out.push_str(&format!(
                "\n  -> group {} [{}]",
                index + 1,
                layer.join(", ")
            ));
        }
        Ok(out)
    }

    async fn spawn_prompted_worker(&self, label: &str, prompt: &str) -> Result<(String, PathBuf)> {
        let instance_id = self.inner.orchestrator.add_instance(label).await?;
        self.start_and_prompt(&instance_id, prompt).await?;

        let instance = self
            .inner
            .orchestrator
            .get_instance(&instance_id)
            .await
            .ok_or_else(|| anyhow!("Instance {} vanished after add", instance_id))?;
        Ok((instance_id, instance.worktree_path))
    }

    async fn start_and_prompt(&self, instance_id: &str, prompt: &str) -> Result<()> {
        self.inner.orchestrator.start_instance(instance_id).await?;
        if let Some(manager) = self
            .inner
            .orchestrator
            .get_instance_manager(instance_id)
            .await
        {
            manager.send_input(prompt).await?;
        }
        Ok(())
    }

    /// Stops a worker whose sentinel has been consumed. Best effort.
    async fn retire_worker(&self, instance_id: &str) {
        if let Err(e) = self.inner.orchestrator.stop_instance(instance_id).await {
            warn!("Failed to stop worker {}: {}", instance_id, e);
        }
    }

    /// Polls for a sentinel file at the configured cadence, checking
    /// cancellation every iteration. A worker that dies without writing the
    /// file fails the wait; a worker that exits cleanly gets a short grace
    /// window for the final rename to land.
    async fn wait_for_sentinel<T: DeserializeOwned>(
        &self,
        instance_id: &str,
        worktree: &Path,
        file_name: &str,
    ) -> Result<T> {
        let path = worktree.join(file_name);
        let mut grace_polls = 3u32;

        loop {
            if self.inner.cancel.is_cancelled() {
                bail!("Cancelled while waiting for {}", file_name);
            }

            if path.exists() {
                return read_json_retry(&path, 5, Duration::from_millis(200))
                    .await
                    .with_context(|| format!("Invalid completion payload in {}", file_name));
            }

            let status = match self.inner.orchestrator.get_instance(instance_id).await {
                Some(instance) => instance.status,
                None => bail!("Worker {} disappeared before writing {}", instance_id, file_name),
            };

            match status {
                Status::Stuck | Status::Timeout | Status::Error => {
                    bail!(
                        "Worker {} ended in {} without writing {}",
                        instance_id,
                        status,
                        file_name
                    );
                }
                Status::Completed => {
                    if grace_polls == 0 {
                        bail!(
                            "Worker {} completed without writing {}",
                            instance_id,
                            file_name
                        );
                    }
                    grace_polls -= 1;
                }
                _ => {}
            }

            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    async fn await_pr_event(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<PrEvent>,
        instance_id: &str,
    ) -> Result<String> {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => bail!("Cancelled while waiting for PR"),
                event = events.recv() => {
                    match event {
                        Ok(PrEvent::Completed { instance_id: id, success, url }) if id == instance_id => {
                            return if success {
                                url.ok_or_else(|| anyhow!("PR workflow reported no URL"))
                            } else {
                                Err(anyhow!("PR workflow for {} failed", instance_id))
                            };
                        }
                        Ok(_) => continue,
                        Err(e) => bail!("PR event bus closed: {}", e),
                    }
                }
            }
        }
    }
}

/// Pulls the `<plan_decision>` block out of the manager's output.
fn extract_plan_decision(output: &str) -> Option<String> {
    let re = Regex::new(r"(?s)<plan_decision>(.*?)</plan_decision>").ok()?;
    re.captures(output)
        .map(|captures| captures[1].trim().to_string())
}

/// Deletes a stale sentinel so a fresh worker's write is unambiguous.
async fn clear_sentinel(worktree: &Path, file_name: &str) {
    let path = worktree.join(file_name);
    if path.exists() {
        let _ = tokio::fs::remove_file(&path).await;
    }
}
