//! Pull-request workflows: one background task per instance that formats
//! title and body, then opens the PR through the `gh` CLI.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PrConfig;

/// PR creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrMode {
    /// One PR for one instance's branch.
    Single,
    /// PR based on the previous group's branch, forming a chain.
    Stacked,
    /// One PR carrying several groups' work.
    Consolidated,
}

impl std::fmt::Display for PrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PrMode::Single => "single",
            PrMode::Stacked => "stacked",
            PrMode::Consolidated => "consolidated",
        };
        write!(f, "{}", name)
    }
}

/// A task enclosed in the PR, for the body's task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrTaskSummary {
    pub id: String,
    pub title: String,
}

/// A sibling PR in a stacked chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedPr {
    pub group_index: usize,
    pub url: String,
    pub title: String,
}

/// Everything the title/body builders draw from.
#[derive(Debug, Clone, Default)]
pub struct PrContext {
    pub session_name: String,
    pub group_name: Option<String>,
    pub tasks: Vec<PrTaskSummary>,
    pub group_diagram: Option<String>,
    pub related_prs: Vec<RelatedPr>,
    pub aggregated_context: Option<String>,
}

/// Narrow seam to the AI backend that writes PR prose. Used only when
/// `PR.UseAI` is set; the built-in formatter is the default.
#[async_trait]
pub trait PrTextGenerator: Send + Sync {
    async fn generate_body(&self, context: &PrContext) -> Result<String>;
}

/// Request to open one PR.
#[derive(Debug, Clone)]
pub struct PrRequest {
    pub instance_id: String,
    pub mode: PrMode,
    pub head_branch: String,
    pub base_branch: Option<String>,
    pub context: PrContext,
}

/// Event-bus publication for workflow completion.
#[derive(Debug, Clone)]
pub enum PrEvent {
    Completed {
        instance_id: String,
        success: bool,
        url: Option<String>,
    },
}

pub type PrCompleteCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Drives PR creation for instances, one in-flight workflow per instance.
pub struct PRWorkflowManager {
    repo_path: PathBuf,
    config: PrConfig,
    generator: Option<Arc<dyn PrTextGenerator>>,
    workflows: RwLock<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<PrEvent>,
    on_complete: RwLock<Option<PrCompleteCallback>>,
}

impl PRWorkflowManager {
    pub fn new(repo_path: PathBuf, config: PrConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            repo_path,
            config,
            generator: None,
            workflows: RwLock::new(HashMap::new()),
            events,
            on_complete: RwLock::new(None),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn PrTextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub async fn set_complete_callback(&self, callback: PrCompleteCallback) {
        *self.on_complete.write().await = Some(callback);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PrEvent> {
        self.events.subscribe()
    }

    pub async fn in_flight(&self) -> usize {
        self.workflows.read().await.len()
    }

    /// Builds the PR title from session and group names.
    pub fn build_title(context: &PrContext) -> String {
        match &context.group_name {
            Some(group) => format!("ultraplan: {} [{}]", context.session_name, group),
            None => format!("ultraplan: {}", context.session_name),
        }
    }

    /// Builds the PR body: enclosed tasks, optional group diagram, related
    /// PRs sorted by group id, and any aggregated task context.
    pub fn build_body(context: &PrContext) -> String {
        let mut body = String::new();

        if !context.tasks.is_empty() {
            body.push_str("## Tasks\n\n");
            for task in &context.tasks {
                body.push_str(&format!("- `{}` {}\n", task.id, task.title));
            }
            body.push('\n');
        }

        if let Some(diagram) = &context.group_diagram {
            body.push_str("## Group structure\n\n```\n");
            body.push_str(diagram);
            if !diagram.ends_with('\n') {
                body.push('\n');
            }
            body.push_str("```\n\n");
        }

        if !context.related_prs.is_empty() {
            let mut related = context.related_prs.clone();
            related.sort_by_key(|pr| pr.group_index);

            body.push_str("## Related PRs\n\n");
            for pr in related {
                body.push_str(&format!(
                    "- group {}: [{}]({})\n",
                    pr.group_index, pr.title, pr.url
                ));
            }
            body.push('\n');
        }

        if let Some(aggregated) = &context.aggregated_context {
            body.push_str(aggregated);
            if !aggregated.ends_with('\n') {
                body.push('\n');
            }
        }

        if body.is_empty() {
            body.push_str("Automated pull request.\n");
        }
        body
    }

    /// Spawns the workflow task for one instance. Completion is reported
    /// through the registered callback and the event bus.
    pub async fn start_workflow(self: &Arc<Self>, request: PrRequest) -> Result<()> {
        let instance_id = request.instance_id.clone();

        // Held across the spawn so the task cannot deregister itself before
        // its handle lands in the map
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&instance_id) {
            return Err(anyhow!(
                "PR workflow already running for instance {}",
                instance_id
            ));
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let result = manager.run_workflow(&request).await;
            let (success, url) = match result {
                Ok(url) => {
                    info!("PR opened for {}: {}", request.instance_id, url);
                    (true, Some(url))
                }
                Err(e) => {
                    warn!("PR workflow failed for {}: {}", request.instance_id, e);
                    (false, None)
                }
            };

            manager
                .workflows
                .write()
                .await
                .remove(&request.instance_id);

            let callback = manager.on_complete.read().await.clone();
            if let Some(callback) = callback {
                callback(&request.instance_id, success);
            }
            let _ = manager.events.send(PrEvent::Completed {
                instance_id: request.instance_id.clone(),
                success,
                url,
            });
        });

        workflows.insert(instance_id, handle);
        Ok(())
    }

    async fn run_workflow(&self, request: &PrRequest) -> Result<String> {
        if self.config.auto_rebase {
            if let Some(base) = &request.base_branch {
                self.rebase_branch(&request.head_branch, base).await?;
            }
        }

        let title = Self::build_title(&request.context);
        let body = match (&self.generator, self.config.use_ai) {
            (Some(generator), true) => generator
                .generate_body(&request.context)
                .await
                .unwrap_or_else(|e| {
                    warn!("AI body generation failed, using formatter: {}", e);
                    Self::build_body(&request.context)
                }),
            _ => Self::build_body(&request.context),
        };

        self.create_pr(request, &title, &body).await
    }

    async fn rebase_branch(&self, branch: &str, base: &str) -> Result<()> {
        let output = Command::new("git")
            .args(["rebase", base, branch])
            .current_dir(&self.repo_path)
            .output()
            .await
            .context("Failed to run git rebase")?;

        if !output.status.success() {
            // Leave the branch as it was
            let _ = Command::new("git")
                .args(["rebase", "--abort"])
                .current_dir(&self.repo_path)
                .output()
                .await;
            return Err(anyhow!(
                "Rebase of {} onto {} failed: {}",
                branch,
                base,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(())
    }

    async fn create_pr(&self, request: &PrRequest, title: &str, body: &str) -> Result<String> {
        let mut args = vec![
            "pr".to_string(),
            "create".to_string(),
            "--title".to_string(),
            title.to_string(),
            "--body".to_string(),
            body.to_string(),
            "--head".to_string(),
            request.head_branch.clone(),
        ];
        if let Some(base) = &request.base_branch {
            args.push("--base".to_string());
            args.push(base.clone());
        }
        if self.config.draft {
            args.push("--draft".to_string());
        }

        let output = Command::new("gh")
            .args(&args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .context("Failed to run gh pr create")?;

        if !output.status.success() {
            return Err(anyhow!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .find(|line| line.trim().starts_with("https://"))
            .map(|line| line.trim().to_string())
            .ok_or_else(|| anyhow!("gh pr create returned no URL"))
    }

    /// Halts a single in-flight workflow.
    pub async fn stop(&self, instance_id: &str) {
        if let Some(handle) = self.workflows.write().await.remove(instance_id) {
            handle.abort();
        }
    }

    /// Halts every in-flight workflow.
    pub async fn stop_all(&self) {
        for (_, handle) in self.workflows.write().await.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PrContext {
        PrContext {
            session_name: "rename foo to bar".to_string(),
            group_name: None,
            tasks: vec![
                PrTaskSummary {
                    id: "task-a".to_string(),
                    title: "Rename in core".to_string(),
                },
                PrTaskSummary {
                    id: "task-b".to_string(),
                    title: "Rename in docs".to_string(),
                },
            ],
            group_diagram: None,
            related_prs: Vec::new(),
            aggregated_context: None,
        }
    }

    #[test]
    fn test_title_without_group() {
        assert_eq!(
            PRWorkflowManager::build_title(&context()),
            "ultraplan: rename foo to bar"
        );
    }

    #[test]
    fn test_title_with_group() {
        let mut ctx = context();
        ctx.group_name = Some("group 2".to_string());
        assert_eq!(
            PRWorkflowManager::build_title(&ctx),
            "ultraplan: rename foo to bar [group 2]"
        );
    }

    #[test]
    fn test_body_lists_tasks() {
        let body = PRWorkflowManager::build_body(&context());
        assert!(body.contains("## Tasks"));
        assert!(body.contains("`task-a` Rename in core"));
        assert!(!body.contains("## Related PRs"));
        assert!(!body.contains("## Group structure"));
    }

    #[test]
    fn test_body_sorts_related_prs_by_group() {
        let mut ctx = context();
        ctx.related_prs = vec![
            RelatedPr {
                group_index: 3,
                url: "https://github.com/x/y/pull/3".to_string(),
                title: "third".to_string(),
            },
            RelatedPr {
                group_index: 1,
                url: "https://github.com/x/y/pull/1".to_string(),
                title: "first".to_string(),
            },
        ];

        let body = PRWorkflowManager::build_body(&ctx);
        let first = body.find("group 1").unwrap();
        let third = body.find("group 3").unwrap();
        assert!(first < third);
    }

    #[test]
    fn test_body_includes_diagram_and_context() {
        let mut ctx = context();
        ctx.group_diagram = Some("group-1 -> group-2".to_string());
        ctx.aggregated_context = Some("## Implementation Notes\n\n- note".to_string());

        let body = PRWorkflowManager::build_body(&ctx);
        assert!(body.contains("group-1 -> group-2"));
        assert!(body.contains("## Implementation Notes"));
    }

    #[test]
    fn test_empty_body_fallback() {
        let body = PRWorkflowManager::build_body(&PrContext::default());
        assert_eq!(body, "Automated pull request.\n");
    }
}
