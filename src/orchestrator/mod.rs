//! Registry and policy: owns every InstanceManager in a session, fans out
//! callbacks, enforces budget limits, and persists session state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClaudioConfig;
use crate::conflict::ConflictDetector;
use crate::instance::metrics::Metrics;
use crate::instance::{Instance, InstanceCallbacks, InstanceManager, Status, TimeoutKind};
use crate::persistence::SessionState;
use crate::tmux::TerminalBackend;
use crate::utils::slugify;
use crate::worktree::WorktreeBackend;

/// Distinguished orchestrator failures callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Branch '{0}' already exists in this session")]
    BranchExists(String),

    #[error("Worktree for instance {0} has uncommitted changes; use force to remove anyway")]
    DirtyWorktree(String),
}

/// Session-level notifications, fired outside all locks.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Completion(String),
    WaitingInput(String),
    BudgetLimit,
    BudgetWarning,
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Completion(_) => "on_completion",
            Notification::WaitingInput(_) => "on_waiting_input",
            Notification::BudgetLimit => "on_budget_limit",
            Notification::BudgetWarning => "on_budget_warning",
        }
    }
}

pub type PrCompleteCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;
pub type PrOpenedCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type TimeoutNotifyCallback = Arc<dyn Fn(&str, TimeoutKind) + Send + Sync>;
pub type BellNotifyCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// User-registered hooks. Each is cloned out before invocation.
#[derive(Default)]
struct OrchestratorCallbacks {
    on_pr_complete: Option<PrCompleteCallback>,
    on_pr_opened: Option<PrOpenedCallback>,
    on_timeout: Option<TimeoutNotifyCallback>,
    on_bell: Option<BellNotifyCallback>,
    on_notification: Option<NotificationCallback>,
}

/// One-shot latches for budget notifications.
#[derive(Default)]
struct BudgetFlags {
    limit_fired: bool,
    warning_fired: bool,
}

struct OrchestratorState {
    session: SessionState,
    managers: HashMap<String, Arc<InstanceManager>>,
}

struct OrchestratorInner {
    state: RwLock<OrchestratorState>,
    callbacks: RwLock<OrchestratorCallbacks>,
    budget: Mutex<BudgetFlags>,
    terminal: Arc<dyn TerminalBackend>,
    worktrees: Arc<dyn WorktreeBackend>,
    conflicts: ConflictDetector,
    config: ClaudioConfig,
    pr_workflows: RwLock<Option<Arc<crate::pr::PRWorkflowManager>>>,
}

/// Registry of instance managers for one session.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Creates a fresh session rooted at `base_repo` and persists it.
    pub async fn new(
        name: &str,
        base_repo: PathBuf,
        config: ClaudioConfig,
        terminal: Arc<dyn TerminalBackend>,
        worktrees: Arc<dyn WorktreeBackend>,
    ) -> Result<Self> {
        let session = SessionState::new(name.to_string(), base_repo, config.clone());
        tokio::fs::create_dir_all(session.session_dir())
            .await
            .context("Failed to create session directory")?;
        session.save().await?;

        info!("Created session {} ({})", session.name, session.id);

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                state: RwLock::new(OrchestratorState {
                    session,
                    managers: HashMap::new(),
                }),
                callbacks: RwLock::new(OrchestratorCallbacks::default()),
                budget: Mutex::new(BudgetFlags::default()),
                conflicts: ConflictDetector::new(worktrees.clone()),
                terminal,
                worktrees,
                config,
                pr_workflows: RwLock::new(None),
            }),
        })
    }

    /// Rehydrates an orchestrator from a persisted session. Managers are
    /// recreated; call [`Orchestrator::reconnect_instance`] per instance to
    /// reattach to surviving tmux sessions.
    pub async fn from_state(
        session: SessionState,
        terminal: Arc<dyn TerminalBackend>,
        worktrees: Arc<dyn WorktreeBackend>,
    ) -> Result<Self> {
        let config = session.config.clone();
        let orchestrator = Self {
            inner: Arc::new(OrchestratorInner {
                state: RwLock::new(OrchestratorState {
                    session,
                    managers: HashMap::new(),
                }),
                callbacks: RwLock::new(OrchestratorCallbacks::default()),
                budget: Mutex::new(BudgetFlags::default()),
                conflicts: ConflictDetector::new(worktrees.clone()),
                terminal,
                worktrees,
                config,
                pr_workflows: RwLock::new(None),
            }),
        };

        let instances = {
            let state = orchestrator.inner.state.read().await;
            state.session.instances.clone()
        };
        for instance in instances {
            let manager = InstanceManager::new(
                instance.clone(),
                orchestrator.inner.terminal.clone(),
                orchestrator.inner.config.instance.clone(),
                orchestrator.inner.config.pricing.clone(),
            );
            orchestrator
                .inner
                .state
                .write()
                .await
                .managers
                .insert(instance.id.clone(), Arc::new(manager));
        }

        Ok(orchestrator)
    }

    pub async fn session_id(&self) -> String {
        self.inner.state.read().await.session.id.clone()
    }

    pub async fn session_name(&self) -> String {
        self.inner.state.read().await.session.name.clone()
    }

    pub async fn session_dir(&self) -> PathBuf {
        self.inner.state.read().await.session.session_dir()
    }

    pub fn config(&self) -> &ClaudioConfig {
        &self.inner.config
    }

    // --- callback registration -------------------------------------------

    pub async fn set_pr_complete_callback(&self, callback: PrCompleteCallback) {
        self.inner.callbacks.write().await.on_pr_complete = Some(callback);
    }

    pub async fn clear_pr_complete_callback(&self) {
        self.inner.callbacks.write().await.on_pr_complete = None;
    }

    pub async fn set_pr_opened_callback(&self, callback: PrOpenedCallback) {
        self.inner.callbacks.write().await.on_pr_opened = Some(callback);
    }

    pub async fn clear_pr_opened_callback(&self) {
        self.inner.callbacks.write().await.on_pr_opened = None;
    }

    pub async fn set_timeout_callback(&self, callback: TimeoutNotifyCallback) {
        self.inner.callbacks.write().await.on_timeout = Some(callback);
    }

    pub async fn clear_timeout_callback(&self) {
        self.inner.callbacks.write().await.on_timeout = None;
    }

    pub async fn set_bell_callback(&self, callback: BellNotifyCallback) {
        self.inner.callbacks.write().await.on_bell = Some(callback);
    }

    pub async fn clear_bell_callback(&self) {
        self.inner.callbacks.write().await.on_bell = None;
    }

    pub async fn set_notification_callback(&self, callback: NotificationCallback) {
        self.inner.callbacks.write().await.on_notification = Some(callback);
    }

    pub async fn clear_notification_callback(&self) {
        self.inner.callbacks.write().await.on_notification = None;
    }

    /// Registers the PR workflow manager: its completions feed the
    /// orchestrator's `PRComplete` hook, and instance removal halts any
    /// workflow still in flight.
    pub async fn attach_pr_workflows(&self, workflows: Arc<crate::pr::PRWorkflowManager>) {
        let weak = Arc::downgrade(&self.inner);
        workflows
            .set_complete_callback(Arc::new(move |instance_id: &str, success: bool| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let instance_id = instance_id.to_string();
                tokio::spawn(async move {
                    let callback = inner.callbacks.read().await.on_pr_complete.clone();
                    if let Some(callback) = callback {
                        callback(&instance_id, success);
                    }
                });
            }))
            .await;

        *self.inner.pr_workflows.write().await = Some(workflows);
    }

    // --- instance lifecycle ----------------------------------------------

    /// Adds an instance on a fresh worktree branched from HEAD.
    pub async fn add_instance(&self, task: &str) -> Result<String> {
        self.add_instance_inner(task, None).await
    }

    /// Adds an instance branched from an explicit base branch.
    pub async fn add_instance_from_branch(&self, task: &str, base_branch: &str) -> Result<String> {
        self.add_instance_inner(task, Some(base_branch.to_string()))
            .await
    }

    async fn add_instance_inner(&self, task: &str, base_branch: Option<String>) -> Result<String> {
        let instance_id = Uuid::new_v4().to_string();
        let short_id = &instance_id[..8];

        let (branch, worktree_path) = {
            let state = self.inner.state.read().await;
            let slug = slugify(task);
            let branch = format!(
                "{}/{}/{}",
                self.inner.config.pr.branch_prefix,
                &state.session.id[..8],
                slug
            );
            if state.session.instances.iter().any(|i| i.branch == branch) {
                return Err(OrchestratorError::BranchExists(branch).into());
            }
            let worktree_path = state
                .session
                .worktree_root
                .join(format!("{}-{}", short_id, slug));
            (branch, worktree_path)
        };

        self.inner
            .worktrees
            .create(&worktree_path, &branch, base_branch.as_deref())
            .await
            .context("Failed to create worktree")?;

        self.register_instance(instance_id.clone(), task, branch, worktree_path)
            .await?;
        Ok(instance_id)
    }

    /// Adds an instance into an existing worktree on an existing branch,
    /// the path revision workers take.
    pub async fn add_instance_to_worktree(
        &self,
        task: &str,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<String> {
        if !worktree_path.exists() {
            return Err(anyhow!(
                "Worktree {} does not exist",
                worktree_path.display()
            ));
        }

        let instance_id = Uuid::new_v4().to_string();
        self.register_instance(
            instance_id.clone(),
            task,
            branch.to_string(),
            worktree_path.to_path_buf(),
        )
        .await?;
        Ok(instance_id)
    }

    async fn register_instance(
        &self,
        instance_id: String,
        task: &str,
        branch: String,
        worktree_path: PathBuf,
    ) -> Result<()> {
        let tmux_session = format!("claudio-{}", &instance_id[..8]);
        let instance = Instance::new(
            instance_id.clone(),
            task.to_string(),
            branch,
            worktree_path.clone(),
            tmux_session,
        );

        // Advisory only: a failed registration must not block the add
        if let Err(e) = self
            .inner
            .conflicts
            .register(&instance_id, worktree_path.clone())
        {
            warn!("Conflict detector registration failed: {}", e);
        }

        let manager = Arc::new(InstanceManager::new(
            instance.clone(),
            self.inner.terminal.clone(),
            self.inner.config.instance.clone(),
            self.inner.config.pricing.clone(),
        ));

        {
            let mut state = self.inner.state.write().await;
            state.session.instances.push(instance);
            state.managers.insert(instance_id.clone(), manager);
        }

        self.refresh_shared_context().await;
        self.persist().await?;

        info!("Added instance {} for task: {}", instance_id, task);
        Ok(())
    }

    /// Wires callbacks and spawns the worker.
    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let manager = self.manager(instance_id).await?;
        manager
            .set_callbacks(self.build_instance_callbacks())
            .await;
        manager.start().await?;
        self.persist().await?;
        Ok(())
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let manager = self.manager(instance_id).await?;
        manager.stop().await?;
        self.persist().await?;
        Ok(())
    }

    pub async fn pause_instance(&self, instance_id: &str) -> Result<()> {
        let manager = self.manager(instance_id).await?;
        manager.pause().await?;
        self.persist().await?;
        Ok(())
    }

    pub async fn resume_instance(&self, instance_id: &str) -> Result<()> {
        let manager = self.manager(instance_id).await?;
        manager.resume().await?;
        self.persist().await?;
        Ok(())
    }

    /// Reattaches to a surviving session or respawns the worker.
    pub async fn reconnect_instance(&self, instance_id: &str) -> Result<()> {
        let manager = self.manager(instance_id).await?;
        manager
            .set_callbacks(self.build_instance_callbacks())
            .await;
        manager.reconnect().await?;
        self.persist().await?;
        Ok(())
    }

    /// Removes an instance, its worktree, and its branch.
    ///
    /// Without `force`, a dirty worktree aborts the removal with
    /// [`OrchestratorError::DirtyWorktree`]. Worktree and branch removal
    /// failures are logged and otherwise ignored.
    pub async fn remove_instance(&self, instance_id: &str, force: bool) -> Result<()> {
        let manager = self.manager(instance_id).await?;
        let instance = manager.snapshot().await;

        if !force {
            match self.inner.worktrees.is_dirty(&instance.worktree_path).await {
                Ok(true) => {
                    return Err(OrchestratorError::DirtyWorktree(instance_id.to_string()).into())
                }
                Ok(false) => {}
                Err(e) => debug!("Dirty check failed for {}: {}", instance_id, e),
            }
        }

        if let Err(e) = manager.stop().await {
            warn!("Failed to stop instance {}: {}", instance_id, e);
        }

        self.inner.conflicts.unregister(instance_id);

        if let Some(workflows) = self.inner.pr_workflows.read().await.clone() {
            workflows.stop(instance_id).await;
        }

        if let Err(e) = self
            .inner
            .worktrees
            .remove(&instance.worktree_path, true)
            .await
        {
            warn!("Failed to remove worktree: {}", e);
        }
        if let Err(e) = self.inner.worktrees.delete_branch(&instance.branch).await {
            warn!("Failed to delete branch: {}", e);
        }

        {
            let mut state = self.inner.state.write().await;
            state.managers.remove(instance_id);
            state.session.instances.retain(|i| i.id != instance_id);
        }

        self.refresh_shared_context().await;
        self.persist().await?;

        info!("Removed instance {}", instance_id);
        Ok(())
    }

    /// Drops every instance that reached a terminal state from the
    /// registry. Worktrees and branches are left in place; the work product
    /// outlives the supervisor entry.
    pub async fn clear_completed_instances(&self) -> Result<Vec<String>> {
        let candidates: Vec<String> = {
            let state = self.inner.state.read().await;
            let mut ids = Vec::new();
            for (id, manager) in &state.managers {
                if manager.status().await.is_terminal() {
                    ids.push(id.clone());
                }
            }
            ids
        };

        {
            let mut state = self.inner.state.write().await;
            for id in &candidates {
                state.managers.remove(id);
                state.session.instances.retain(|i| &i.id != id);
                self.inner.conflicts.unregister(id);
            }
        }

        if let Some(workflows) = self.inner.pr_workflows.read().await.clone() {
            for id in &candidates {
                workflows.stop(id).await;
            }
        }

        if !candidates.is_empty() {
            self.refresh_shared_context().await;
            self.persist().await?;
        }
        Ok(candidates)
    }

    // --- introspection ----------------------------------------------------

    pub async fn get_instance(&self, instance_id: &str) -> Option<Instance> {
        let manager = {
            let state = self.inner.state.read().await;
            state.managers.get(instance_id).cloned()
        };
        match manager {
            Some(manager) => Some(manager.snapshot().await),
            None => None,
        }
    }

    pub async fn get_instance_manager(&self, instance_id: &str) -> Option<Arc<InstanceManager>> {
        self.inner.state.read().await.managers.get(instance_id).cloned()
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        let managers: Vec<Arc<InstanceManager>> = {
            let state = self.inner.state.read().await;
            state
                .session
                .instances
                .iter()
                .filter_map(|i| state.managers.get(&i.id).cloned())
                .collect()
        };

        let mut instances = Vec::with_capacity(managers.len());
        for manager in managers {
            instances.push(manager.snapshot().await);
        }
        instances
    }

    pub async fn get_instance_metrics(&self, instance_id: &str) -> Option<Metrics> {
        match self.get_instance_manager(instance_id).await {
            Some(manager) => Some(manager.metrics().await),
            None => None,
        }
    }

    /// Componentwise sum of every instance's metrics.
    pub async fn get_session_metrics(&self) -> Metrics {
        let mut total = Metrics::default();
        for instance in self.list_instances().await {
            total.add(&instance.metrics);
        }
        total
    }

    pub async fn get_instance_diff(&self, instance_id: &str) -> Result<String> {
        let instance = self
            .get_instance(instance_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.to_string()))?;
        Ok(self.inner.worktrees.diff(&instance.worktree_path).await?)
    }

    pub fn conflicts(&self) -> &ConflictDetector {
        &self.inner.conflicts
    }

    pub fn worktrees(&self) -> Arc<dyn WorktreeBackend> {
        self.inner.worktrees.clone()
    }

    /// Spawns the advisory conflict scan loop. Findings surface through the
    /// detector's callback and the log; nothing is ever blocked on them.
    pub fn spawn_conflict_watcher(
        &self,
        interval: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) {
        let inner = self.inner.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                inner.conflicts.scan().await;
            }
        });
    }

    // --- internals --------------------------------------------------------

    async fn manager(&self, instance_id: &str) -> Result<Arc<InstanceManager>> {
        self.inner
            .state
            .read()
            .await
            .managers
            .get(instance_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.to_string()).into())
    }

    /// Builds the per-instance hooks that bridge into orchestrator-level
    /// notifications and budget enforcement. Hooks hold only a weak
    /// reference, so a dropped orchestrator does not linger behind its
    /// managers.
    fn build_instance_callbacks(&self) -> InstanceCallbacks {
        let weak = Arc::downgrade(&self.inner);

        let state_weak = weak.clone();
        let on_state = Arc::new(move |instance_id: &str, status: Status| {
            let Some(inner) = state_weak.upgrade() else {
                return;
            };
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                let notification = match status {
                    Status::Completed => Some(Notification::Completion(instance_id.clone())),
                    Status::WaitingInput => Some(Notification::WaitingInput(instance_id.clone())),
                    _ => None,
                };
                if let Some(notification) = notification {
                    Self::fire_notification(&inner, notification).await;
                }
                if let Err(e) = Self::persist_inner(&inner).await {
                    debug!("Persist after state change failed: {}", e);
                }
            });
        });

        let metrics_weak = weak.clone();
        let on_metrics = Arc::new(move |instance_id: &str, _metrics: &Metrics| {
            let Some(inner) = metrics_weak.upgrade() else {
                return;
            };
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                Self::enforce_budget(&inner, &instance_id).await;
            });
        });

        let timeout_weak = weak.clone();
        let on_timeout = Arc::new(move |instance_id: &str, kind: TimeoutKind| {
            let Some(inner) = timeout_weak.upgrade() else {
                return;
            };
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                let callback = inner.callbacks.read().await.on_timeout.clone();
                if let Some(callback) = callback {
                    callback(&instance_id, kind);
                }
            });
        });

        let bell_weak = weak.clone();
        let on_bell = Arc::new(move |instance_id: &str| {
            let Some(inner) = bell_weak.upgrade() else {
                return;
            };
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                let callback = inner.callbacks.read().await.on_bell.clone();
                if let Some(callback) = callback {
                    callback(&instance_id);
                }
            });
        });

        let pr_weak = weak;
        let on_pr_opened = Arc::new(move |instance_id: &str, _url: &str| {
            let Some(inner) = pr_weak.upgrade() else {
                return;
            };
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                let callback = inner.callbacks.read().await.on_pr_opened.clone();
                if let Some(callback) = callback {
                    callback(&instance_id);
                }
            });
        });

        InstanceCallbacks {
            on_state: Some(on_state),
            on_metrics: Some(on_metrics),
            on_timeout: Some(on_timeout),
            on_bell: Some(on_bell),
            on_pr_opened: Some(on_pr_opened),
        }
    }

    async fn fire_notification(inner: &Arc<OrchestratorInner>, notification: Notification) {
        debug!("Notification: {}", notification.name());
        let callback = inner.callbacks.read().await.on_notification.clone();
        if let Some(callback) = callback {
            callback(&notification);
        }
    }

    /// Budget policy, run on every metrics update.
    ///
    /// Breaching the session cost limit pauses every working instance and
    /// fires `on_budget_limit` exactly once. The warning threshold fires
    /// `on_budget_warning` once. An instance over its token limit is paused
    /// individually. Instances are paused, never killed.
    async fn enforce_budget(inner: &Arc<OrchestratorInner>, instance_id: &str) {
        let resources = &inner.config.resources;

        let managers: Vec<(String, Arc<InstanceManager>)> = {
            let state = inner.state.read().await;
            state
                .managers
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect()
        };

        let mut total_cost = 0.0;
        for (_, manager) in &managers {
            total_cost += manager.metrics().await.cost;
        }

        if resources.cost_limit > 0.0 && total_cost >= resources.cost_limit {
            let fire = {
                let mut flags = inner.budget.lock().await;
                let fire = !flags.limit_fired;
                flags.limit_fired = true;
                fire
            };

            for (id, manager) in &managers {
                if manager.status().await == Status::Working {
                    if let Err(e) = manager.pause().await {
                        warn!("Budget pause failed for {}: {}", id, e);
                    }
                }
            }

            if fire {
                error!(
                    "Session cost ${:.2} reached limit ${:.2}; pausing all working instances",
                    total_cost, resources.cost_limit
                );
                Self::fire_notification(inner, Notification::BudgetLimit).await;
            }
            return;
        }

        if resources.cost_warning_threshold > 0.0 && total_cost >= resources.cost_warning_threshold
        {
            let fire = {
                let mut flags = inner.budget.lock().await;
                let fire = !flags.warning_fired;
                flags.warning_fired = true;
                fire
            };
            if fire {
                warn!(
                    "Session cost ${:.2} passed warning threshold ${:.2}",
                    total_cost, resources.cost_warning_threshold
                );
                Self::fire_notification(inner, Notification::BudgetWarning).await;
            }
        }

        if resources.token_limit_per_instance > 0 {
            if let Some(manager) = managers
                .iter()
                .find(|(id, _)| id == instance_id)
                .map(|(_, m)| m.clone())
            {
                let metrics = manager.metrics().await;
                if metrics.total_tokens() >= resources.token_limit_per_instance
                    && manager.status().await == Status::Working
                {
                    warn!(
                        "Instance {} passed token limit ({} tokens); pausing",
                        instance_id,
                        metrics.total_tokens()
                    );
                    if let Err(e) = manager.pause().await {
                        warn!("Token-limit pause failed for {}: {}", instance_id, e);
                    }
                }
            }
        }
    }

    /// Writes a roster of active instances into the session directory so
    /// workers can see their peers.
    async fn refresh_shared_context(&self) {
        let (dir, lines) = {
            let state = self.inner.state.read().await;
            let lines: Vec<String> = state
                .session
                .instances
                .iter()
                .map(|i| format!("- `{}` on `{}`: {}", &i.id[..8], i.branch, i.task))
                .collect();
            (state.session.session_dir(), lines)
        };

        let mut content = String::from("# Active instances\n\n");
        if lines.is_empty() {
            content.push_str("None.\n");
        } else {
            content.push_str(&lines.join("\n"));
            content.push('\n');
        }

        if let Err(e) = tokio::fs::write(dir.join("context.md"), content).await {
            debug!("Shared context refresh failed: {}", e);
        }
    }

    /// Syncs manager snapshots into the session record and writes it out.
    async fn persist(&self) -> Result<()> {
        Self::persist_inner(&self.inner).await
    }

    async fn persist_inner(inner: &Arc<OrchestratorInner>) -> Result<()> {
        let snapshot = {
            let state = inner.state.read().await;
            let mut pairs = Vec::new();
            for instance in &state.session.instances {
                if let Some(manager) = state.managers.get(&instance.id) {
                    pairs.push(manager.snapshot().await);
                }
            }
            pairs
        };

        let session = {
            let mut state = inner.state.write().await;
            for snap in snapshot {
                if let Some(record) = state.session.instance_mut(&snap.id) {
                    *record = snap;
                }
            }
            state.session.clone()
        };

        session.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_names() {
        assert_eq!(
            Notification::Completion("x".into()).name(),
            "on_completion"
        );
        assert_eq!(
            Notification::WaitingInput("x".into()).name(),
            "on_waiting_input"
        );
        assert_eq!(Notification::BudgetLimit.name(), "on_budget_limit");
        assert_eq!(Notification::BudgetWarning.name(), "on_budget_warning");
    }

    #[test]
    fn test_orchestrator_error_display() {
        let err = OrchestratorError::DirtyWorktree("inst-1".to_string());
        assert!(err.to_string().contains("uncommitted changes"));
    }
}
