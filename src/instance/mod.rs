//! Single-worker supervision: one instance, one worktree, one terminal
//! session, and the monitor loop that watches all three.

pub mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{InstanceConfig, PriceTable};
use crate::tmux::TerminalBackend;
use metrics::{Metrics, MetricsParser};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Pending,
    Working,
    WaitingInput,
    Paused,
    Completed,
    Stuck,
    Timeout,
    Error,
}

impl Status {
    /// Terminal states absorb: no automatic transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Stuck | Status::Timeout | Status::Error
        )
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: Status) -> bool {
        if *self == next {
            return false;
        }
        match self {
            Status::Pending => matches!(next, Status::Working),
            Status::Working => matches!(
                next,
                Status::WaitingInput
                    | Status::Paused
                    | Status::Completed
                    | Status::Stuck
                    | Status::Timeout
                    | Status::Error
            ),
            Status::WaitingInput => matches!(next, Status::Working | Status::Completed),
            Status::Paused => matches!(next, Status::Working),
            // Terminal states only leave via removal or an explicit reconnect
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Pending => "pending",
            Status::Working => "working",
            Status::WaitingInput => "waiting-input",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Stuck => "stuck",
            Status::Timeout => "timeout",
            Status::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutKind {
    /// No new output for the configured window.
    Activity,
    /// Total lifetime exceeded the configured ceiling.
    Completion,
    /// Output kept moving but no progress signal landed.
    Stale,
}

/// Interaction state detected from a pane capture. PR URL sightings are
/// reported separately through [`OutputMatcher::detect_pr_url`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutputState {
    Completed,
    WaitingInput,
    WaitingQuestion,
    WaitingPermission,
}

/// One worker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub task: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub tmux_session: String,
    pub status: Status,
    pub pid: Option<i32>,
    pub metrics: Metrics,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        id: String,
        task: String,
        branch: String,
        worktree_path: PathBuf,
        tmux_session: String,
    ) -> Self {
        Self {
            id,
            task,
            branch,
            worktree_path,
            tmux_session,
            status: Status::Pending,
            pid: None,
            metrics: Metrics::default(),
            created_at: Utc::now(),
        }
    }
}

/// Pattern set for interpreting a Claude Code pane.
pub struct OutputMatcher {
    working: Regex,
    permission: Regex,
    question: Regex,
    input_box: Regex,
    completed: Regex,
    pr_url: Regex,
}

impl OutputMatcher {
    pub fn new() -> Self {
        Self {
            working: Regex::new(r"esc to interrupt|✻").unwrap(),
            permission: Regex::new(
                r"(?i)do you want to (proceed|make this edit|create|run)|don't ask again",
            )
            .unwrap(),
            question: Regex::new(r"(?i)choose an option|❯ 1\.").unwrap(),
            input_box: Regex::new(r"│\s*>").unwrap(),
            // Prompts instruct workers to print this marker at end of turn
            completed: Regex::new(r"(?i)\bclaudio:done\b").unwrap(),
            pr_url: Regex::new(r"https://github\.com/[\w./-]+/pull/\d+").unwrap(),
        }
    }

    /// Classifies a pane capture. Checked from most to least specific;
    /// anything with the working indicator still visible stays unclassified.
    pub fn detect(&self, output: &str) -> Option<OutputState> {
        if self.completed.is_match(output) {
            return Some(OutputState::Completed);
        }
        if self.permission.is_match(output) {
            return Some(OutputState::WaitingPermission);
        }
        if self.question.is_match(output) {
            return Some(OutputState::WaitingQuestion);
        }
        if !self.working.is_match(output) && self.input_box.is_match(output) {
            return Some(OutputState::WaitingInput);
        }
        None
    }

    /// Extracts a PR URL if one is visible.
    pub fn detect_pr_url(&self, output: &str) -> Option<String> {
        self.pr_url.find(output).map(|m| m.as_str().to_string())
    }
}

impl Default for OutputMatcher {
    fn default() -> Self {
        Self::new()
    }
}

pub type StateCallback = Arc<dyn Fn(&str, Status) + Send + Sync>;
pub type MetricsCallback = Arc<dyn Fn(&str, &Metrics) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn(&str, TimeoutKind) + Send + Sync>;
pub type BellCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type PrOpenedCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Fire-and-forget observer hooks. Every hook is cloned out of the lock
/// before it is invoked.
#[derive(Default, Clone)]
pub struct InstanceCallbacks {
    pub on_state: Option<StateCallback>,
    pub on_metrics: Option<MetricsCallback>,
    pub on_timeout: Option<TimeoutCallback>,
    pub on_bell: Option<BellCallback>,
    pub on_pr_opened: Option<PrOpenedCallback>,
}

/// Scrape bookkeeping between monitor ticks.
struct ScrapeState {
    last_output: String,
    last_change: Instant,
    last_metrics_change: Instant,
    bell_seen: bool,
    pr_reported: bool,
}

impl ScrapeState {
    fn fresh() -> Self {
        let now = Instant::now();
        Self {
            last_output: String::new(),
            last_change: now,
            last_metrics_change: now,
            bell_seen: false,
            pr_reported: false,
        }
    }
}

struct ManagerInner {
    instance: RwLock<Instance>,
    callbacks: RwLock<InstanceCallbacks>,
    terminal: Arc<dyn TerminalBackend>,
    config: InstanceConfig,
    pricing: PriceTable,
    parser: MetricsParser,
    matcher: OutputMatcher,
    scrape: Mutex<ScrapeState>,
    cancel: Mutex<CancellationToken>,
}

/// Supervisor for a single `(worktree, terminal session, command)` triple.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

impl InstanceManager {
    pub fn new(
        instance: Instance,
        terminal: Arc<dyn TerminalBackend>,
        config: InstanceConfig,
        pricing: PriceTable,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                instance: RwLock::new(instance),
                callbacks: RwLock::new(InstanceCallbacks::default()),
                terminal,
                config,
                pricing,
                parser: MetricsParser::new(),
                matcher: OutputMatcher::new(),
                scrape: Mutex::new(ScrapeState::fresh()),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub async fn set_callbacks(&self, callbacks: InstanceCallbacks) {
        *self.inner.callbacks.write().await = callbacks;
    }

    /// Spawns the worker in a detached session and starts the monitor loop.
    pub async fn start(&self) -> Result<()> {
        let (session_name, worktree) = {
            let instance = self.inner.instance.read().await;
            if instance.status != Status::Pending {
                return Err(anyhow!(
                    "Cannot start instance {} in {} state",
                    instance.id,
                    instance.status
                ));
            }
            (instance.tmux_session.clone(), instance.worktree_path.clone())
        };

        self.inner
            .terminal
            .create_session(
                &session_name,
                &worktree,
                &self.inner.config.command,
                self.inner.config.tmux_width,
                self.inner.config.tmux_height,
            )
            .await?;

        let pid = self.inner.terminal.session_pid(&session_name).await.ok().flatten();

        {
            let mut instance = self.inner.instance.write().await;
            instance.pid = pid;
            instance.metrics.started_at = Some(Utc::now());
        }

        self.transition(Status::Working).await;
        self.spawn_monitor().await;
        Ok(())
    }

    /// Kills the terminal session. The instance lands in `completed` unless
    /// it already reached a terminal state.
    pub async fn stop(&self) -> Result<()> {
        self.inner.cancel.lock().await.cancel();

        let session_name = self.inner.instance.read().await.tmux_session.clone();
        if self.inner.terminal.session_exists(&session_name).await {
            self.inner.terminal.kill_session(&session_name).await?;
        }

        let already_terminal = self.inner.instance.read().await.status.is_terminal();
        if !already_terminal {
            self.inner.instance.write().await.metrics.ended_at = Some(Utc::now());
            self.transition(Status::Completed).await;
        }
        Ok(())
    }

    /// Suspends the worker's process group.
    pub async fn pause(&self) -> Result<()> {
        let (id, status, session_name) = {
            let instance = self.inner.instance.read().await;
            (
                instance.id.clone(),
                instance.status,
                instance.tmux_session.clone(),
            )
        };

        if status != Status::Working {
            return Err(anyhow!("Cannot pause instance {} in {} state", id, status));
        }

        self.inner.terminal.suspend_session(&session_name).await?;
        self.transition(Status::Paused).await;
        Ok(())
    }

    /// Continues a suspended worker.
    pub async fn resume(&self) -> Result<()> {
        let (id, status, session_name) = {
            let instance = self.inner.instance.read().await;
            (
                instance.id.clone(),
                instance.status,
                instance.tmux_session.clone(),
            )
        };

        if status != Status::Paused {
            return Err(anyhow!("Cannot resume instance {} in {} state", id, status));
        }

        self.inner.terminal.resume_session(&session_name).await?;

        // The pause gap must not count against the activity timers
        {
            let mut scrape = self.inner.scrape.lock().await;
            let now = Instant::now();
            scrape.last_change = now;
            scrape.last_metrics_change = now;
        }

        self.transition(Status::Working).await;
        Ok(())
    }

    /// Reattaches to a surviving session, or respawns the worker with the
    /// same task if the session is gone. Clears the end time either way.
    pub async fn reconnect(&self) -> Result<()> {
        let session_name = self.inner.instance.read().await.tmux_session.clone();

        if self.inner.terminal.session_exists(&session_name).await {
            let mut instance = self.inner.instance.write().await;
            instance.metrics.ended_at = None;
            instance.status = Status::Working;
        } else {
            let worktree = {
                let mut instance = self.inner.instance.write().await;
                instance.metrics.ended_at = None;
                instance.metrics.started_at = Some(Utc::now());
                instance.status = Status::Working;
                instance.worktree_path.clone()
            };

            self.inner
                .terminal
                .create_session(
                    &session_name,
                    &worktree,
                    &self.inner.config.command,
                    self.inner.config.tmux_width,
                    self.inner.config.tmux_height,
                )
                .await?;

            let pid = self.inner.terminal.session_pid(&session_name).await.ok().flatten();
            self.inner.instance.write().await.pid = pid;
        }

        self.fire_state(Status::Working).await;
        self.spawn_monitor().await;
        Ok(())
    }

    pub async fn tmux_session_exists(&self) -> bool {
        let session_name = self.inner.instance.read().await.tmux_session.clone();
        self.inner.terminal.session_exists(&session_name).await
    }

    pub async fn pid(&self) -> Option<i32> {
        self.inner.instance.read().await.pid
    }

    pub async fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.instance.read().await.metrics.started_at
    }

    pub async fn session_name(&self) -> String {
        self.inner.instance.read().await.tmux_session.clone()
    }

    pub async fn status(&self) -> Status {
        self.inner.instance.read().await.status
    }

    pub async fn snapshot(&self) -> Instance {
        self.inner.instance.read().await.clone()
    }

    pub async fn metrics(&self) -> Metrics {
        self.inner.instance.read().await.metrics.clone()
    }

    /// Sends a line of input to the worker's terminal.
    pub async fn send_input(&self, text: &str) -> Result<()> {
        let session_name = self.inner.instance.read().await.tmux_session.clone();
        self.inner.terminal.send_keys(&session_name, text).await?;
        self.inner.terminal.send_keys(&session_name, "Enter").await?;
        Ok(())
    }

    /// Most recent pane capture seen by the monitor loop.
    pub async fn last_output(&self) -> String {
        self.inner.scrape.lock().await.last_output.clone()
    }

    /// Applies a state-machine transition and fires the state callback.
    /// Invalid transitions are dropped, which is what keeps terminal states
    /// absorbing.
    async fn transition(&self, next: Status) -> bool {
        {
            let mut instance = self.inner.instance.write().await;
            if !instance.status.can_transition_to(next) {
                debug!(
                    "Dropping invalid transition {} -> {} for {}",
                    instance.status, next, instance.id
                );
                return false;
            }
            instance.status = next;
        }

        self.fire_state(next).await;
        true
    }

    async fn fire_state(&self, status: Status) {
        let (id, callback) = {
            let instance = self.inner.instance.read().await;
            let callbacks = self.inner.callbacks.read().await;
            (instance.id.clone(), callbacks.on_state.clone())
        };
        if let Some(callback) = callback {
            callback(&id, status);
        }
    }

    /// Replaces the cancel token and spawns a fresh monitor loop.
    async fn spawn_monitor(&self) {
        let token = CancellationToken::new();
        {
            let mut cancel = self.inner.cancel.lock().await;
            cancel.cancel();
            *cancel = token.clone();
        }
        *self.inner.scrape.lock().await = ScrapeState::fresh();

        let manager = self.clone();
        tokio::spawn(async move {
            manager.monitor_loop(token).await;
        });
    }

    /// Scrape loop: existence probe, bell edge, output diff, metrics parse,
    /// output-state classification, and the three timeout timers.
    async fn monitor_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (id, session_name, status) = {
                let instance = self.inner.instance.read().await;
                (
                    instance.id.clone(),
                    instance.tmux_session.clone(),
                    instance.status,
                )
            };

            if status.is_terminal() {
                break;
            }
            // A stopped process group produces no output worth scraping
            if status == Status::Paused {
                continue;
            }

            if !self.inner.terminal.session_exists(&session_name).await {
                self.inner.instance.write().await.metrics.ended_at = Some(Utc::now());
                self.transition(Status::Completed).await;
                break;
            }

            self.scrape_bell(&id, &session_name).await;

            let output = match self.inner.terminal.capture_output(&session_name).await {
                Ok(output) => output,
                Err(e) => {
                    debug!("Capture failed for {}: {}", id, e);
                    continue;
                }
            };

            let now = Instant::now();
            {
                let mut scrape = self.inner.scrape.lock().await;
                if output != scrape.last_output {
                    scrape.last_change = now;
                    scrape.last_output = output.clone();
                }
            }

            self.scrape_metrics(&id, &output, now).await;
            self.scrape_pr_url(&id, &output).await;

            if let Some(state) = self.inner.matcher.detect(&output) {
                match state {
                    OutputState::Completed => {
                        self.inner.instance.write().await.metrics.ended_at = Some(Utc::now());
                        self.transition(Status::Completed).await;
                        break;
                    }
                    OutputState::WaitingInput
                    | OutputState::WaitingQuestion
                    | OutputState::WaitingPermission => {
                        self.transition(Status::WaitingInput).await;
                    }
                }
            } else if self.status().await == Status::WaitingInput {
                // Prompt cleared: the worker got its input and moved on
                self.transition(Status::Working).await;
            }

            // Timers only apply while nominally working; a prompt waiting
            // on the user is not a hang
            if self.status().await == Status::Working && self.check_timeouts(&id).await {
                break;
            }
        }
    }

    async fn scrape_bell(&self, id: &str, session_name: &str) {
        let Ok(flag) = self.inner.terminal.bell_flag(session_name).await else {
            return;
        };

        let edge = {
            let mut scrape = self.inner.scrape.lock().await;
            let edge = flag && !scrape.bell_seen;
            scrape.bell_seen = flag;
            edge
        };

        if edge {
            let callback = self.inner.callbacks.read().await.on_bell.clone();
            if let Some(callback) = callback {
                callback(id);
            }
        }
    }

    async fn scrape_metrics(&self, id: &str, output: &str, now: Instant) {
        let Some(obs) = self.inner.parser.parse(output) else {
            return;
        };

        let (changed, snapshot) = {
            let mut instance = self.inner.instance.write().await;
            let before = instance.metrics.clone();
            instance.metrics.merge_observation(&obs, &self.inner.pricing);
            (instance.metrics != before, instance.metrics.clone())
        };

        if changed {
            self.inner.scrape.lock().await.last_metrics_change = now;
            let callback = self.inner.callbacks.read().await.on_metrics.clone();
            if let Some(callback) = callback {
                callback(id, &snapshot);
            }
        }
    }

    async fn scrape_pr_url(&self, id: &str, output: &str) {
        let Some(url) = self.inner.matcher.detect_pr_url(output) else {
            return;
        };

        let first_sighting = {
            let mut scrape = self.inner.scrape.lock().await;
            let first = !scrape.pr_reported;
            scrape.pr_reported = true;
            first
        };

        if first_sighting {
            let callback = self.inner.callbacks.read().await.on_pr_opened.clone();
            if let Some(callback) = callback {
                callback(id, &url);
            }
        }
    }

    /// Returns true when a timer fired and the loop should stop.
    async fn check_timeouts(&self, id: &str) -> bool {
        let started_at = self.inner.instance.read().await.metrics.started_at;
        let (last_change, last_metrics_change) = {
            let scrape = self.inner.scrape.lock().await;
            (scrape.last_change, scrape.last_metrics_change)
        };

        let fired = if let Some(started) = started_at {
            let lifetime = (Utc::now() - started)
                .to_std()
                .unwrap_or_default();
            if lifetime > self.inner.config.completion_timeout {
                Some((TimeoutKind::Completion, Status::Timeout))
            } else if last_change.elapsed() > self.inner.config.activity_timeout {
                Some((TimeoutKind::Activity, Status::Stuck))
            } else if last_metrics_change.elapsed() > self.inner.config.stale_timeout {
                Some((TimeoutKind::Stale, Status::Stuck))
            } else {
                None
            }
        } else {
            None
        };

        let Some((kind, status)) = fired else {
            return false;
        };

        warn!("Instance {} hit {:?} timeout", id, kind);
        if !self.transition(status).await {
            return false;
        }

        let callback = self.inner.callbacks.read().await.on_timeout.clone();
        if let Some(callback) = callback {
            callback(id, kind);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [Status::Completed, Status::Stuck, Status::Timeout, Status::Error] {
            assert!(terminal.is_terminal());
            for next in [
                Status::Pending,
                Status::Working,
                Status::WaitingInput,
                Status::Paused,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(Status::Pending.can_transition_to(Status::Working));
        assert!(!Status::Pending.can_transition_to(Status::Completed));

        assert!(Status::Working.can_transition_to(Status::WaitingInput));
        assert!(Status::Working.can_transition_to(Status::Paused));
        assert!(Status::Working.can_transition_to(Status::Stuck));

        assert!(Status::WaitingInput.can_transition_to(Status::Working));
        assert!(Status::WaitingInput.can_transition_to(Status::Completed));
        assert!(!Status::WaitingInput.can_transition_to(Status::Paused));

        assert!(Status::Paused.can_transition_to(Status::Working));
        assert!(!Status::Paused.can_transition_to(Status::Completed));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::WaitingInput.to_string(), "waiting-input");
        assert_eq!(Status::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_output_matcher_permission_prompt() {
        let matcher = OutputMatcher::new();
        let output = "Edit src/main.rs\nDo you want to make this edit?\n❯ 1. Yes\n  2. No";
        assert_eq!(
            matcher.detect(output),
            Some(OutputState::WaitingPermission)
        );
    }

    #[test]
    fn test_output_matcher_completion_marker() {
        let matcher = OutputMatcher::new();
        assert_eq!(
            matcher.detect("All tests pass.\nclaudio:done\n"),
            Some(OutputState::Completed)
        );
    }

    #[test]
    fn test_output_matcher_idle_prompt() {
        let matcher = OutputMatcher::new();
        let idle = "╭──────╮\n│ >    │\n╰──────╯";
        assert_eq!(matcher.detect(idle), Some(OutputState::WaitingInput));

        let busy = "✻ Thinking… (esc to interrupt)\n│ >    │";
        assert_eq!(matcher.detect(busy), None);
    }

    #[test]
    fn test_output_matcher_pr_url() {
        let matcher = OutputMatcher::new();
        let output = "Opened https://github.com/acme/widgets/pull/42 for review";
        assert_eq!(
            matcher.detect_pr_url(output),
            Some("https://github.com/acme/widgets/pull/42".to_string())
        );
        assert_eq!(matcher.detect_pr_url("no links here"), None);
    }

    #[test]
    fn test_instance_new_defaults() {
        let instance = Instance::new(
            "inst-1".to_string(),
            "Fix login".to_string(),
            "Iron-Ham/abc12345/fix-login".to_string(),
            PathBuf::from("/tmp/wt"),
            "claudio-inst-1".to_string(),
        );
        assert_eq!(instance.status, Status::Pending);
        assert!(instance.pid.is_none());
        assert_eq!(instance.metrics, Metrics::default());
    }

    use crate::tmux::MockTerminalBackend;

    fn manager_with(terminal: MockTerminalBackend) -> InstanceManager {
        let instance = Instance::new(
            "inst-1".to_string(),
            "Fix login".to_string(),
            "Iron-Ham/abc12345/fix-login".to_string(),
            PathBuf::from("/tmp/wt"),
            "claudio-inst-1".to_string(),
        );
        InstanceManager::new(
            instance,
            Arc::new(terminal),
            InstanceConfig::default(),
            PriceTable::default(),
        )
    }

    fn idle_terminal() -> MockTerminalBackend {
        let mut terminal = MockTerminalBackend::new();
        terminal.expect_create_session().returning(|_, _, _, _, _| Ok(()));
        terminal.expect_session_pid().returning(|_| Ok(Some(321)));
        terminal.expect_session_exists().returning(|_| true);
        terminal.expect_bell_flag().returning(|_| Ok(false));
        terminal
            .expect_capture_output()
            .returning(|_| Ok(String::new()));
        terminal
    }

    #[tokio::test]
    async fn test_start_enters_working_and_rejects_double_start() {
        let manager = manager_with(idle_terminal());

        manager.start().await.unwrap();
        assert_eq!(manager.status().await, Status::Working);
        assert_eq!(manager.pid().await, Some(321));
        assert!(manager.start_time().await.is_some());

        assert!(manager.start().await.is_err());
    }

    #[tokio::test]
    async fn test_pause_requires_working_state() {
        let mut terminal = idle_terminal();
        terminal.expect_suspend_session().times(1).returning(|_| Ok(()));
        terminal.expect_resume_session().times(1).returning(|_| Ok(()));
        let manager = manager_with(terminal);

        // Pausing before start is rejected
        assert!(manager.pause().await.is_err());

        manager.start().await.unwrap();
        manager.pause().await.unwrap();
        assert_eq!(manager.status().await, Status::Paused);

        // Double pause is rejected, resume restores working
        assert!(manager.pause().await.is_err());
        manager.resume().await.unwrap();
        assert_eq!(manager.status().await, Status::Working);
    }

    #[tokio::test]
    async fn test_stop_completes_and_records_end_time() {
        let mut terminal = idle_terminal();
        terminal.expect_kill_session().times(1).returning(|_| Ok(()));
        let manager = manager_with(terminal);

        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, Status::Completed);
        assert!(snapshot.metrics.ended_at.is_some());
    }
}
