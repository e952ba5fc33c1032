//! The review fleet: specialized reviewer workers spawned against one
//! implementer instance, with a single collector funnelling their findings.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReviewConfig;
use crate::orchestrator::Orchestrator;
use crate::prompts;

/// Reviewer specializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewerKind {
    Security,
    Performance,
    Style,
    TestCoverage,
    General,
    Custom,
}

impl ReviewerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReviewerKind::Security => "security",
            ReviewerKind::Performance => "performance",
            ReviewerKind::Style => "style",
            ReviewerKind::TestCoverage => "test-coverage",
            ReviewerKind::General => "general",
            ReviewerKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ReviewerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Issue severity, ordered most severe first: critical < major < minor <
/// info.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ReviewSeverity {
    Critical,
    Major,
    Minor,
    Info,
}

impl std::fmt::Display for ReviewSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReviewSeverity::Critical => "critical",
            ReviewSeverity::Major => "major",
            ReviewSeverity::Minor => "minor",
            ReviewSeverity::Info => "info",
        };
        write!(f, "{}", name)
    }
}

/// One finding from a reviewer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: ReviewSeverity,
    #[serde(rename = "type", default)]
    pub issue_type: String,
    pub file: String,
    #[serde(default)]
    pub line_start: u32,
    #[serde(default)]
    pub line_end: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
}

/// Fleet phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPhase {
    Idle,
    Running,
    Paused,
    Complete,
}

/// Bookkeeping for one spawned reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAgentRecord {
    pub kind: ReviewerKind,
    pub instance_id: Option<String>,
    pub issues_found: usize,
}

/// Live state of one review fleet run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSession {
    pub phase: ReviewPhase,
    pub target_session_id: String,
    pub config: ReviewConfig,
    pub agents: Vec<ReviewAgentRecord>,
    pub issues: Vec<ReviewIssue>,
}

pub type IssueCallback = Arc<dyn Fn(&ReviewIssue) + Send + Sync>;

#[derive(Default)]
struct ReviewCallbacks {
    on_issue_found: Option<IssueCallback>,
    on_critical_issue: Option<IssueCallback>,
}

/// Issue channel capacity; sized so a bursty reviewer never blocks the
/// fleet on the collector.
const ISSUE_CHANNEL_CAPACITY: usize = 128;

/// Spawns and supervises the reviewer fleet for one implementer.
pub struct ReviewCoordinator {
    orchestrator: Orchestrator,
    config: ReviewConfig,
    session: Arc<RwLock<ReviewSession>>,
    callbacks: Arc<RwLock<ReviewCallbacks>>,
    issue_tx: async_channel::Sender<(ReviewerKind, ReviewIssue)>,
    issue_rx: async_channel::Receiver<(ReviewerKind, ReviewIssue)>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    agent_handles: Mutex<Vec<JoinHandle<()>>>,
    collector_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReviewCoordinator {
    /// `cancel` is the parent token; the fleet gets a child token so a
    /// coordinator-level cancel tears it down too.
    pub fn new(
        orchestrator: Orchestrator,
        config: ReviewConfig,
        target_instance_id: &str,
        cancel: &CancellationToken,
    ) -> Self {
        let (issue_tx, issue_rx) = async_channel::bounded(ISSUE_CHANNEL_CAPACITY);
        let session = ReviewSession {
            phase: ReviewPhase::Idle,
            target_session_id: target_instance_id.to_string(),
            config: config.clone(),
            agents: Vec::new(),
            issues: Vec::new(),
        };

        Self {
            orchestrator,
            semaphore: Arc::new(Semaphore::new(config.max_parallel_agents.max(1))),
            config,
            session: Arc::new(RwLock::new(session)),
            callbacks: Arc::new(RwLock::new(ReviewCallbacks::default())),
            issue_tx,
            issue_rx,
            cancel: cancel.child_token(),
            agent_handles: Mutex::new(Vec::new()),
            collector_handle: Mutex::new(None),
        }
    }

    pub async fn set_issue_callback(&self, callback: IssueCallback) {
        self.callbacks.write().await.on_issue_found = Some(callback);
    }

    pub async fn set_critical_issue_callback(&self, callback: IssueCallback) {
        self.callbacks.write().await.on_critical_issue = Some(callback);
    }

    pub async fn session_snapshot(&self) -> ReviewSession {
        self.session.read().await.clone()
    }

    /// Launches the collector and one worker per enabled reviewer kind.
    pub async fn start(&self) -> Result<()> {
        {
            let mut session = self.session.write().await;
            session.phase = ReviewPhase::Running;
            session.agents = self
                .config
                .enabled_agents
                .iter()
                .map(|kind| ReviewAgentRecord {
                    kind: *kind,
                    instance_id: None,
                    issues_found: 0,
                })
                .collect();
        }

        self.spawn_collector().await;

        let mut handles = self.agent_handles.lock().await;
        for kind in self.config.enabled_agents.clone() {
            handles.push(self.spawn_agent(kind));
        }

        info!(
            "Review fleet started: {} agents against {}",
            handles.len(),
            self.session.read().await.target_session_id
        );
        Ok(())
    }

    fn spawn_agent(&self, kind: ReviewerKind) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let session = self.session.clone();
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let issue_tx = self.issue_tx.clone();
        let custom_prompt = self.config.custom_prompts.get(kind.name()).cloned();
        let poll = self.orchestrator.config().instance.poll_interval;

        tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = semaphore.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let target = session.read().await.target_session_id.clone();
            let diff = orchestrator
                .get_instance_diff(&target)
                .await
                .unwrap_or_default();
            let prompt = prompts::reviewer_prompt(kind, &target, &diff, custom_prompt.as_deref());

            let instance_id = match orchestrator
                .add_instance(&format!("review-{}", kind))
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warn!("Failed to add {} reviewer: {}", kind, e);
                    return;
                }
            };

            {
                let mut session = session.write().await;
                if let Some(record) = session.agents.iter_mut().find(|a| a.kind == kind) {
                    record.instance_id = Some(instance_id.clone());
                }
            }

            if let Err(e) = orchestrator.start_instance(&instance_id).await {
                warn!("Failed to start {} reviewer: {}", kind, e);
                return;
            }

            if let Some(manager) = orchestrator.get_instance_manager(&instance_id).await {
                if let Err(e) = manager.send_input(&prompt).await {
                    warn!("Failed to prompt {} reviewer: {}", kind, e);
                }
            }

            // Wait for the reviewer to finish its single turn
            let manager = loop {
                if cancel.is_cancelled() {
                    let _ = orchestrator.stop_instance(&instance_id).await;
                    return;
                }
                match orchestrator.get_instance_manager(&instance_id).await {
                    Some(manager) if manager.status().await.is_terminal() => break manager,
                    Some(_) => tokio::time::sleep(poll).await,
                    None => return,
                }
            };

            let output = manager.last_output().await;
            for issue in parse_reviewer_output(&output) {
                if issue_tx.send((kind, issue)).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn spawn_collector(&self) {
        let issue_rx = self.issue_rx.clone();
        let session = self.session.clone();
        let callbacks = self.callbacks.clone();
        let orchestrator = self.orchestrator.clone();
        let threshold = self.config.severity_threshold;
        let auto_pause = self.config.auto_pause_implementer;

        let handle = tokio::spawn(async move {
            while let Ok((kind, issue)) = issue_rx.recv().await {
                if issue.severity > threshold {
                    debug!(
                        "Dropping {} issue below threshold {}: {}",
                        issue.severity, threshold, issue.title
                    );
                    continue;
                }

                let target = {
                    let mut session = session.write().await;
                    session.issues.push(issue.clone());
                    if let Some(record) = session.agents.iter_mut().find(|a| a.kind == kind) {
                        record.issues_found += 1;
                    }
                    session.target_session_id.clone()
                };

                let (on_issue, on_critical) = {
                    let callbacks = callbacks.read().await;
                    (
                        callbacks.on_issue_found.clone(),
                        callbacks.on_critical_issue.clone(),
                    )
                };

                if let Some(callback) = on_issue {
                    callback(&issue);
                }

                if issue.severity == ReviewSeverity::Critical {
                    if let Some(callback) = on_critical {
                        callback(&issue);
                    }
                    if auto_pause {
                        info!(
                            "Critical issue from {} reviewer; pausing implementer {}",
                            kind, target
                        );
                        if let Err(e) = orchestrator.pause_instance(&target).await {
                            warn!("Auto-pause failed for {}: {}", target, e);
                        }
                    }
                }
            }
        });

        *self.collector_handle.lock().await = Some(handle);
    }

    /// Pauses every running reviewer instance.
    pub async fn pause(&self) -> Result<()> {
        for id in self.agent_instance_ids().await {
            if let Err(e) = self.orchestrator.pause_instance(&id).await {
                debug!("Pause skipped for reviewer {}: {}", id, e);
            }
        }
        self.session.write().await.phase = ReviewPhase::Paused;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        for id in self.agent_instance_ids().await {
            if let Err(e) = self.orchestrator.resume_instance(&id).await {
                debug!("Resume skipped for reviewer {}: {}", id, e);
            }
        }
        self.session.write().await.phase = ReviewPhase::Running;
        Ok(())
    }

    /// Cancels the fleet, stops reviewer instances, closes the issue
    /// channel, and completes the session after the collector drains.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        for id in self.agent_instance_ids().await {
            if let Err(e) = self.orchestrator.stop_instance(&id).await {
                debug!("Stop skipped for reviewer {}: {}", id, e);
            }
        }

        for handle in self.agent_handles.lock().await.drain(..) {
            let _ = handle.await;
        }

        self.issue_tx.close();
        if let Some(handle) = self.collector_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.session.write().await.phase = ReviewPhase::Complete;
        Ok(())
    }

    /// Blocks until every agent task has returned, then drains the
    /// collector and completes the session.
    pub async fn wait_for_completion(&self) {
        for handle in self.agent_handles.lock().await.drain(..) {
            let _ = handle.await;
        }

        self.issue_tx.close();
        if let Some(handle) = self.collector_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.session.write().await.phase = ReviewPhase::Complete;
    }

    /// Like [`ReviewCoordinator::wait_for_completion`], but gives up after
    /// `timeout` without cancelling the fleet. Returns `false` on elapse.
    pub async fn wait_for_completion_timeout(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_completion())
            .await
            .is_ok()
    }

    async fn agent_instance_ids(&self) -> Vec<String> {
        self.session
            .read()
            .await
            .agents
            .iter()
            .filter_map(|a| a.instance_id.clone())
            .collect()
    }
}

/// Extracts the `{"issues": [...]}` object a reviewer prints as its final
/// answer. Entries that fail the issue schema are dropped.
pub fn parse_reviewer_output(output: &str) -> Vec<ReviewIssue> {
    let Some(start) = output.rfind("{\"issues\"").or_else(|| {
        output
            .rfind("\"issues\"")
            .and_then(|idx| output[..idx].rfind('{'))
    }) else {
        return Vec::new();
    };

    let Some(object) = balanced_object(&output[start..]) else {
        return Vec::new();
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(object) else {
        return Vec::new();
    };

    value
        .get("issues")
        .and_then(|issues| issues.as_array())
        .map(|issues| {
            issues
                .iter()
                .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Longest balanced `{...}` prefix of `s`, string-literal aware.
fn balanced_object(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(ReviewSeverity::Critical < ReviewSeverity::Major);
        assert!(ReviewSeverity::Major < ReviewSeverity::Minor);
        assert!(ReviewSeverity::Minor < ReviewSeverity::Info);
    }

    #[test]
    fn test_parse_reviewer_output() {
        let output = r#"
Reviewing the diff now...

{"issues": [
  {"severity": "critical", "file": "src/auth.rs", "line_start": 10,
   "line_end": 12, "title": "SQL injection", "description": "raw concat",
   "suggestion": "use bind params"},
  {"severity": "minor", "file": "src/lib.rs", "title": "naming nit"}
]}
"#;
        let issues = parse_reviewer_output(output);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].severity, ReviewSeverity::Critical);
        assert_eq!(issues[0].file, "src/auth.rs");
        assert_eq!(issues[1].line_start, 0);
    }

    #[test]
    fn test_parse_drops_invalid_entries() {
        let output = r#"{"issues": [
            {"severity": "major", "file": "a.rs", "title": "ok"},
            {"severity": "catastrophic", "file": "b.rs", "title": "bad severity"},
            {"file": "c.rs"}
        ]}"#;
        let issues = parse_reviewer_output(output);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].file, "a.rs");
    }

    #[test]
    fn test_parse_no_json() {
        assert!(parse_reviewer_output("nothing to see here").is_empty());
        assert!(parse_reviewer_output("{\"issues\": [").is_empty());
    }

    #[test]
    fn test_balanced_object_with_nested_strings() {
        let s = r#"{"issues": [{"title": "brace } in string"}]} trailing"#;
        let object = balanced_object(s).unwrap();
        assert!(object.ends_with("]}"));
        assert!(serde_json::from_str::<serde_json::Value>(object).is_ok());
    }

    #[test]
    fn test_reviewer_kind_names() {
        assert_eq!(ReviewerKind::TestCoverage.name(), "test-coverage");
        assert_eq!(ReviewerKind::Security.to_string(), "security");
    }
}
