use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default branch prefix used for every generated branch name.
pub const DEFAULT_BRANCH_PREFIX: &str = "Iron-Ham";

/// Snapshot of everything the orchestration core reads from configuration.
///
/// The surrounding CLI owns discovery and merging of config files; the core
/// receives one immutable snapshot and persists it alongside the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudioConfig {
    #[serde(default)]
    pub pr: PrConfig,

    #[serde(default)]
    pub instance: InstanceConfig,

    #[serde(default)]
    pub resources: ResourceConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub ultraplan: UltraPlanConfig,

    #[serde(default)]
    pub pricing: PriceTable,
}

/// Pull-request behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrConfig {
    /// Generate PR bodies through the AI text backend instead of the
    /// built-in formatter.
    pub use_ai: bool,

    /// Open PRs as drafts.
    pub draft: bool,

    /// Rebase task branches onto their base before opening a PR.
    pub auto_rebase: bool,

    /// Prefix for all generated branch names.
    pub branch_prefix: String,
}

impl Default for PrConfig {
    fn default() -> Self {
        Self {
            use_ai: false,
            draft: false,
            auto_rebase: false,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

/// Per-instance supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Command launched inside each terminal session.
    pub command: String,

    /// Terminal dimensions for spawned sessions.
    pub tmux_width: u16,
    pub tmux_height: u16,

    /// Output scrape cadence. Never configured above one second.
    pub poll_interval: Duration,

    /// No new output for this long marks the instance stuck.
    pub activity_timeout: Duration,

    /// Total lifetime ceiling.
    pub completion_timeout: Duration,

    /// No progress signal for this long, while nominally working, marks the
    /// instance stuck.
    pub stale_timeout: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            tmux_width: 200,
            tmux_height: 50,
            poll_interval: Duration::from_millis(500),
            activity_timeout: Duration::from_secs(300),
            completion_timeout: Duration::from_secs(3600),
            stale_timeout: Duration::from_secs(600),
        }
    }
}

/// Session-wide budget limits. A value of zero disables the limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Hard dollar ceiling for the whole session.
    pub cost_limit: f64,

    /// Dollar threshold that fires a warning notification.
    pub cost_warning_threshold: f64,

    /// Token ceiling per instance.
    pub token_limit_per_instance: u64,
}

/// Review-fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Upper bound on concurrently running reviewer agents.
    pub max_parallel_agents: usize,

    /// Issues below this severity are dropped by the collector.
    pub severity_threshold: crate::review::ReviewSeverity,

    /// Pause the implementer instance when a critical issue lands.
    pub auto_pause_implementer: bool,

    /// Reviewer kinds to spawn.
    pub enabled_agents: Vec<crate::review::ReviewerKind>,

    /// Per-kind prompt overrides, keyed by the reviewer kind name.
    pub custom_prompts: std::collections::HashMap<String, String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: 3,
            severity_threshold: crate::review::ReviewSeverity::Major,
            auto_pause_implementer: false,
            enabled_agents: vec![
                crate::review::ReviewerKind::Security,
                crate::review::ReviewerKind::General,
            ],
            custom_prompts: std::collections::HashMap::new(),
        }
    }
}

/// Multi-phase workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UltraPlanConfig {
    /// Run three planning strategies and merge, instead of a single pass.
    pub multi_pass_planning: bool,

    /// Ceiling on synthesis/revision rounds.
    pub max_revision_rounds: u32,

    /// Consolidate per execution group (stacked PRs) or onto one branch.
    pub consolidation_mode: crate::ultraplan::ConsolidationMode,

    /// Retries per task before it counts as failed.
    pub task_retry_limit: u32,

    /// Sentinel-file poll cadence. Never configured above two seconds.
    pub poll_interval: Duration,
}

impl Default for UltraPlanConfig {
    fn default() -> Self {
        Self {
            multi_pass_planning: false,
            max_revision_rounds: 2,
            consolidation_mode: crate::ultraplan::ConsolidationMode::PerGroup,
            task_retry_limit: 1,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Per-million-token prices used when a worker reports tokens but no cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        // claude-sonnet list prices
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_per_mtok: 0.30,
            cache_write_per_mtok: 3.75,
        }
    }
}

impl PriceTable {
    /// Dollar cost of the given token counts.
    pub fn cost(&self, input: u64, output: u64, cache_read: u64, cache_write: u64) -> f64 {
        const MTOK: f64 = 1_000_000.0;
        input as f64 / MTOK * self.input_per_mtok
            + output as f64 / MTOK * self.output_per_mtok
            + cache_read as f64 / MTOK * self.cache_read_per_mtok
            + cache_write as f64 / MTOK * self.cache_write_per_mtok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClaudioConfig::default();
        assert_eq!(config.pr.branch_prefix, "Iron-Ham");
        assert_eq!(config.review.max_parallel_agents, 3);
        assert!(config.instance.poll_interval <= Duration::from_secs(1));
        assert!(config.ultraplan.poll_interval <= Duration::from_secs(2));
        assert_eq!(config.resources.cost_limit, 0.0);
    }

    #[test]
    fn test_price_table_cost() {
        let prices = PriceTable::default();
        let cost = prices.cost(1_000_000, 1_000_000, 0, 0);
        assert!((cost - 18.0).abs() < f64::EPSILON);
        assert_eq!(prices.cost(0, 0, 0, 0), 0.0);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = ClaudioConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: ClaudioConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.pr.branch_prefix, config.pr.branch_prefix);
        assert_eq!(back.instance.command, config.instance.command);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{"resources": {"cost_limit": 5.0}}"#;
        let config: ClaudioConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.resources.cost_limit, 5.0);
        assert_eq!(config.pr.branch_prefix, "Iron-Ham");
    }
}
