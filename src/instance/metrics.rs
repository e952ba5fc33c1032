//! Token, cost, and API-call accounting scraped from worker output.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PriceTable;
use crate::utils::parse_count;

/// Usage counters for one instance.
///
/// All counters are monotonic: merging an observation never decreases any
/// component, so a stale pane capture cannot roll the numbers back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub api_calls: u64,
    pub cost: f64,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Metrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    /// Wall-clock duration: `(end ?? now) - start`.
    pub fn duration(&self) -> chrono::Duration {
        match self.started_at {
            Some(start) => self.ended_at.unwrap_or_else(Utc::now) - start,
            None => chrono::Duration::zero(),
        }
    }

    /// Folds in a fresh observation, keeping every counter monotonic and
    /// taking cost as the max of the parsed value and the price-table
    /// computation.
    pub fn merge_observation(&mut self, obs: &Observation, prices: &PriceTable) {
        self.input_tokens = self.input_tokens.max(obs.input_tokens);
        self.output_tokens = self.output_tokens.max(obs.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(obs.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.max(obs.cache_write_tokens);
        self.api_calls = self.api_calls.max(obs.api_calls);

        let computed = prices.cost(
            self.input_tokens,
            self.output_tokens,
            self.cache_read_tokens,
            self.cache_write_tokens,
        );
        self.cost = self.cost.max(obs.cost.unwrap_or(0.0)).max(computed);
    }

    /// Componentwise sum, for session-level aggregation.
    pub fn add(&mut self, other: &Metrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.api_calls += other.api_calls;
        self.cost += other.cost;
    }
}

/// One scrape's worth of parsed counters, before the monotonic merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub api_calls: u64,
    pub cost: Option<f64>,
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Scrapes the periodic usage line Claude Code prints into its pane.
pub struct MetricsParser {
    input: Regex,
    output: Regex,
    cache_read: Regex,
    cache_write: Regex,
    api_calls: Regex,
    cost: Regex,
}

impl MetricsParser {
    pub fn new() -> Self {
        Self {
            input: Regex::new(r"(?i)([\d,.]+[kKmM]?)\s+input tokens?").unwrap(),
            output: Regex::new(r"(?i)([\d,.]+[kKmM]?)\s+output tokens?").unwrap(),
            cache_read: Regex::new(r"(?i)cache read[:\s]+([\d,.]+[kKmM]?)").unwrap(),
            cache_write: Regex::new(r"(?i)cache write[:\s]+([\d,.]+[kKmM]?)").unwrap(),
            api_calls: Regex::new(r"(?i)([\d,]+)\s+api calls?").unwrap(),
            cost: Regex::new(r"(?i)(?:total )?cost[:\s]+\$([\d,.]+)").unwrap(),
        }
    }

    /// Parses the latest counters out of a pane capture. Returns `None`
    /// when the output carries no usage information at all.
    pub fn parse(&self, output: &str) -> Option<Observation> {
        let count = |re: &Regex| -> u64 {
            re.captures_iter(output)
                .filter_map(|c| parse_count(&c[1]))
                .last()
                .unwrap_or(0)
        };

        let obs = Observation {
            input_tokens: count(&self.input),
            output_tokens: count(&self.output),
            cache_read_tokens: count(&self.cache_read),
            cache_write_tokens: count(&self.cache_write),
            api_calls: count(&self.api_calls),
            cost: self
                .cost
                .captures_iter(output)
                .filter_map(|c| c[1].replace(',', "").parse::<f64>().ok())
                .last(),
        };

        if obs.is_empty() {
            None
        } else {
            Some(obs)
        }
    }
}

impl Default for MetricsParser {
    fn default() -> Self {
        Self::new()
    }
}
