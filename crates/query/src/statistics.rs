//! Query execution statistics
//!
//! Counts executions and result-cache hits per query string, both since the
//! statistics were created (or cleared) and since the last reset.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Execution and hit counts of one query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryCounts {
    /// Executions since start
    pub total_executions: u64,
    /// Cache hits since start
    pub total_hits: u64,
    /// Executions since the last reset
    pub executions: u64,
    /// Cache hits since the last reset
    pub hits: u64,
}

impl QueryCounts {
    /// Hits per execution since the last reset; zero before any execution
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits, self.executions)
    }

    /// Hits per execution since start
    pub fn total_hit_ratio(&self) -> f64 {
        ratio(self.total_hits, self.total_executions)
    }
}

fn ratio(hits: u64, executions: u64) -> f64 {
    if executions == 0 {
        0.0
    } else {
        hits as f64 / executions as f64
    }
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    start: DateTime<Utc>,
    last_reset: DateTime<Utc>,
}

/// Per-query counters, safe to share between threads
#[derive(Debug)]
pub struct QueryStatistics {
    counts: DashMap<String, QueryCounts>,
    clock: Mutex<Clock>,
}

impl Default for QueryStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStatistics {
    /// Empty statistics starting now
    pub fn new() -> Self {
        let now = Utc::now();
        QueryStatistics {
            counts: DashMap::new(),
            clock: Mutex::new(Clock {
                start: now,
                last_reset: now,
            }),
        }
    }

    /// Record one execution of `query`, served from the cache when `hit`
    pub fn record_execution(&self, query: &str, hit: bool) {
        let mut counts = self.counts.entry(query.to_string()).or_default();
        counts.total_executions += 1;
        counts.executions += 1;
        if hit {
            counts.total_hits += 1;
            counts.hits += 1;
        }
    }

    /// Counts of `query`; zero for unknown queries
    pub fn counts(&self, query: &str) -> QueryCounts {
        self.counts.get(query).map(|c| *c).unwrap_or_default()
    }

    /// Executions of `query` since the last reset
    pub fn executions(&self, query: &str) -> u64 {
        self.counts(query).executions
    }

    /// Executions of `query` since start
    pub fn total_executions(&self, query: &str) -> u64 {
        self.counts(query).total_executions
    }

    /// Cache hits of `query` since the last reset
    pub fn hits(&self, query: &str) -> u64 {
        self.counts(query).hits
    }

    /// Cache hits of `query` since start
    pub fn total_hits(&self, query: &str) -> u64 {
        self.counts(query).total_hits
    }

    /// Hit ratio of `query` since the last reset
    pub fn hit_ratio(&self, query: &str) -> f64 {
        self.counts(query).hit_ratio()
    }

    /// Counts summed over every query
    pub fn aggregate(&self) -> QueryCounts {
        self.counts.iter().fold(QueryCounts::default(), |mut acc, c| {
            acc.total_executions += c.total_executions;
            acc.total_hits += c.total_hits;
            acc.executions += c.executions;
            acc.hits += c.hits;
            acc
        })
    }

    /// Queries seen, sorted
    pub fn queries(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.counts.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// When counting started
    pub fn start(&self) -> DateTime<Utc> {
        self.clock.lock().start
    }

    /// When the since-reset counters were last zeroed
    pub fn last_reset(&self) -> DateTime<Utc> {
        self.clock.lock().last_reset
    }

    /// Zero the since-reset counters; totals are kept
    pub fn reset(&self) {
        for mut counts in self.counts.iter_mut() {
            counts.executions = 0;
            counts.hits = 0;
        }
        self.clock.lock().last_reset = Utc::now();
        debug!(queries = self.counts.len(), "query statistics reset");
    }

    /// Forget every query and restart the clock
    pub fn clear(&self) {
        self.counts.clear();
        let now = Utc::now();
        *self.clock.lock() = Clock {
            start: now,
            last_reset: now,
        };
        debug!("query statistics cleared");
    }
}
