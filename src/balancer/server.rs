//! Server instances and their call statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A concrete, selectable network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Overrides the logical request's scheme when set
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: None,
            weight: default_weight(),
            zone: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `host:port`, the key statistics are tracked under
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of one call against a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Per-server call statistics and availability
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Set by the health checker
    pub alive: bool,
    pub tripped_until: Option<Instant>,
    pub last_outcome: Option<Instant>,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            alive: true, // Assume alive until a health check says otherwise
            tripped_until: None,
            last_outcome: None,
        }
    }
}

impl ServerStats {
    /// Apply an outcome; trips the circuit after `failure_threshold` consecutive failures
    pub fn record(&mut self, outcome: CallOutcome, failure_threshold: u32, circuit_open: Duration) {
        let now = Instant::now();
        self.last_outcome = Some(now);
        match outcome {
            CallOutcome::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
                self.tripped_until = None;
            }
            CallOutcome::Failure => {
                self.failures += 1;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= failure_threshold {
                    self.tripped_until = Some(now + circuit_open);
                }
            }
        }
    }

    pub fn is_tripped(&self, now: Instant) -> bool {
        self.tripped_until.map(|until| now < until).unwrap_or(false)
    }
}
