//! Server registry - selection, URI reconstruction and outcome tracking

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::balancer::server::{CallOutcome, Server, ServerStats};
use crate::config::LoadBalancerConfig;
use crate::error::{DispatchError, Result};
use crate::transport::HttpRequest;

/// Selection and statistics capability consumed by the dispatcher.
///
/// Implementations are shared by many concurrent dispatches and must do
/// their own synchronisation.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Choose a server for a request
    async fn select(&self, request: &HttpRequest) -> Result<Server>;

    /// Concrete target for `logical` on `server`
    fn reconstruct_target(&self, server: &Server, logical: &Url) -> Result<Url> {
        reconstruct_url(server, logical)
    }

    /// Feed back the outcome of a call
    fn record_outcome(&self, server: &Server, outcome: CallOutcome);
}

/// Replace host and port (and scheme, if the server declares one) of `logical`.
/// Userinfo, path, query and fragment are kept.
pub fn reconstruct_url(server: &Server, logical: &Url) -> Result<Url> {
    let mut url = logical.clone();
    if let Some(scheme) = &server.scheme {
        url.set_scheme(scheme).map_err(|_| {
            DispatchError::InvalidRequest(format!("cannot apply scheme '{}' to {}", scheme, logical))
        })?;
    }
    url.set_host(Some(&server.host))
        .map_err(|e| DispatchError::InvalidRequest(format!("invalid host '{}': {}", server.host, e)))?;
    url.set_port(Some(server.port))
        .map_err(|_| DispatchError::InvalidRequest(format!("cannot set port on {}", logical)))?;
    Ok(url)
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin distribution
    #[default]
    RoundRobin,
    /// Weighted round-robin based on server weights
    WeightedRoundRobin,
    /// Random selection
    Random,
    /// Round-robin that skips servers whose circuit is tripped
    AvailabilityFiltering,
}

/// Registry over a fixed, runtime-editable list of servers
pub struct StaticServerRegistry {
    service_id: String,
    servers: RwLock<Vec<Server>>,
    strategy: RwLock<LoadBalancingStrategy>,
    round_robin_index: AtomicUsize,
    weighted_state: Mutex<WeightedRoundRobinState>,
    stats: DashMap<String, ServerStats>,
    failure_threshold: u32,
    circuit_open: Duration,
}

/// State for weighted round-robin algorithm
struct WeightedRoundRobinState {
    current_index: usize,
    current_weight: i64,
}

impl StaticServerRegistry {
    /// Create a registry with default thresholds
    pub fn new(service_id: impl Into<String>, servers: Vec<Server>) -> Self {
        Self::with_thresholds(service_id, servers, 3, Duration::from_secs(30))
    }

    /// Create a registry with explicit circuit thresholds
    pub fn with_thresholds(
        service_id: impl Into<String>,
        servers: Vec<Server>,
        failure_threshold: u32,
        circuit_open: Duration,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            servers: RwLock::new(servers),
            strategy: RwLock::new(LoadBalancingStrategy::default()),
            round_robin_index: AtomicUsize::new(0),
            weighted_state: Mutex::new(WeightedRoundRobinState {
                current_index: 0,
                current_weight: 0,
            }),
            stats: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            circuit_open,
        }
    }

    /// Create a registry from configuration
    pub fn from_config(service_id: impl Into<String>, config: &LoadBalancerConfig) -> Self {
        let registry = Self::with_thresholds(
            service_id,
            config.servers.clone(),
            config.failure_threshold,
            Duration::from_millis(config.circuit_open_ms),
        );
        registry.set_strategy(config.strategy);
        registry
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Set the load balancing strategy
    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write() = strategy;
    }

    /// Get the current load balancing strategy
    pub fn strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.read()
    }

    /// Snapshot of the configured servers
    pub fn servers(&self) -> Vec<Server> {
        self.servers.read().clone()
    }

    pub fn add_server(&self, server: Server) {
        let mut servers = self.servers.write();
        if !servers.contains(&server) {
            servers.push(server);
        }
    }

    pub fn remove_server(&self, server: &Server) {
        self.servers.write().retain(|s| s != server);
        self.stats.remove(&server.id());
    }

    /// Statistics for a server, if it has been seen
    pub fn stats(&self, server: &Server) -> Option<ServerStats> {
        self.stats.get(&server.id()).map(|s| s.clone())
    }

    /// Mark a server alive or dead; dead servers are never selected
    pub fn set_alive(&self, server: &Server, alive: bool) {
        let mut stats = self.stats.entry(server.id()).or_default();
        if stats.alive != alive {
            if alive {
                debug!(service = %self.service_id, server = %server, "Server marked alive");
            } else {
                warn!(service = %self.service_id, server = %server, "Server marked dead");
            }
        }
        stats.alive = alive;
    }

    pub fn is_alive(&self, server: &Server) -> bool {
        self.stats.get(&server.id()).map(|s| s.alive).unwrap_or(true)
    }

    /// Servers that passed their last health check
    fn live_servers(&self) -> Vec<Server> {
        self.servers
            .read()
            .iter()
            .filter(|s| self.is_alive(s))
            .cloned()
            .collect()
    }

    fn choose(&self, candidates: &[Server], strategy: LoadBalancingStrategy) -> Server {
        match strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(candidates),
            LoadBalancingStrategy::WeightedRoundRobin => self.select_weighted_round_robin(candidates),
            LoadBalancingStrategy::Random => self.select_random(candidates),
            LoadBalancingStrategy::AvailabilityFiltering => {
                let now = Instant::now();
                let available: Vec<Server> = candidates
                    .iter()
                    .filter(|s| {
                        !self
                            .stats
                            .get(&s.id())
                            .map(|st| st.is_tripped(now))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                if available.is_empty() {
                    // Every circuit is open; better to try someone than no one.
                    self.select_round_robin(candidates)
                } else {
                    self.select_round_robin(&available)
                }
            }
        }
    }

    /// Round-robin selection
    fn select_round_robin(&self, servers: &[Server]) -> Server {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        servers[index % servers.len()].clone()
    }

    /// Weighted round-robin selection
    fn select_weighted_round_robin(&self, servers: &[Server]) -> Server {
        if servers.len() == 1 {
            return servers[0].clone();
        }

        let mut state = self.weighted_state.lock();
        let weights: Vec<i64> = servers.iter().map(|s| i64::from(s.weight.max(1))).collect();
        let max_weight = weights.iter().copied().max().unwrap_or(1);
        let gcd = weights.iter().fold(0, |acc, &w| gcd(acc, w));

        loop {
            state.current_index = (state.current_index + 1) % servers.len();

            if state.current_index == 0 {
                state.current_weight -= gcd;
                if state.current_weight <= 0 {
                    state.current_weight = max_weight;
                }
            }

            if weights[state.current_index] >= state.current_weight {
                return servers[state.current_index].clone();
            }
        }
    }

    /// Random selection
    fn select_random(&self, servers: &[Server]) -> Server {
        let index = rand::thread_rng().gen_range(0..servers.len());
        servers[index].clone()
    }
}

#[async_trait]
impl ServerRegistry for StaticServerRegistry {
    async fn select(&self, _request: &HttpRequest) -> Result<Server> {
        let candidates = self.live_servers();
        if candidates.is_empty() {
            return Err(DispatchError::NoServerAvailable(self.service_id.clone()));
        }

        let strategy = self.strategy();
        let selected = self.choose(&candidates, strategy);

        debug!(
            service = %self.service_id,
            server = %selected,
            strategy = ?strategy,
            "Selected server for request"
        );

        Ok(selected)
    }

    fn record_outcome(&self, server: &Server, outcome: CallOutcome) {
        let mut stats = self.stats.entry(server.id()).or_default();
        let was_tripped = stats.is_tripped(Instant::now());
        stats.record(outcome, self.failure_threshold, self.circuit_open);
        if !was_tripped && stats.is_tripped(Instant::now()) {
            warn!(
                service = %self.service_id,
                server = %server,
                consecutive_failures = stats.consecutive_failures,
                "Server circuit tripped after consecutive failures"
            );
        }
    }
}

impl std::fmt::Debug for StaticServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticServerRegistry")
            .field("service_id", &self.service_id)
            .field("servers", &self.servers.read().len())
            .field("strategy", &self.strategy())
            .finish()
    }
}

/// Calculate greatest common divisor
fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}
