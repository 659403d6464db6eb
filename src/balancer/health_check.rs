//! Health check manager for monitoring server liveness

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::registry::StaticServerRegistry;
use crate::balancer::server::Server;
use crate::config::HealthCheckConfig;

/// Liveness probe for a single server
#[async_trait]
pub trait Ping: Send + Sync {
    async fn is_alive(&self, server: &Server) -> bool;
}

/// Probe issuing `GET {scheme}://{host}:{port}{path}`
#[derive(Debug, Clone)]
pub struct HttpPing {
    client: Client,
    path: String,
}

impl HttpPing {
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Ping for HttpPing {
    async fn is_alive(&self, server: &Server) -> bool {
        let scheme = server.scheme.as_deref().unwrap_or("http");
        let url = format!("{}://{}:{}{}", scheme, server.host, server.port, self.path);

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(server = %server, status = %response.status(), "Health check failed");
                false
            }
            Err(e) => {
                debug!(server = %server, error = %e, "Health check failed");
                false
            }
        }
    }
}

/// Health status of a server
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: Instant,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true, // Assume healthy until proven otherwise
            last_check: Instant::now(),
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

#[derive(Clone)]
struct Checker {
    registry: Arc<StaticServerRegistry>,
    ping: Arc<dyn Ping>,
    health_status: Arc<DashMap<String, HealthStatus>>,
    /// Number of consecutive failures before marking dead
    failure_threshold: u32,
    /// Number of consecutive successes before marking alive again
    recovery_threshold: u32,
}

impl Checker {
    /// Ping every server once; returns how many are healthy
    async fn check_all(&self) -> usize {
        let mut healthy = 0;
        for server in self.registry.servers() {
            if self.check(&server).await {
                healthy += 1;
            }
        }
        healthy
    }

    async fn check(&self, server: &Server) -> bool {
        let is_alive = self.ping.is_alive(server).await;
        let name = server.id();

        let healthy = {
            let mut status = self.health_status.entry(name.clone()).or_default();
            status.last_check = Instant::now();

            if is_alive {
                status.consecutive_failures = 0;
                status.consecutive_successes += 1;

                if !status.healthy && status.consecutive_successes >= self.recovery_threshold {
                    status.healthy = true;
                    info!(server = %name, "Server recovered and marked healthy");
                }
            } else {
                status.consecutive_successes = 0;
                status.consecutive_failures += 1;

                if status.healthy && status.consecutive_failures >= self.failure_threshold {
                    status.healthy = false;
                    warn!(
                        server = %name,
                        failures = status.consecutive_failures,
                        "Server marked unhealthy after consecutive failures"
                    );
                }
            }

            debug!(
                server = %name,
                healthy = status.healthy,
                consecutive_failures = status.consecutive_failures,
                consecutive_successes = status.consecutive_successes,
                "Health check completed"
            );
            status.healthy
        };

        self.registry.set_alive(server, healthy);
        healthy
    }
}

/// Health check manager
pub struct HealthCheckManager {
    checker: Checker,
    check_task: RwLock<Option<JoinHandle<()>>>,
}

impl HealthCheckManager {
    /// Create a new health check manager
    pub fn new(registry: Arc<StaticServerRegistry>, ping: Arc<dyn Ping>) -> Self {
        Self::with_thresholds(registry, ping, 3, 2)
    }

    /// Create a health check manager with explicit thresholds
    pub fn with_thresholds(
        registry: Arc<StaticServerRegistry>,
        ping: Arc<dyn Ping>,
        failure_threshold: u32,
        recovery_threshold: u32,
    ) -> Self {
        Self {
            checker: Checker {
                registry,
                ping,
                health_status: Arc::new(DashMap::new()),
                failure_threshold: failure_threshold.max(1),
                recovery_threshold: recovery_threshold.max(1),
            },
            check_task: RwLock::new(None),
        }
    }

    /// Create a health check manager from configuration
    pub fn from_config(registry: Arc<StaticServerRegistry>, client: Client, config: &HealthCheckConfig) -> Self {
        Self::with_thresholds(
            registry,
            Arc::new(HttpPing::new(client, config.path.clone())),
            config.failure_threshold,
            config.recovery_threshold,
        )
    }

    /// Start the health check background task
    pub async fn start(&self, interval_secs: u64) {
        let checker = self.checker.clone();

        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs);

            loop {
                checker.check_all().await;
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.check_task.write().await.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval_secs, "Started health check background task");
    }

    /// Stop the health check background task
    pub async fn stop(&self) {
        if let Some(handle) = self.check_task.write().await.take() {
            handle.abort();
            info!("Stopped health check background task");
        }
    }

    /// Check if a specific server is healthy
    pub fn is_healthy(&self, server: &Server) -> bool {
        self.checker
            .health_status
            .get(&server.id())
            .map(|s| s.healthy)
            .unwrap_or(true) // Assume healthy if not checked yet
    }

    /// Get health status for a server
    pub fn get_status(&self, server: &Server) -> Option<HealthStatus> {
        self.checker.health_status.get(&server.id()).map(|s| s.clone())
    }

    /// Force a round of health checks; returns the number of healthy servers
    pub async fn check_now(&self) -> usize {
        self.checker.check_all().await
    }

    /// Get all unhealthy servers
    pub fn get_unhealthy_servers(&self) -> Vec<String> {
        self.checker
            .health_status
            .iter()
            .filter(|entry| !entry.healthy)
            .map(|entry| entry.key().clone())
            .collect()
    }
}
