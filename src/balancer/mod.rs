//! Balancer module - server selection, outcome statistics and health checking

pub mod health_check;
pub mod registry;
pub mod server;

pub use health_check::{HealthCheckManager, HttpPing, Ping};
pub use registry::{reconstruct_url, LoadBalancingStrategy, ServerRegistry, StaticServerRegistry};
pub use server::{CallOutcome, Server, ServerStats};
