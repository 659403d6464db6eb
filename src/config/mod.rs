//! Configuration module

pub mod settings;

pub use settings::{
    ClientConfig, HealthCheckConfig, LoadBalancerConfig, LoggingConfig, RetryConfig, Settings,
};
