//! Retry and failover policy

use rand::Rng;
use reqwest::Method;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::DispatchError;

/// Delay between attempts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    None,
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, capped at `max`; with `jitter`, a uniform
    /// random delay in `[0, computed]`
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max, jitter } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                let delay = base.saturating_mul(factor).min(*max);
                if *jitter && !delay.is_zero() {
                    let millis = delay.as_millis() as u64;
                    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
                } else {
                    delay
                }
            }
        }
    }
}

/// What the command should do after a retriable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    SameServer,
    NextServer,
}

/// Bounds on how often a request is retried on the same server and on others.
///
/// At most `(max_retries_same_server + 1) * (max_retries_next_server + 1)`
/// attempts are made for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries_same_server: u32,
    pub max_retries_next_server: u32,
    pub retry_on_all_operations: bool,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_same_server: 0,
            max_retries_next_server: 1,
            retry_on_all_operations: false,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    /// One attempt, never retried
    pub fn no_retries() -> Self {
        Self {
            max_retries_same_server: 0,
            max_retries_next_server: 0,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upper bound on attempts for one dispatch
    pub fn max_attempts(&self) -> u32 {
        self.max_retries_same_server
            .saturating_add(1)
            .saturating_mul(self.max_retries_next_server.saturating_add(1))
    }

    /// Whether `err` from a `method` call may be retried at all
    pub fn is_retriable(&self, method: &Method, err: &DispatchError) -> bool {
        match err {
            DispatchError::Transport(e) => {
                e.is_connect_failure()
                    || (e.is_transient() && (self.retry_on_all_operations || is_idempotent(method)))
            }
            _ => false,
        }
    }

    /// Next step given the retries already spent, or `None` once the bound is reached
    pub fn next_step(&self, same_server_retries: u32, next_server_retries: u32) -> Option<RetryStep> {
        if same_server_retries < self.max_retries_same_server {
            Some(RetryStep::SameServer)
        } else if next_server_retries < self.max_retries_next_server {
            Some(RetryStep::NextServer)
        } else {
            None
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let base = Duration::from_millis(config.backoff_ms);
        let backoff = if base.is_zero() {
            Backoff::None
        } else if config.exponential {
            Backoff::Exponential {
                base,
                max: Duration::from_millis(config.max_backoff_ms.max(config.backoff_ms)),
                jitter: config.jitter,
            }
        } else {
            Backoff::Fixed(base)
        };

        Self {
            max_retries_same_server: config.max_retries_same_server,
            max_retries_next_server: config.max_retries_next_server,
            retry_on_all_operations: config.retry_on_all_operations,
            backoff,
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
        Method::DELETE,
        Method::TRACE,
    ]
    .contains(method)
}
