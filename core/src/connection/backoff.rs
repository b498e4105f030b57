//! Reconnect backoff policy
//!
//! The counter is only advanced by the connection manager's own failure and
//! close handlers, and reset on a completed handshake or a manual disconnect.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth curve for successive retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `min(attempt * base, max)`
    Linear,
    /// `min(base * 2^(attempt - 1), max)`
    Exponential,
}

/// Backoff tuning, persisted with the agent settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl BackoffConfig {
    /// One extra second per attempt, plateauing at five seconds
    pub fn linear_short() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_ms: 1_000,
            max_ms: 5_000,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let raw_ms = match self.strategy {
            BackoffStrategy::Linear => self.base_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let shift = std::cmp::min(attempt - 1, 32);
                self.base_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(std::cmp::min(raw_ms, self.max_ms))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_ms: 1_000,
            max_ms: 60_000, // Cap at 60 seconds
        }
    }
}

/// Attempt counter plus the delay chosen for the next retry
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    attempt_count: u32,
    next_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
            next_delay: Duration::ZERO,
        }
    }

    /// Count one more failed attempt and return the delay before retrying
    pub fn record_failure(&mut self) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_delay = self.config.delay_for(self.attempt_count);
        self.next_delay
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.next_delay = Duration::ZERO;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }
}
