//! Bounded exponential backoff for region errors.
//!
//! A [`Backoffer`] tracks retries for a single key. The scanner creates one
//! per cursor position and resets it once the key is confirmed.

use std::time::Duration;

use rand::Rng;

/// Retry policy applied to region errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Maximum number of retries per key; the key is tried at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Backoff factor (exponential)
    pub backoff_factor: f64,
    /// Jitter percentage (0.0 - 1.0)
    pub jitter_percent: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 2,
            max_delay_ms: 500,
            backoff_factor: 2.0,
            jitter_percent: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
            jitter_percent: 0.0,
        }
    }

    /// Validate policy values
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "initial_delay_ms ({}) must be <= max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err("backoff_factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err("jitter_percent must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

/// Per-key retry state.
#[derive(Debug, Clone)]
pub struct Backoffer {
    policy: BackoffPolicy,
    retries: u32,
    delay_ms: u64,
}

impl Backoffer {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            retries: 0,
            delay_ms: policy.initial_delay_ms,
        }
    }

    /// Retries taken so far for the current key.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempts made for the current key, counting the first try.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.policy.max_retries
    }

    /// Consumes one retry and returns how long to wait before it, or `None`
    /// once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.retries += 1;

        let base = self.delay_ms.min(self.policy.max_delay_ms);
        let jitter_range = (base as f64 * self.policy.jitter_percent) as u64;
        let jitter = if jitter_range == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_range)
        };

        self.delay_ms = ((self.delay_ms as f64 * self.policy.backoff_factor) as u64)
            .min(self.policy.max_delay_ms);

        Some(Duration::from_millis(base + jitter))
    }

    /// Starts over for the next key.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.delay_ms = self.policy.initial_delay_ms;
    }
}
