use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Backoff schedule for transient stage failures.
///
/// `retry_count` counts failed attempts. Once it reaches `max_retries` the
/// envelope is dead-lettered; otherwise the stage is re-entered after
/// `base_delay_ms * multiplier^(retry_count - 1)`, capped at `max_delay_ms`
/// and spread by `jitter_ratio`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Delay before the attempt following failure number `retry_count`,
    /// without jitter.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        jittered_duration(self.calculate_delay(retry_count), self.jitter_ratio)
    }
}

pub(crate) fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }

    // Uuid v4 bytes double as a jitter source.
    let bytes = *Uuid::new_v4().as_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    let unit = (u64::from_le_bytes(head) as f64) / (u64::MAX as f64); // [0,1]
    let signed = unit * 2.0 - 1.0; // [-1,1]
    let factor = (1.0 + signed * jitter_ratio.min(1.0)).max(0.0);
    base.mul_f64(factor)
}
