//! Retry backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// `base * multiplier^(retry - 1)`
    #[default]
    Exponential,
}

/// Delay between attempts of a failing node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            max: delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            max,
            multiplier,
        }
    }

    /// No delay at all
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Exponential => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = self.multiplier.max(1.0).powi(exponent);
                let millis = self.base.as_millis() as f64 * factor;
                if millis.is_finite() && millis < self.max.as_millis() as f64 {
                    Duration::from_millis(millis as u64)
                } else {
                    self.max
                }
            }
        };
        delay.min(self.max.max(self.base))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(200), Duration::from_secs(30), 2.0)
    }
}
