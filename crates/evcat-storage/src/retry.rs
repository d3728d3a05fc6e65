//! Failure classification and exponential backoff with jitter.

use std::time::Duration;

use evcat_core::{SourceError, SourceErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    RateLimited,
    Permanent,
}

impl FailureClass {
    pub fn of(err: &SourceError) -> Self {
        match err.kind {
            SourceErrorKind::Network | SourceErrorKind::Timeout => FailureClass::Transient,
            SourceErrorKind::RateLimited => FailureClass::RateLimited,
            SourceErrorKind::Auth | SourceErrorKind::Parse => FailureClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(FailureClass),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Up to this fraction of the backoff is added as random jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff before retry number `retry_index` (0-based), without jitter.
    pub fn backoff_for(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs = self.base_delay().as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay())
            .min(self.max_delay())
    }

    /// `attempts_made` counts the attempt that just failed.
    pub fn decide(&self, attempts_made: u32, err: &SourceError) -> RetryDecision {
        let class = FailureClass::of(err);
        if class == FailureClass::Permanent || attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp(class);
        }

        let delay = self.jittered(self.backoff_for(attempts_made.saturating_sub(1)));
        match (class, err.retry_after) {
            (FailureClass::RateLimited, Some(hint)) => RetryDecision::RetryAfter(delay.max(hint)),
            _ => RetryDecision::RetryAfter(delay),
        }
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        let span = backoff.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if span <= 0.0 {
            return backoff;
        }
        let extra = rand::rng().random_range(0.0..=span);
        (backoff + Duration::from_secs_f64(extra)).min(self.max_delay())
    }
}
