use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

/// Exponential retry policy shared by the HTTP transport and the event
/// stream reconnect loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first request.
    #[serde(default)]
    pub max_retries: u32,
    /// Initial backoff before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Exponential multiplier per retry step.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed backoff (before jitter).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound of the uniform random delay added to each backoff.
    #[serde(default)]
    pub jitter_ms: u64,
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transport()
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: 0,
        }
    }

    /// Policy applied to every outbound API call: 9 retries (10 attempts).
    pub fn transport() -> Self {
        Self::exponential(9, 500, 2.0).with_jitter_ms(500)
    }

    /// Backoff layered on top of the server's SSE `retry` hint. Unbounded
    /// retries; the caller's subscription budget bounds the overall work.
    pub fn stream_reconnect() -> Self {
        Self::exponential(u32::MAX, 100, 2.0)
            .with_max_backoff_ms(5_000)
            .with_jitter_ms(1_000)
    }

    pub fn exponential(max_retries: u32, initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        let initial = if initial_backoff_ms == 0 {
            default_initial_backoff_ms()
        } else {
            initial_backoff_ms
        };
        let factor = if backoff_factor <= 0.0 {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self {
            max_retries,
            initial_backoff_ms: initial,
            backoff_factor: factor,
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: 0,
        }
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms.max(1);
        self
    }

    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff_duration(&self, retries_done: u32) -> Duration {
        if self.max_retries == 0 {
            return Duration::ZERO;
        }
        let exponent = retries_done.min(i32::MAX as u32) as i32;
        let exp = self.backoff_factor.powi(exponent);
        let base = (self.initial_backoff_ms as f64 * exp).round();
        let clamped = if base.is_finite() {
            (base as u64).min(self.max_backoff_ms.max(1))
        } else {
            self.max_backoff_ms.max(1)
        };
        Duration::from_millis(clamped)
    }

    /// `backoff_duration` plus a uniform random jitter in `[0, jitter_ms]`.
    pub fn jittered_backoff(&self, retries_done: u32) -> Duration {
        let base = self.backoff_duration(retries_done);
        if self.jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        base + Duration::from_millis(jitter)
    }
}

/// Parses a `Retry-After` header: delta-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
