//! Backoff strategies
//!
//! Pure functions from attempt index to wait duration. The jitter variant
//! draws from a process-wide generator behind a mutex so concurrent retriers
//! never share an RNG unsynchronized.

use std::sync::LazyLock;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::Error;

static JITTER_RNG: LazyLock<Mutex<StdRng>> = LazyLock::new(|| Mutex::new(StdRng::from_entropy()));

/// Delay policy between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed { interval_ms: u64 },

    /// `base_delay + uniform(0..=max_jitter)`
    Jitter { base_delay_ms: u64, max_jitter_ms: u64 },

    /// `min(base_delay * factor^attempt, max_delay)`
    Exponential {
        base_delay_ms: u64,
        factor: f64,
        max_delay_ms: u64,
    },
}

impl BackoffStrategy {
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed {
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn jitter(base_delay: Duration, max_jitter: Duration) -> Self {
        Self::Jitter {
            base_delay_ms: base_delay.as_millis() as u64,
            max_jitter_ms: max_jitter.as_millis() as u64,
        }
    }

    pub fn exponential(base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self::Exponential {
            base_delay_ms: base_delay.as_millis() as u64,
            factor,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay to wait after the failed attempt with index `attempt` (0-based)
    pub fn next(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            Self::Jitter {
                base_delay_ms,
                max_jitter_ms,
            } => {
                let jitter = if max_jitter_ms == 0 {
                    0
                } else {
                    JITTER_RNG.lock().gen_range(0..=max_jitter_ms)
                };
                Duration::from_millis(base_delay_ms.saturating_add(jitter))
            }
            Self::Exponential {
                base_delay_ms,
                factor,
                max_delay_ms,
            } => {
                let exp = attempt.min(i32::MAX as u32) as i32;
                let delay = (base_delay_ms as f64 * factor.powi(exp)).min(max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        match *self {
            Self::Fixed { interval_ms } => {
                if interval_ms == 0 {
                    return Err(Error::config("fixed backoff interval must be positive"));
                }
            }
            Self::Jitter { base_delay_ms, .. } => {
                if base_delay_ms == 0 {
                    return Err(Error::config("jitter backoff base delay must be positive"));
                }
            }
            Self::Exponential {
                base_delay_ms,
                factor,
                max_delay_ms,
            } => {
                if base_delay_ms == 0 {
                    return Err(Error::config(
                        "exponential backoff base delay must be positive",
                    ));
                }
                if !factor.is_finite() || factor <= 1.0 {
                    return Err(Error::config(format!(
                        "exponential backoff factor must be greater than 1.0, got {}",
                        factor
                    )));
                }
                if max_delay_ms < base_delay_ms {
                    return Err(Error::config(format!(
                        "exponential backoff max delay ({}ms) is below base delay ({}ms)",
                        max_delay_ms, base_delay_ms
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_delay_ms: 500,
            factor: 2.0,
            max_delay_ms: 10_000,
        }
    }
}
