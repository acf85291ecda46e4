//! Retry strategies and backoff policies for registry I/O.
//!
//! Used by the registry client's 5xx/429 backoff (bounded retry count,
//! exponential with jitter by default). Kept as a standalone crate because
//! it has no dependency on the rest of the domain and is independently
//! testable.
//!
//! # Example
//!
//! ```
//! use captn_retry::{RetryPolicy, calculate_delay};
//!
//! let config = RetryPolicy::Default.to_config();
//! let delay = calculate_delay(&config, 2);
//! println!("retry after: {:?}", delay);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately.
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt.
    Linear,
    /// Constant delay: same delay every attempt.
    Constant,
}

/// Predefined retry policies. `Default` matches the spec's "bounded retry
/// count (default 3)" for registry 5xx/429 backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    Default,
    Aggressive,
    Conservative,
    Custom,
}

impl RetryPolicy {
    pub fn to_config(&self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(20),
                jitter: 0.4,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 2,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = none, 1.0 = full jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        RetryPolicy::Default.to_config()
    }
}

/// Whether a failure should be retried at all. The registry client
/// distinguishes transient failures (worth another attempt) from terminal
/// ones (`AuthFailed`, malformed-protocol) that retrying cannot fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    #[default]
    Transient,
    Terminal,
}

/// Calculate the delay before the next attempt (1-indexed `attempt`).
///
/// ```
/// use captn_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Exponential,
///     max_attempts: 5,
///     base_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
/// };
/// assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
/// assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.3 means delay * (0.7 to 1.3).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::thread_rng();
    let random_value: f64 = rng.r#gen();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Should this attempt be retried given the error class and attempt count?
pub fn should_retry(config: &RetryStrategyConfig, class: ErrorClass, attempt: u32) -> bool {
    class == ErrorClass::Transient && attempt < config.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_caps_at_three_attempts() {
        let config = RetryPolicy::Default.to_config();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.strategy, RetryStrategyType::Exponential);
    }

    #[test]
    fn calculate_delay_exponential_no_jitter() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(60));
    }

    #[test]
    fn calculate_delay_linear() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(3));
        assert_eq!(calculate_delay(&config, 15), Duration::from_secs(10));
    }

    #[test]
    fn calculate_delay_constant() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 9), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.3,
            max_attempts: 10,
        };
        for _ in 0..200 {
            let delay = calculate_delay(&config, 1);
            assert!(delay >= Duration::from_millis(7000));
            assert!(delay <= Duration::from_millis(13000));
        }
    }

    #[test]
    fn should_retry_respects_class_and_attempt_ceiling() {
        let config = RetryPolicy::Default.to_config();
        assert!(should_retry(&config, ErrorClass::Transient, 1));
        assert!(!should_retry(&config, ErrorClass::Transient, 3));
        assert!(!should_retry(&config, ErrorClass::Terminal, 1));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn exponential_delay_never_exceeds_max(
                base_ms in 1u64..5000,
                max_ms in 1u64..60000,
                attempt in 1u32..40,
            ) {
                let config = RetryStrategyConfig {
                    strategy: RetryStrategyType::Exponential,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(max_ms),
                    jitter: 0.0,
                    max_attempts: 40,
                };
                let delay = calculate_delay(&config, attempt);
                prop_assert!(delay.as_millis() as u64 <= max_ms);
            }

            #[test]
            fn exponential_delay_monotone_until_capped(base_ms in 1u64..1000, attempt in 1u32..16) {
                let config = RetryStrategyConfig {
                    strategy: RetryStrategyType::Exponential,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_secs(3600),
                    jitter: 0.0,
                    max_attempts: 40,
                };
                let a = calculate_delay(&config, attempt);
                let b = calculate_delay(&config, attempt + 1);
                prop_assert!(b >= a);
            }
        }
    }
}
