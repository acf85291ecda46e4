//! Verifier (C8): post-start stability observation. See SPEC_FULL.md §4.8.
//!
//! The protocol is poll-based rather than event-driven, matching how the
//! reference stack observes external processes in `process.rs` — a bounded
//! loop with a sleep, not a notification channel.

use std::time::{Duration, Instant};

use crate::container::ContainerDriver;
use crate::types::{ContainerState, HealthState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Stable,
    DidNotStabilize,
}

/// Parameters governing how long to watch and how to poll (§4.8).
#[derive(Debug, Clone, Copy)]
pub struct VerifyPolicy {
    pub stable_time: Duration,
    pub check_interval: Duration,
    pub grace_period: Duration,
    pub max_wait: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        VerifyPolicy {
            stable_time: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(0),
            max_wait: Duration::from_secs(60),
        }
    }
}

fn candidate_stable(state: ContainerState, health: HealthState) -> bool {
    matches!(state, ContainerState::Running)
        && matches!(health, HealthState::None | HealthState::Healthy)
}

/// Watch `id` until it holds a continuous `candidate-stable` window of
/// `stable_time`, plus an additional `grace_period` after that window
/// first closes, bounded by `max_wait`. A restart-policy-driven restart
/// resets the window rather than counting as a failure (§4.8 edge case).
pub fn verify(driver: &dyn ContainerDriver, id: &str, policy: VerifyPolicy) -> VerifyOutcome {
    let start = Instant::now();
    let deadline = start + policy.max_wait;

    let mut stable_since: Option<Instant> = None;
    let mut grace_started: Option<Instant> = None;

    loop {
        if Instant::now() >= deadline {
            return VerifyOutcome::DidNotStabilize;
        }

        let snapshot = driver.inspect(id).ok();
        let now = Instant::now();

        match snapshot {
            Some(c) if candidate_stable(c.state, c.health_state) => {
                let since = *stable_since.get_or_insert(now);
                if now.duration_since(since) >= policy.stable_time {
                    if grace_started.is_none() {
                        grace_started = Some(now);
                    }
                    if let Some(g) = grace_started {
                        if now.duration_since(g) >= policy.grace_period {
                            return VerifyOutcome::Stable;
                        }
                    }
                }
            }
            _ => {
                // Exited, dead, restarting-crash, or unhealthy: reset the
                // window. Disappearance from `inspect` counts the same.
                stable_since = None;
                grace_started = None;
            }
        }

        std::thread::sleep(policy.check_interval.min(Duration::from_millis(50)));
    }
}
