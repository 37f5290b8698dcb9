//! Adaptive pacing and retry for one external source.
//!
//! The inter-call delay is not enforced until the source pushes back. Each
//! rate-limit signal multiplies the delay (up to a cap) and turns pacing on;
//! a run of consecutive successes divides it again, and pacing switches off
//! once the delay is back at the floor.

use std::future::Future;
use std::time::{Duration, Instant};

use paperflow_shared::{ErrorKind, StageError, ThrottleConfig};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tuning for a [`SourceController`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    pub floor: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub relax_after: u32,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl From<&ThrottleConfig> for ThrottlePolicy {
    fn from(cfg: &ThrottleConfig) -> Self {
        Self {
            floor: Duration::from_millis(cfg.floor_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.floor_ms)),
            backoff_factor: cfg.backoff_factor.max(1.0),
            relax_after: cfg.relax_after.max(1),
            max_attempts: cfg.max_attempts.max(1),
            retry_base: Duration::from_millis(cfg.retry_base_ms),
            retry_max: Duration::from_millis(cfg.retry_max_ms.max(cfg.retry_base_ms)),
        }
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::from(&ThrottleConfig::default())
    }
}

/// Point-in-time view of the controller, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSnapshot {
    pub delay: Duration,
    pub enforcing: bool,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct ThrottleState {
    delay: Duration,
    enforcing: bool,
    consecutive_successes: u32,
    last_call: Option<Instant>,
}

/// Rate and retry controller shared by every stage that talks to one source.
#[derive(Debug)]
pub struct SourceController {
    name: String,
    policy: ThrottlePolicy,
    state: Mutex<ThrottleState>,
}

impl SourceController {
    pub fn new(name: impl Into<String>, policy: ThrottlePolicy) -> Self {
        let state = ThrottleState {
            delay: policy.floor,
            enforcing: false,
            consecutive_successes: 0,
            last_call: None,
        };
        Self {
            name: name.into(),
            policy,
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    pub async fn snapshot(&self) -> ThrottleSnapshot {
        let state = self.state.lock().await;
        ThrottleSnapshot {
            delay: state.delay,
            enforcing: state.enforcing,
            consecutive_successes: state.consecutive_successes,
        }
    }

    /// Run `op`, pacing each attempt and retrying kinds listed in `transient`
    /// with exponential backoff. The returned error carries the attempt count.
    pub async fn call<T, F, Fut>(&self, transient: &[ErrorKind], mut op: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        let mut backoff = self.policy.retry_base;

        loop {
            attempt += 1;
            self.pace().await;

            let err = match op().await {
                Ok(value) => {
                    self.on_success().await;
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.kind == ErrorKind::RateLimited {
                self.on_rate_limited(err.retry_after).await;
            }

            if !err.is_retryable(transient) {
                return Err(err.with_attempts(attempt));
            }
            if attempt >= self.policy.max_attempts {
                warn!(source = %self.name, attempts = attempt, error = %err, "retries exhausted");
                return Err(err.with_attempts(attempt));
            }

            let wait = err
                .retry_after
                .map_or(backoff, |hint| hint.min(self.policy.retry_max));
            debug!(source = %self.name, attempt, ?wait, error = %err, "retrying");
            tokio::time::sleep(wait).await;
            backoff = backoff.saturating_mul(2).min(self.policy.retry_max);
        }
    }

    /// Wait out the enforced delay since the previous call, if pacing is on.
    async fn pace(&self) {
        let mut state = self.state.lock().await;

        if state.enforcing {
            if let Some(last) = state.last_call {
                let elapsed = last.elapsed();
                if elapsed < state.delay {
                    let wait = state.delay - elapsed;
                    debug!(source = %self.name, ?wait, "pacing");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        state.last_call = Some(Instant::now());
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_successes += 1;

        if state.enforcing && state.consecutive_successes >= self.policy.relax_after {
            state.consecutive_successes = 0;
            state.delay =
                scale(state.delay, 1.0 / self.policy.backoff_factor).max(self.policy.floor);
            if state.delay <= self.policy.floor {
                state.enforcing = false;
            }
            debug!(source = %self.name, delay = ?state.delay, enforcing = state.enforcing, "relaxing");
        }
    }

    async fn on_rate_limited(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().await;
        state.consecutive_successes = 0;

        let mut delay = scale(state.delay.max(self.policy.floor), self.policy.backoff_factor);
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        state.delay = delay.min(self.policy.max_delay);
        state.enforcing = true;
        warn!(source = %self.name, delay = ?state.delay, "rate limited, slowing down");
    }
}

/// Multiply a duration, rounding to whole nanoseconds.
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::from_nanos((d.as_nanos() as f64 * factor).round() as u64)
}
