//! Retry policies
//!
//! Exponential backoff with multiplicative jitter. Policies are plain data;
//! callers drive the loop and pass the attempt number so the policy itself
//! stays stateless and shareable.

use std::time::Duration;

/// An exponential backoff policy with jitter and a bounded try count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    factor: f64,
    max_tries: usize,
    jitter: f64,
}

impl RetryPolicy {
    /// Backoff starting at `initial`, multiplying by `factor`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration, factor: f64) -> Self {
        Self { initial, max, factor, max_tries: usize::MAX, jitter: 0.0 }
    }

    /// Bound the number of tries; `wait` returns `None` from try `n` on.
    pub fn with_max_tries(mut self, n: usize) -> Self {
        self.max_tries = n;
        self
    }

    /// Multiplicative jitter fraction in `[0, 1)`: each wait is scaled by a
    /// uniform factor in `[1 - j, 1 + j]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// The wait before retry number `attempt` (0-based), or `None` once the
    /// policy is exhausted.
    pub fn wait(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_tries {
            return None;
        }
        let base = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let mut wait = base.min(self.max.as_secs_f64());
        if self.jitter > 0.0 {
            let r: f64 = rand::Rng::gen(&mut rand::thread_rng());
            wait *= 1.0 - self.jitter + 2.0 * self.jitter * r;
        }
        Some(Duration::from_secs_f64(wait))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(30), 2.0)
            .with_max_tries(8)
            .with_jitter(0.2)
    }
}
