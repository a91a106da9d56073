use crate::clock::Clock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(80),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// Bounded retry with exponential backoff. Waiting goes through the
/// injected clock.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Run `f` until `done` accepts its output or attempts run out, returning
    /// the last output either way.
    pub async fn repeat_until<F, Fut, T, D>(&self, mut f: F, done: D) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        D: Fn(&T) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_delay;
        let mut attempt = 1;

        loop {
            let output = f(attempt).await;
            if done(&output) {
                debug!("Condition met on attempt {}", attempt);
                return output;
            }
            if attempt >= max_attempts {
                warn!("Condition still unmet after {} attempts", max_attempts);
                return output;
            }
            debug!("Attempt {} not done, waiting {:?}", attempt, delay);
            self.clock.sleep(delay).await;
            delay = self.calculate_next_delay(delay);
            attempt += 1;
        }
    }

    fn calculate_next_delay(&self, current_delay: Duration) -> Duration {
        let mut next_delay =
            Duration::from_secs_f64(current_delay.as_secs_f64() * self.config.exponential_base);

        if self.config.jitter {
            let jitter_amount = next_delay.as_secs_f64() * 0.1 * rand::random::<f64>();
            next_delay = Duration::from_secs_f64(next_delay.as_secs_f64() + jitter_amount);
        }

        if next_delay > self.config.max_delay {
            next_delay = self.config.max_delay;
        }

        next_delay
    }
}
