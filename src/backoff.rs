//! Delayer which grows its delay by a multiplier on every call.

use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Delay starts at `current_delay` and is multiplied by `multiplier` after
/// every [`BackoffDelayer::delay`] call until `max_delay` is reached.
#[derive(Debug, Clone)]
pub struct BackoffDelayer {
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f32,
}

impl BackoffDelayer {
    pub fn new(starting_delay: Duration, multiplier: f32, max_delay: Duration) -> Self {
        Self {
            current_delay: starting_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
        }
    }

    pub fn from_policy(policy: &ReconnectPolicy) -> Self {
        Self::new(policy.initial_delay(), policy.multiplier, policy.max_delay())
    }

    /// Returns the delay to wait now and advances to the next one.
    pub fn next_delay(&mut self) -> Duration {
        if self.current_delay >= self.max_delay {
            return self.max_delay;
        }
        let delay = self.current_delay;
        self.current_delay = self
            .current_delay
            .mul_f64(f64::from(self.multiplier))
            .min(self.max_delay);
        delay
    }

    pub async fn delay(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
