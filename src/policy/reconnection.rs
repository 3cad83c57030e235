use std::{fmt, time::Duration};

use rand::Rng;

use crate::config::ReconnectionConfig;

/// Produces the delays between successive reconnection attempts to one node.
pub trait ReconnectionPolicy: Send + Sync + fmt::Debug {
    /// A fresh, unbounded schedule, started each time a node loses a connection.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

pub trait ReconnectionSchedule: Send {
    fn next_delay(&mut self) -> Duration;
}

/// `base * 2^attempt`, capped at `max`, with ±15% jitter, never leaving
/// `[base, max]`.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base: Duration,
    max: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before jitter for the given attempt.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

impl From<&ReconnectionConfig> for ExponentialReconnectionPolicy {
    fn from(value: &ReconnectionConfig) -> Self {
        Self::new(value.base_delay, value.max_delay)
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            policy: self.clone(),
            attempt: 0,
        })
    }
}

struct ExponentialSchedule {
    policy: ExponentialReconnectionPolicy,
    attempt: u32,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let raw = self.policy.raw_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter: f64 = rand::thread_rng().gen_range(-0.15..=0.15);
        raw.mul_f64(1.0 + jitter)
            .clamp(self.policy.base, self.policy.max)
    }
}

/// Always the same delay.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule(self.delay))
    }
}

struct ConstantSchedule(Duration);

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_delay_doubles_up_to_the_ceiling() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.raw_delay(0), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(8));
        assert_eq!(policy.raw_delay(6), Duration::from_secs(60));
        assert_eq!(policy.raw_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let mut schedule = ExponentialReconnectionPolicy::new(base, max).new_schedule();

        for attempt in 0..40u32 {
            let raw = ExponentialReconnectionPolicy::new(base, max).raw_delay(attempt);
            let delay = schedule.next_delay();

            assert!(delay >= base && delay <= max, "{delay:?} out of bounds");
            assert!(delay >= raw.mul_f64(0.85).max(base));
            assert!(delay <= raw.mul_f64(1.15).min(max));
        }
    }

    #[test]
    fn schedules_are_independent() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(1));
        let mut first = policy.new_schedule();
        for _ in 0..5 {
            first.next_delay();
        }

        assert_eq!(policy.new_schedule().next_delay(), Duration::from_secs(1));
    }
}
