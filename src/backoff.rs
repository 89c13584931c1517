/// Retry schedule for reaching the container.
///
/// Each failed attempt doubles (by `multiplier`) the wait before the next
/// one, up to `max_delay`, for at most `max_attempts` attempts.
use std::time::Duration;

use crate::config::ReconnectConfig;

pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier.max(1),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Records a failed attempt. Returns how long to wait before retrying,
    /// or `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay;
        self.delay = (self.delay * self.multiplier).min(self.max_delay);
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u64, max: u64, multiplier: u32, attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_secs: initial,
            max_delay_secs: max,
            multiplier,
            max_attempts: attempts,
        }
    }

    #[test]
    fn test_default_schedule() {
        let mut b = Backoff::new(&ReconnectConfig::default());
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().unwrap().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut b = Backoff::new(&config(1, 10, 2, 3));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempt(), 3);
    }

    #[test]
    fn test_zero_multiplier_keeps_delay() {
        let mut b = Backoff::new(&config(3, 60, 0, 10));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(3)));
    }
}
