use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential restart delay, capped, reset after a sustained healthy run.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay for the next attempt; every call doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Sliding-window restart budget.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: chrono::Duration,
    restarts: VecDeque<DateTime<Utc>>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5)),
            restarts: VecDeque::new(),
        }
    }

    /// Records a restart at `now` if the window still has room. Returns false
    /// once the budget is exhausted.
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.restarts.len() as u32 >= self.max_restarts {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    pub fn used(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.restarts.len() as u32
    }

    pub fn clear(&mut self) {
        self.restarts.clear();
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self
            .restarts
            .front()
            .map(|timestamp| *timestamp <= cutoff)
            .unwrap_or(false)
        {
            self.restarts.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn budget_exhausts_within_window_and_recovers_after() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut budget = RestartBudget::new(5, Duration::from_secs(300));
        for i in 0..5 {
            assert!(budget.try_consume(start + chrono::Duration::seconds(i * 10)));
        }
        assert!(!budget.try_consume(start + chrono::Duration::seconds(60)));
        assert_eq!(budget.used(start + chrono::Duration::seconds(60)), 5);
        // The first restart leaves the window after five minutes.
        assert!(budget.try_consume(start + chrono::Duration::seconds(301)));
    }
}
