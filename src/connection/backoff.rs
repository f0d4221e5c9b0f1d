// src/connection/backoff.rs

//! Reconnect delay schedules with jitter.

use rand::Rng;
use std::time::Duration;

/// Jitter added to every delay to avoid thundering herds on server restart.
const MAX_JITTER_MS: u64 = 500;

/// Tracks the retry count across connection attempts and turns it into a
/// delay from the given schedule, saturating at the schedule's last entry.
#[derive(Debug, Default)]
pub struct Backoff {
    retries: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Default::default()
    }

    /// The next delay, advancing the retry count.
    pub fn next_delay(&mut self, schedule: &[Duration]) -> Duration {
        let index = (self.retries as usize).min(schedule.len().saturating_sub(1));
        self.retries += 1;
        let base = schedule.get(index).copied().unwrap_or(Duration::ZERO);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS));
        base + jitter
    }

    /// Resets after a successful connection (or a manual reconnect).
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
