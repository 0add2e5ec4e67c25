//! Work queue for reconcile keys.
//!
//! A key is in at most one of three places: ready to run, waiting for a
//! delay to expire, or in flight. Keys added while in flight are marked
//! dirty and run again once the current pass finishes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// First retry delay after a failed reconcile.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Upper bound on the retry delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Delay before retry number `failures` (1-based).
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX)
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    delayed: HashMap<String, Instant>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key to run as soon as possible.
    pub fn add(&mut self, key: &str) {
        if self.in_flight.contains(key) {
            self.dirty.insert(key.to_string());
            return;
        }
        self.delayed.remove(key);
        if self.queued.insert(key.to_string()) {
            self.ready.push_back(key.to_string());
        }
    }

    /// Queue a key to run no earlier than `at`. An earlier pending run wins.
    pub fn add_at(&mut self, key: &str, at: Instant) {
        if self.queued.contains(key) {
            return;
        }
        self.delayed
            .entry(key.to_string())
            .and_modify(|existing| *existing = (*existing).min(at))
            .or_insert(at);
    }

    /// Take the next runnable key and mark it in flight.
    pub fn pop(&mut self, now: Instant) -> Option<String> {
        self.promote_due(now);
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Finish an in-flight key. `retry_after` schedules the next run.
    pub fn done(&mut self, key: &str, retry_after: Option<Duration>, now: Instant) {
        self.in_flight.remove(key);
        if let Some(delay) = retry_after {
            self.add_at(key, now + delay);
        }
        if self.dirty.remove(key) {
            self.add(key);
        }
    }

    /// Record a failed pass and return the backoff delay to use.
    pub fn record_failure(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        *failures += 1;
        backoff_delay(*failures)
    }

    pub fn record_success(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Earliest instant at which a delayed key becomes runnable.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, key.clone()))
            .collect();
        due.sort();
        for (_, key) in due {
            self.delayed.remove(&key);
            if self.queued.insert(key.clone()) {
                self.ready.push_back(key);
            }
        }
    }
}
