//! Maintains `{repository, next_poll_time, last_poll_time, poll_count,
//! enabled}` per repository. On each tick of the master interval,
//! repositories whose `next_poll_time <= now` are returned for enqueueing;
//! `advance` then schedules the next tick using the repository's own
//! `poll_interval` override, falling back to the global interval.
//!
//! Avoids a cron library: next-poll-time arithmetic on a per-repo record is
//! simpler and gives per-repo interval overrides for free.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::Repository;

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub repository: String,
    pub next_poll_time: DateTime<Utc>,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub poll_count: u64,
    pub enabled: bool,
    interval: Duration,
    /// Set while a poll for this repository is in flight; the scheduler
    /// will not re-offer it until `mark_done` clears this, enforcing
    /// at-most-one concurrent poll per repository.
    in_flight: bool,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `repository` with its effective interval (its own override
    /// or `default_interval`). A no-op if the repository is disabled, and
    /// idempotent if already scheduled (re-registering updates the interval
    /// without resetting `next_poll_time`, so a config reload doesn't cause
    /// every repo to poll immediately).
    pub fn schedule(&self, repository: &Repository, default_interval: Duration) {
        if !repository.enabled {
            return;
        }
        let interval = repository.poll_interval.unwrap_or(default_interval);
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(repository.name.clone())
            .and_modify(|e| {
                e.interval = interval;
                e.enabled = true;
            })
            .or_insert_with(|| ScheduleEntry {
                repository: repository.name.clone(),
                next_poll_time: Utc::now(),
                last_poll_time: None,
                poll_count: 0,
                enabled: true,
                interval,
                in_flight: false,
            });
    }

    /// Idempotent: removing an unscheduled repository is a no-op.
    pub fn unschedule(&self, repository: &str) {
        self.entries.lock().unwrap().remove(repository);
    }

    /// Returns the names of repositories due for a poll (`next_poll_time <=
    /// now`, not currently in flight) and marks them in-flight.
    pub fn due(&self) -> Vec<String> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            if entry.enabled && !entry.in_flight && entry.next_poll_time <= now {
                entry.in_flight = true;
                due.push(entry.repository.clone());
            }
        }
        due
    }

    /// Advances `repository`'s `next_poll_time` by its interval and clears
    /// in-flight, allowing it to be re-offered on a future tick.
    pub fn mark_done(&self, repository: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(repository) {
            let now = Utc::now();
            entry.last_poll_time = Some(now);
            entry.poll_count += 1;
            entry.next_poll_time = now + chrono::Duration::from_std(entry.interval).unwrap_or(chrono::Duration::zero());
            entry.in_flight = false;
        }
    }

    pub fn snapshot(&self) -> Vec<ScheduleEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}
