//! # clock
//!
//! why: give the node actor cancellable one-shot and periodic timers on the
//!      runtime's monotonic clock, so tests can run them in paused time
//! relations: used by server.rs for election, heartbeat and gossip timing
//! what: randomized election timeouts, ElectionTimer, Periodic, sleep helper

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range (ms, inclusive)
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// A one-shot timer re-armed with a fresh random timeout on every reset.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Option<Instant>,
}

impl ElectionTimer {
    /// Creates an armed timer.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let mut timer = Self { min_ms, max_ms, deadline: None };
        timer.reset();
        timer
    }

    /// Re-arms the timer from now with a new randomized timeout.
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + random_election_timeout(self.min_ms, self.max_ms));
    }

    /// Disarms the timer; `deadline` returns None until the next reset.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// A fixed-period timer. Ticks that were missed are not replayed.
#[derive(Debug, Clone)]
pub struct Periodic {
    period: Duration,
    next: Option<Instant>,
}

impl Periodic {
    /// Creates a timer whose first tick is one period from now.
    pub fn new(period: Duration) -> Self {
        Self { period, next: Some(Instant::now() + period) }
    }

    /// Creates a disarmed timer.
    pub fn stopped(period: Duration) -> Self {
        Self { period, next: None }
    }

    /// Records a tick and schedules the next one.
    pub fn advance(&mut self) {
        if self.next.is_some() {
            self.next = Some(Instant::now() + self.period);
        }
    }

    pub fn cancel(&mut self) {
        self.next = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next
    }
}

/// Sleeps until the deadline, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
