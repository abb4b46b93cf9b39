// src/sdcp/backoff.rs - Reconnect cooldown state
use std::time::{Duration, Instant};

/// Per-connection backoff: HEALTHY while `next_retry` has passed,
/// COOLING_DOWN otherwise.
#[derive(Debug, Clone)]
pub struct ConnectionBackoff {
    attempts: u32,
    next_retry: Option<Instant>,
    base: Duration,
    cap: Duration,
}

impl ConnectionBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempts: 0,
            next_retry: None,
            base,
            cap,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    /// Cooldown for the current attempt count, `min(cap, base * 2^attempts)`.
    pub fn delay(&self) -> Duration {
        self.base.saturating_mul(1u32 << self.attempts.min(16)).min(self.cap)
    }

    /// Records a failed connect at `now`.
    pub fn record_failure(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        let candidate = now + self.delay();
        // never move the cooldown backwards
        self.next_retry = Some(match self.next_retry {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        });
    }

    /// Time left before another attempt is allowed, if cooling down.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_retry
            .filter(|next| *next > now)
            .map(|next| next - now)
    }

    pub fn is_cooling_down(&self, now: Instant) -> bool {
        self.remaining(now).is_some()
    }

    /// Called after a verified round trip.
    pub fn reset(&mut self) {
        if self.attempts > 0 {
            tracing::debug!("Connection healthy again after {} failed attempt(s)", self.attempts);
        }
        self.attempts = 0;
        self.next_retry = None;
    }
}

impl Default for ConnectionBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}
