//! Admission gates
//!
//! Both gates are pure state machines over `Instant`s so they can be driven
//! by the limiter under a lock and tested without a runtime.

use std::time::Duration;

use tokio::time::Instant;

use super::config::{DAILY_WINDOW, QuotaConfig};

/// Short-interval gate
///
/// Tracks the theoretical arrival time of the next admission. With a
/// tolerance of `(capacity - 1) * interval` the gate behaves as a reservoir
/// of `capacity` tokens refilled one per `interval`; with zero tolerance it
/// enforces fixed spacing.
#[derive(Debug)]
pub(crate) struct ShortGate {
    interval: Duration,
    tolerance: Duration,
    capacity: u32,
    tat: Instant,
    cap_spacing: Option<Duration>,
    last_admit: Option<Instant>,
}

impl ShortGate {
    pub(crate) fn new(config: &QuotaConfig, now: Instant) -> Self {
        if config.burst_allowed {
            let interval = config.period() / config.queries_per_period;
            Self {
                interval,
                tolerance: interval * (config.queries_per_period - 1),
                capacity: config.queries_per_period,
                tat: now,
                cap_spacing: config.cap_spacing(),
                last_admit: None,
            }
        } else {
            Self {
                interval: config.steady_spacing(),
                tolerance: Duration::ZERO,
                capacity: 1,
                tat: now,
                cap_spacing: None,
                last_admit: None,
            }
        }
    }

    /// Time until the next admission is allowed, zero if allowed now
    pub(crate) fn wait(&self, now: Instant) -> Duration {
        let reservoir = self.tat.saturating_duration_since(now + self.tolerance);
        let spacing = match (self.cap_spacing, self.last_admit) {
            (Some(spacing), Some(last)) => (last + spacing).saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        reservoir.max(spacing)
    }

    pub(crate) fn consume(&mut self, now: Instant) {
        self.tat = self.tat.max(now) + self.interval;
        self.last_admit = Some(now);
    }

    /// Empty the reservoir and hold admissions for `retry_after`
    pub(crate) fn drain(&mut self, now: Instant, retry_after: Duration) {
        self.tat = self.tat.max(now + retry_after + self.tolerance);
    }

    /// Whole tokens currently available
    pub(crate) fn tokens(&self, now: Instant) -> u32 {
        let full_at = self.tat.checked_sub(self.interval * self.capacity);
        match full_at {
            Some(empty_since) if now > empty_since => {
                let earned = now.duration_since(empty_since).as_nanos() / self.interval.as_nanos().max(1);
                earned.min(self.capacity as u128) as u32
            }
            Some(_) => 0,
            None => self.capacity,
        }
    }
}

/// Daily reservoir, refilled to full once per 24h window anchored at creation
#[derive(Debug)]
pub(crate) struct DailyReservoir {
    capacity: u64,
    remaining: u64,
    window_start: Instant,
}

impl DailyReservoir {
    pub(crate) fn new(capacity: u64, now: Instant) -> Self {
        Self {
            capacity,
            remaining: capacity,
            window_start: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= DAILY_WINDOW {
            let windows = (elapsed.as_nanos() / DAILY_WINDOW.as_nanos()) as u32;
            self.window_start += DAILY_WINDOW * windows;
            self.remaining = self.capacity;
        }
    }

    /// Time until a token is available, zero if one is available now
    pub(crate) fn wait(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.remaining > 0 {
            Duration::ZERO
        } else {
            self.next_refill().saturating_duration_since(now)
        }
    }

    pub(crate) fn consume(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining
    }

    pub(crate) fn next_refill(&self) -> Instant {
        self.window_start + DAILY_WINDOW
    }
}
