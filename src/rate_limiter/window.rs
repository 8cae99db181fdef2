//! Rolling usage history and token bucket primitives

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Trailing window a ceiling applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    /// Trailing 60 seconds
    Minute,
    /// Trailing hour
    Hour,
    /// Trailing 24 hours
    Day,
}

impl LimitWindow {
    /// Window length
    pub fn duration(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
        }
    }
}

/// What a ceiling counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMetric {
    /// Admitted requests
    Requests,
    /// Consumed tokens
    Tokens,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    requests: u64,
    tokens: u64,
}

impl Entry {
    fn value(&self, metric: LimitMetric) -> u64 {
        match metric {
            LimitMetric::Requests => self.requests,
            LimitMetric::Tokens => self.tokens,
        }
    }
}

/// Timestamped admissions covering the longest window (one day)
#[derive(Debug, Default)]
pub(crate) struct UsageHistory {
    entries: VecDeque<Entry>,
}

impl UsageHistory {
    pub(crate) fn record(&mut self, now: Instant, requests: u64, tokens: u64) {
        if requests == 0 && tokens == 0 {
            return;
        }
        self.entries.push_back(Entry {
            at: now,
            requests,
            tokens,
        });
    }

    pub(crate) fn prune(&mut self, now: Instant) {
        let horizon = LimitWindow::Day.duration();
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) >= horizon {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn in_window(&self, now: Instant, window: LimitWindow) -> impl Iterator<Item = &Entry> {
        let span = window.duration();
        self.entries
            .iter()
            .filter(move |e| now.saturating_duration_since(e.at) < span)
    }

    /// Sum of `metric` inside the trailing window
    pub(crate) fn used(&self, now: Instant, window: LimitWindow, metric: LimitMetric) -> u64 {
        self.in_window(now, window).map(|e| e.value(metric)).sum()
    }

    /// Time until the oldest in-window entry ages out
    pub(crate) fn reset_in(&self, now: Instant, window: LimitWindow) -> Duration {
        self.in_window(now, window)
            .next()
            .map(|e| (e.at + window.duration()).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Time until `need` more units fit under `limit`, or `None` if they fit now.
    ///
    /// A demand larger than the limit itself can never fit; the full window
    /// length is returned in that case.
    pub(crate) fn wait_for_headroom(
        &self,
        now: Instant,
        window: LimitWindow,
        metric: LimitMetric,
        limit: u64,
        need: u64,
    ) -> Option<Duration> {
        let mut total = self.used(now, window, metric);
        if total.saturating_add(need) <= limit {
            return None;
        }
        if need > limit {
            return Some(window.duration());
        }
        for entry in self.in_window(now, window) {
            total = total.saturating_sub(entry.value(metric));
            if total + need <= limit {
                return Some((entry.at + window.duration()).saturating_duration_since(now));
            }
        }
        Some(window.duration())
    }
}

/// Continuously refilling admission pool
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(capacity: u32, per_minute: u32, now: Instant) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: per_minute as f64 / 60.0,
            last_refill: now,
        }
    }

    pub(crate) fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub(crate) fn available(&self) -> f64 {
        self.tokens
    }

    pub(crate) fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    pub(crate) fn time_until_token(&self) -> Duration {
        if self.has_token() || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
    }

    pub(crate) fn consume(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    pub(crate) fn fill(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }
}
