//! Per-provider admission control
//!
//! A [`RateLimiter`] admits a request only when every configured ceiling
//! (minute/hour/day, request count and token count) has headroom in its
//! trailing window. Two interchangeable strategies shape the minute budget:
//!
//! - **Token bucket**: a pool sized to `burst_limit` (default
//!   `requests_per_minute`) refilling continuously at `requests_per_minute / 60`
//!   per second, consumed atomically per admission.
//! - **Sliding window**: an exact count of admissions in the trailing 60s.
//!
//! When capacity is exhausted and a queue is configured, requests wait in FIFO
//! order and are granted by a background drain task as capacity frees up, or
//! fail with [`Error::QueueTimeout`] after `queue_timeout_ms`.

mod window;

pub use window::{LimitMetric, LimitWindow};

use crate::background::PeriodicTask;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use window::{TokenBucket, UsageHistory};

/// Admission strategy for the minute budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Continuously refilling token pool
    #[default]
    TokenBucket,
    /// Exact count over the trailing minute
    SlidingWindow,
}

/// How the suggested backoff grows with consecutive rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    /// base × attempt
    Linear,
    /// base × 2^(attempt - 1)
    #[default]
    Exponential,
    /// Always base
    Fixed,
}

impl BackoffStrategy {
    /// Delay before retry `attempt` (1-based)
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed => base,
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(10)),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minute-budget strategy
    pub strategy: RateLimitStrategy,
    /// Request ceiling per trailing minute
    pub requests_per_minute: u32,
    /// Request ceiling per trailing hour
    pub requests_per_hour: Option<u32>,
    /// Request ceiling per trailing day
    pub requests_per_day: Option<u32>,
    /// Token ceiling per trailing minute
    pub tokens_per_minute: Option<u64>,
    /// Token ceiling per trailing hour
    pub tokens_per_hour: Option<u64>,
    /// Token ceiling per trailing day
    pub tokens_per_day: Option<u64>,
    /// Token bucket capacity (defaults to `requests_per_minute`)
    pub burst_limit: Option<u32>,
    /// Maximum queued requests; `None` or 0 rejects instead of queueing
    pub queue_limit: Option<usize>,
    /// Maximum time a queued request waits (ms)
    pub queue_timeout_ms: u64,
    /// How often the queue is drained (ms)
    pub queue_drain_interval_ms: u64,
    /// Backoff growth for repeated rejections
    pub backoff_strategy: BackoffStrategy,
    /// Backoff base delay (ms)
    pub backoff_base_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::TokenBucket,
            requests_per_minute: 60,
            requests_per_hour: None,
            requests_per_day: None,
            tokens_per_minute: None,
            tokens_per_hour: None,
            tokens_per_day: None,
            burst_limit: None,
            queue_limit: None,
            queue_timeout_ms: 30_000,
            queue_drain_interval_ms: 100,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration with the given per-minute request ceiling
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            ..Default::default()
        }
    }

    /// Use the sliding window strategy
    pub fn sliding_window(mut self) -> Self {
        self.strategy = RateLimitStrategy::SlidingWindow;
        self
    }

    /// Enable a bounded queue
    pub fn with_queue(mut self, limit: usize, timeout: Duration) -> Self {
        self.queue_limit = Some(limit);
        self.queue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(Error::config("requests_per_minute must be positive"));
        }
        if self.burst_limit == Some(0) {
            return Err(Error::config("burst_limit must be positive when set"));
        }
        if self.queue_timeout_ms == 0 || self.queue_drain_interval_ms == 0 {
            return Err(Error::config(
                "queue_timeout_ms and queue_drain_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    fn ceilings(&self) -> Vec<(LimitWindow, LimitMetric, u64)> {
        let mut out = vec![(
            LimitWindow::Minute,
            LimitMetric::Requests,
            self.requests_per_minute as u64,
        )];
        let optional = [
            (LimitWindow::Hour, LimitMetric::Requests, self.requests_per_hour.map(u64::from)),
            (LimitWindow::Day, LimitMetric::Requests, self.requests_per_day.map(u64::from)),
            (LimitWindow::Minute, LimitMetric::Tokens, self.tokens_per_minute),
            (LimitWindow::Hour, LimitMetric::Tokens, self.tokens_per_hour),
            (LimitWindow::Day, LimitMetric::Tokens, self.tokens_per_day),
        ];
        out.extend(
            optional
                .into_iter()
                .filter_map(|(w, m, limit)| limit.map(|l| (w, m, l))),
        );
        out
    }

    fn queue_enabled(&self) -> bool {
        self.queue_limit.map(|l| l > 0).unwrap_or(false)
    }
}

/// Usage against one ceiling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowUsage {
    /// Trailing window
    pub window: LimitWindow,
    /// Counted quantity
    pub metric: LimitMetric,
    /// Configured ceiling
    pub limit: u64,
    /// Amount used in the window
    pub used: u64,
    /// Headroom left
    pub remaining: u64,
    /// Time until the oldest in-window admission ages out (ms)
    pub reset_in_ms: u64,
}

/// Result of a non-consuming admission check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Whether a request would be admitted immediately
    pub allowed: bool,
    /// Per-ceiling usage
    pub windows: Vec<WindowUsage>,
    /// Tokens left in the bucket (token bucket strategy only)
    pub bucket_tokens: Option<f64>,
    /// Wait before capacity is available, when not allowed (ms)
    pub retry_after_ms: Option<u64>,
    /// Backoff suggested by the configured strategy after rejections (ms)
    pub suggested_backoff_ms: Option<u64>,
    /// Requests waiting in the queue
    pub queue_length: usize,
}

/// Granted admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// Whether the request waited in the queue
    pub queued: bool,
    /// 1-based queue position at enqueue time
    pub queue_position: Option<usize>,
    /// Time spent waiting
    pub waited: Duration,
}

/// Lifetime counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterStats {
    /// Requests admitted (immediately or from the queue)
    pub admitted: u64,
    /// Requests rejected outright
    pub rejected: u64,
    /// Requests that entered the queue
    pub queued: u64,
    /// Queued requests that timed out
    pub queue_timeouts: u64,
    /// Completions recorded as successful
    pub successful: u64,
    /// Completions recorded as failed
    pub failed: u64,
}

/// Full limiter status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterStatus {
    /// Limiter name
    pub name: String,
    /// Active strategy
    pub strategy: RateLimitStrategy,
    /// Current admission view
    pub current: RateLimitStatus,
    /// Lifetime counters
    pub stats: LimiterStats,
}

struct Waiter {
    tokens: u64,
    tx: oneshot::Sender<()>,
}

struct Evaluation {
    allowed: bool,
    retry_after: Duration,
    windows: Vec<WindowUsage>,
}

struct LimiterState {
    bucket: Option<TokenBucket>,
    history: UsageHistory,
    queue: VecDeque<Waiter>,
    consecutive_rejections: u32,
    stats: LimiterStats,
}

impl LimiterState {
    fn evaluate(&mut self, config: &RateLimitConfig, now: Instant, tokens: u64) -> Evaluation {
        self.history.prune(now);

        let mut allowed = true;
        let mut retry_after = Duration::ZERO;
        let mut windows = Vec::new();

        for (window, metric, limit) in config.ceilings() {
            let need = match metric {
                LimitMetric::Requests => 1,
                LimitMetric::Tokens => tokens,
            };
            let used = self.history.used(now, window, metric);
            if let Some(wait) = self
                .history
                .wait_for_headroom(now, window, metric, limit, need)
            {
                allowed = false;
                retry_after = retry_after.max(wait);
            }
            windows.push(WindowUsage {
                window,
                metric,
                limit,
                used,
                remaining: limit.saturating_sub(used),
                reset_in_ms: self.history.reset_in(now, window).as_millis() as u64,
            });
        }

        if let Some(bucket) = self.bucket.as_mut() {
            bucket.refill(now);
            if !bucket.has_token() {
                allowed = false;
                retry_after = retry_after.max(bucket.time_until_token());
            }
        }

        Evaluation {
            allowed,
            retry_after,
            windows,
        }
    }

    fn commit(&mut self, now: Instant, tokens: u64) {
        if let Some(bucket) = self.bucket.as_mut() {
            bucket.consume();
        }
        self.history.record(now, 1, tokens);
        self.stats.admitted += 1;
        self.consecutive_rejections = 0;
    }

    /// Grant queued requests in FIFO order while capacity allows
    fn drain_queue(&mut self, config: &RateLimitConfig, now: Instant) -> usize {
        let mut granted = 0;
        while let Some(front) = self.queue.front() {
            if front.tx.is_closed() {
                self.queue.pop_front();
                continue;
            }
            let tokens = front.tokens;
            if !self.evaluate(config, now, tokens).allowed {
                break;
            }
            if let Some(waiter) = self.queue.pop_front() {
                self.commit(now, waiter.tokens);
                let _ = waiter.tx.send(());
                granted += 1;
            }
        }
        granted
    }
}

struct LimiterInner {
    name: String,
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    fn drain(&self) {
        let granted = self.state.lock().drain_queue(&self.config, Instant::now());
        if granted > 0 {
            tracing::debug!("Rate limiter {} granted {} queued requests", self.name, granted);
        }
    }
}

/// Admission controller for one provider
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
    drain_task: Mutex<Option<PeriodicTask>>,
}

impl RateLimiter {
    /// Create a limiter after validating its configuration
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let bucket = match config.strategy {
            RateLimitStrategy::TokenBucket => Some(TokenBucket::new(
                config.burst_limit.unwrap_or(config.requests_per_minute),
                config.requests_per_minute,
                Instant::now(),
            )),
            RateLimitStrategy::SlidingWindow => None,
        };

        Ok(Self {
            inner: Arc::new(LimiterInner {
                name: name.into(),
                config,
                state: Mutex::new(LimiterState {
                    bucket,
                    history: UsageHistory::default(),
                    queue: VecDeque::new(),
                    consecutive_rejections: 0,
                    stats: LimiterStats::default(),
                }),
            }),
            drain_task: Mutex::new(None),
        })
    }

    /// Limiter name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Check whether `tokens` would be admitted now, without consuming capacity
    pub fn can_make_request(&self, tokens: u64) -> RateLimitStatus {
        let mut state = self.inner.state.lock();
        self.status_locked(&mut state, tokens)
    }

    /// Acquire admission for a request reserving `tokens`.
    ///
    /// Returns immediately when capacity is available, waits in the FIFO
    /// queue when one is configured, and otherwise fails with
    /// [`Error::RateLimitExceeded`].
    pub async fn acquire_permission(&self, tokens: u64) -> Result<Permit> {
        let config = &self.inner.config;
        let (rx, position) = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            state.drain_queue(config, now);

            let eval = state.evaluate(config, now, tokens);
            if eval.allowed && state.queue.is_empty() {
                state.commit(now, tokens);
                return Ok(Permit {
                    queued: false,
                    queue_position: None,
                    waited: Duration::ZERO,
                });
            }

            let queue_has_room = config
                .queue_limit
                .map(|limit| state.queue.len() < limit)
                .unwrap_or(false);
            if !queue_has_room {
                state.consecutive_rejections += 1;
                state.stats.rejected += 1;
                tracing::debug!(
                    "Rate limiter {} rejected request (retry after {:?})",
                    self.inner.name,
                    eval.retry_after
                );
                return Err(Error::rate_limited(&self.inner.name, eval.retry_after));
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { tokens, tx });
            state.stats.queued += 1;
            (rx, state.queue.len())
        };

        self.ensure_drain_task();
        let started = Instant::now();
        let timeout = Duration::from_millis(config.queue_timeout_ms);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(Permit {
                queued: true,
                queue_position: Some(position),
                waited: started.elapsed(),
            }),
            Ok(Err(_)) => Err(Error::other(format!(
                "Rate limiter {} shut down while request was queued",
                self.inner.name
            ))),
            Err(_) => {
                let waited = started.elapsed();
                self.inner.state.lock().stats.queue_timeouts += 1;
                tracing::warn!(
                    "Queued request for {} timed out after {:?}",
                    self.inner.name,
                    waited
                );
                Err(Error::QueueTimeout {
                    limiter: self.inner.name.clone(),
                    waited,
                })
            }
        }
    }

    /// Record a completed request.
    ///
    /// `tokens` is usage beyond what was reserved at admission; it counts
    /// against the token ceilings from now on.
    pub fn record_request(&self, tokens: u64, success: bool) {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        state.history.record(now, 0, tokens);
        if success {
            state.stats.successful += 1;
        } else {
            state.stats.failed += 1;
        }
    }

    /// Full status including lifetime counters
    pub fn get_status(&self) -> LimiterStatus {
        let mut state = self.inner.state.lock();
        let current = self.status_locked(&mut state, 0);
        LimiterStatus {
            name: self.inner.name.clone(),
            strategy: self.inner.config.strategy,
            current,
            stats: state.stats.clone(),
        }
    }

    /// Clear all window history and refill the bucket; queued requests are
    /// then granted as capacity allows
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        state.history.clear();
        state.consecutive_rejections = 0;
        if let Some(bucket) = state.bucket.as_mut() {
            bucket.fill(now);
        }
        state.drain_queue(&self.inner.config, now);
        tracing::info!("Rate limiter {} reset", self.inner.name);
    }

    /// Stop the drain task and fail every queued request
    pub async fn shutdown(&self) {
        let task = self.drain_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        let dropped = {
            let mut state = self.inner.state.lock();
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        if dropped > 0 {
            tracing::warn!(
                "Rate limiter {} shut down with {} queued requests",
                self.inner.name,
                dropped
            );
        }
    }

    fn status_locked(&self, state: &mut LimiterState, tokens: u64) -> RateLimitStatus {
        let config = &self.inner.config;
        let eval = state.evaluate(config, Instant::now(), tokens);
        let allowed = eval.allowed && state.queue.is_empty();
        let suggested_backoff_ms = (state.consecutive_rejections > 0).then(|| {
            config
                .backoff_strategy
                .delay(
                    Duration::from_millis(config.backoff_base_ms),
                    state.consecutive_rejections,
                )
                .as_millis() as u64
        });

        RateLimitStatus {
            allowed,
            windows: eval.windows,
            bucket_tokens: state.bucket.as_ref().map(|b| b.available()),
            retry_after_ms: (!eval.allowed).then(|| eval.retry_after.as_millis() as u64),
            suggested_backoff_ms,
            queue_length: state.queue.len(),
        }
    }

    fn ensure_drain_task(&self) {
        if !self.inner.config.queue_enabled() {
            return;
        }
        let mut slot = self.drain_task.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<LimiterInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.queue_drain_interval_ms);
        *slot = Some(PeriodicTask::spawn(
            format!("rate-limiter-drain:{}", self.inner.name),
            period,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.drain();
                    }
                }
            },
        ));
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio_test::{assert_err, assert_ok};

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new("test", config).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(RateLimiter::new("bad", RateLimitConfig::per_minute(0)).is_err());
        let config = RateLimitConfig {
            burst_limit: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_strategies() {
        let base = Duration::from_millis(100);
        assert_eq!(BackoffStrategy::Fixed.delay(base, 4), base);
        assert_eq!(
            BackoffStrategy::Linear.delay(base, 3),
            Duration::from_millis(300)
        );
        assert_eq!(
            BackoffStrategy::Exponential.delay(base, 4),
            Duration::from_millis(800)
        );
        assert_eq!(
            BackoffStrategy::Exponential.delay(base, 0),
            Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_reject() {
        let rl = limiter(RateLimitConfig::per_minute(3));
        for _ in 0..3 {
            assert_ok!(rl.acquire_permission(0).await);
        }
        let err = assert_err!(rl.acquire_permission(0).await);
        assert!(err.is_rate_limit());
        let retry = err.retry_after().unwrap();
        assert!(retry > Duration::ZERO && retry <= Duration::from_secs(60));

        let status = rl.can_make_request(0);
        assert!(!status.allowed);
        assert!(status.suggested_backoff_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_never_exceeds_rolling_minute() {
        let rpm = 10u32;
        let rl = limiter(RateLimitConfig {
            burst_limit: Some(20),
            ..RateLimitConfig::per_minute(rpm)
        });
        let mut admitted: VecDeque<Instant> = VecDeque::new();
        let mut all = Vec::new();

        // steady arrivals every 700ms for five minutes, with bursts every 30s
        for step in 0..430u32 {
            let attempts = if step % 43 == 0 { 15 } else { 1 };
            for _ in 0..attempts {
                if rl.acquire_permission(0).await.is_ok() {
                    all.push(Instant::now());
                }
            }
            tokio::time::advance(Duration::from_millis(700)).await;
        }

        for t in &all {
            admitted.push_back(*t);
            while let Some(front) = admitted.front() {
                if t.saturating_duration_since(*front) >= Duration::from_secs(60) {
                    admitted.pop_front();
                } else {
                    break;
                }
            }
            assert!(admitted.len() <= rpm as usize);
        }
        assert!(all.len() > rpm as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_retry_after_oldest_expiry() {
        let rl = limiter(RateLimitConfig::per_minute(2).sliding_window());
        rl.acquire_permission(0).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        rl.acquire_permission(0).await.unwrap();

        let err = rl.acquire_permission(0).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(40)));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_ok!(rl.acquire_permission(0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_ceilings_must_have_headroom() {
        let rl = limiter(RateLimitConfig {
            requests_per_hour: Some(2),
            ..RateLimitConfig::per_minute(100).sliding_window()
        });
        rl.acquire_permission(0).await.unwrap();
        rl.acquire_permission(0).await.unwrap();
        let err = rl.acquire_permission(0).await.unwrap_err();
        assert!(err.retry_after().unwrap() > Duration::from_secs(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_ceiling_counts_reserved_and_recorded_tokens() {
        let rl = limiter(RateLimitConfig {
            tokens_per_minute: Some(1_000),
            ..RateLimitConfig::per_minute(100)
        });
        rl.acquire_permission(400).await.unwrap();
        rl.record_request(300, true);
        assert!(rl.can_make_request(300).allowed);
        assert!(!rl.can_make_request(301).allowed);

        let status = rl.get_status();
        let tokens = status
            .current
            .windows
            .iter()
            .find(|w| w.metric == LimitMetric::Tokens)
            .unwrap();
        assert_eq!(tokens.used, 700);
        assert_eq!(tokens.remaining, 300);
        assert_eq!(status.stats.successful, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_grants_in_fifo_order() {
        let rl = Arc::new(limiter(
            RateLimitConfig::per_minute(2)
                .sliding_window()
                .with_queue(5, Duration::from_secs(300)),
        ));
        rl.acquire_permission(0).await.unwrap();
        rl.acquire_permission(0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move { rl.acquire_permission(0).await }));
            tokio::task::yield_now().await;
        }
        assert_eq!(rl.can_make_request(0).queue_length, 3);

        let mut permits = Vec::new();
        for h in handles {
            permits.push(h.await.unwrap().unwrap());
        }

        // two slots free after the first minute, the third after the second
        for (i, permit) in permits.iter().enumerate() {
            assert!(permit.queued);
            assert_eq!(permit.queue_position, Some(i + 1));
        }
        assert!(permits[0].waited >= Duration::from_secs(60));
        assert!(permits[0].waited <= permits[1].waited);
        assert!(permits[2].waited >= Duration::from_secs(120));
        assert_eq!(rl.get_status().stats.admitted, 5);
        rl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let rl = limiter(RateLimitConfig::per_minute(1).with_queue(1, Duration::from_secs(2)));
        rl.acquire_permission(0).await.unwrap();
        let err = rl.acquire_permission(0).await.unwrap_err();
        assert!(matches!(err, Error::QueueTimeout { .. }));
        assert_eq!(rl.get_status().stats.queue_timeouts, 1);
        rl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects() {
        let rl = Arc::new(limiter(
            RateLimitConfig::per_minute(1).with_queue(1, Duration::from_secs(5)),
        ));
        rl.acquire_permission(0).await.unwrap();

        let waiter = {
            let rl = rl.clone();
            tokio::spawn(async move { rl.acquire_permission(0).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(rl.can_make_request(0).queue_length, 1);

        let err = rl.acquire_permission(0).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));

        let _ = waiter.await.unwrap();
        rl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_queued_waiters() {
        let rl = Arc::new(limiter(
            RateLimitConfig::per_minute(1).with_queue(3, Duration::from_secs(300)),
        ));
        assert_ok!(rl.acquire_permission(0).await);

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let rl = rl.clone();
            waiters.push(tokio::spawn(async move { rl.acquire_permission(0).await }));
            tokio::task::yield_now().await;
        }
        assert_eq!(rl.can_make_request(0).queue_length, 2);

        rl.shutdown().await;
        assert_eq!(rl.can_make_request(0).queue_length, 0);
        for waiter in waiters {
            let err = assert_err!(waiter.await.unwrap());
            assert!(err.to_string().contains("shut down while request was queued"));
        }
        let stats = rl.get_status().stats;
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.queue_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_capacity() {
        let rl = limiter(RateLimitConfig::per_minute(1));
        rl.acquire_permission(0).await.unwrap();
        assert!(!rl.can_make_request(0).allowed);
        rl.reset();
        assert!(rl.can_make_request(0).allowed);
    }
}
