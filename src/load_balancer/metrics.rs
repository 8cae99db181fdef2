//! Rolling per-provider performance metrics

use crate::provider::RateLimitInfo;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-capacity window of samples, oldest evicted first
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl RollingWindow {
    /// Create a window holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean of the samples
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// 95th percentile (nearest rank)
    pub fn p95(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((0.95 * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        Some(sorted[rank - 1])
    }

    /// Least-squares slope over sample index.
    ///
    /// Positive means values are rising. Zero with fewer than two samples.
    pub fn trend(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let n_f = n as f64;
        let mean_x = (n_f - 1.0) / 2.0;
        let mean_y = self.samples.iter().sum::<f64>() / n_f;

        let mut num = 0.0;
        let mut den = 0.0;
        for (i, y) in self.samples.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }
}

/// In-memory metrics for one provider
#[derive(Debug, Clone)]
pub struct ProviderMetrics {
    pub(crate) response_times: RollingWindow,
    pub(crate) successes: RollingWindow,
    pub(crate) costs: RollingWindow,
    pub(crate) availability: f64,
    pub(crate) active_connections: u32,
    pub(crate) rate_limit: Option<RateLimitInfo>,
    pub(crate) circuit_open: bool,
    pub(crate) half_open: bool,
    pub(crate) total_requests: u64,
    pub(crate) total_failures: u64,
    pub(crate) total_tokens: u64,
    pub(crate) total_cost: f64,
    pub(crate) times_selected: u64,
}

impl ProviderMetrics {
    /// Fresh metrics with windows of `window_size` samples
    pub fn new(window_size: usize) -> Self {
        Self {
            response_times: RollingWindow::new(window_size),
            successes: RollingWindow::new(window_size),
            costs: RollingWindow::new(window_size),
            availability: 1.0,
            active_connections: 0,
            rate_limit: None,
            circuit_open: false,
            half_open: false,
            total_requests: 0,
            total_failures: 0,
            total_tokens: 0,
            total_cost: 0.0,
            times_selected: 0,
        }
    }

    /// Recent success ratio; optimistic before any sample
    pub fn success_rate(&self) -> f64 {
        self.successes.average().unwrap_or(1.0)
    }

    /// Serializable snapshot
    pub fn snapshot(&self, provider: &str) -> ProviderMetricsSnapshot {
        ProviderMetricsSnapshot {
            provider: provider.to_string(),
            avg_response_time_ms: self.response_times.average(),
            p95_response_time_ms: self.response_times.p95(),
            response_time_trend: self.response_times.trend(),
            success_rate: self.success_rate(),
            avg_cost: self.costs.average(),
            availability: self.availability,
            active_connections: self.active_connections,
            rate_limit: self.rate_limit,
            circuit_open: self.circuit_open,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            total_tokens: self.total_tokens,
            total_cost: self.total_cost,
            times_selected: self.times_selected,
        }
    }
}

/// Point-in-time copy of [`ProviderMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetricsSnapshot {
    /// Provider name
    pub provider: String,
    /// Mean recent response time (ms)
    pub avg_response_time_ms: Option<f64>,
    /// 95th percentile recent response time (ms)
    pub p95_response_time_ms: Option<f64>,
    /// Slope of recent response times (ms per request)
    pub response_time_trend: f64,
    /// Recent success ratio
    pub success_rate: f64,
    /// Mean recent cost per request
    pub avg_cost: Option<f64>,
    /// Healthy ratio from the last health probes
    pub availability: f64,
    /// Requests in flight
    pub active_connections: u32,
    /// Most recent provider-side rate limit snapshot
    pub rate_limit: Option<RateLimitInfo>,
    /// Whether the circuit was open at last update
    pub circuit_open: bool,
    /// Lifetime requests recorded
    pub total_requests: u64,
    /// Lifetime failures recorded
    pub total_failures: u64,
    /// Lifetime tokens recorded
    pub total_tokens: u64,
    /// Lifetime cost recorded
    pub total_cost: f64,
    /// Times chosen by selection
    pub times_selected: u64,
}
