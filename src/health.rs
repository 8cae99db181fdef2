//! Provider health monitoring
//!
//! Each registered provider is probed on its own interval by an independent
//! [`PeriodicTask`], so a slow probe never delays another provider's. Probe
//! results go into a bounded per-provider history from which the current
//! [`HealthStatus`] is derived:
//!
//! - `HEALTHY` when the healthy ratio over the last `status_window` probes is
//!   at least `degraded_threshold`
//! - `DEGRADED` when it is at least `unhealthy_threshold`
//! - `UNHEALTHY` otherwise, or after `max_consecutive_failures` failed probes
//! - `UNKNOWN` before the first probe

use crate::background::PeriodicTask;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::{Error, Result};
use crate::provider::Provider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Default probe interval (ms)
    pub check_interval_ms: u64,
    /// Probe timeout (ms)
    pub timeout_ms: u64,
    /// Consecutive failed probes that force `UNHEALTHY`
    pub max_consecutive_failures: u32,
    /// Probe results kept per provider
    pub history_size: usize,
    /// Minimum healthy ratio for `HEALTHY`
    pub degraded_threshold: f64,
    /// Minimum healthy ratio for `DEGRADED`
    pub unhealthy_threshold: f64,
    /// Most recent probes considered when deriving status
    pub status_window: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            timeout_ms: 5_000,
            max_consecutive_failures: 3,
            history_size: 100,
            degraded_threshold: 0.8,
            unhealthy_threshold: 0.5,
            status_window: 10,
        }
    }
}

impl HealthMonitorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_ms == 0 || self.timeout_ms == 0 {
            return Err(Error::config(
                "health check_interval_ms and timeout_ms must be positive",
            ));
        }
        if self.history_size == 0 || self.status_window == 0 {
            return Err(Error::config(
                "health history_size and status_window must be positive",
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::config("max_consecutive_failures must be positive"));
        }
        let in_range = |t: f64| t > 0.0 && t <= 1.0;
        if !in_range(self.degraded_threshold) || !in_range(self.unhealthy_threshold) {
            return Err(Error::config("health thresholds must be in (0, 1]"));
        }
        if self.unhealthy_threshold >= self.degraded_threshold {
            return Err(Error::config(
                "unhealthy_threshold must be below degraded_threshold",
            ));
        }
        Ok(())
    }

    /// Probe timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Default probe interval as a `Duration`
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Derived provider health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Healthy ratio at or above the degraded threshold
    Healthy,
    /// Healthy ratio between the two thresholds
    Degraded,
    /// Healthy ratio below the unhealthy threshold
    Unhealthy,
    /// No probes yet
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Probed provider
    pub provider: String,
    /// `HEALTHY` or `UNHEALTHY` for this probe alone
    pub status: HealthStatus,
    /// Probe latency (ms)
    pub response_time_ms: u64,
    /// When the probe finished
    pub timestamp: DateTime<Utc>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Whether the probe succeeded
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregate health view of one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthInfo {
    /// Provider name
    pub provider: String,
    /// Derived status, combined with the circuit breaker when one is attached
    pub current_status: HealthStatus,
    /// Most recent probe time
    pub last_check: Option<DateTime<Utc>>,
    /// Failed probes in a row
    pub consecutive_failures: u32,
    /// Healthy probes over the retained history, as a percentage
    pub uptime_percent: f64,
    /// Mean latency of successful probes in the history (ms)
    pub avg_response_time_ms: f64,
    /// Retained probe results, oldest first
    pub history: Vec<HealthCheckResult>,
    /// Breaker state, when a breaker is attached
    pub circuit_state: Option<CircuitState>,
}

/// System-wide health counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthSummary {
    /// Monitored providers
    pub total_providers: usize,
    /// Providers currently `HEALTHY`
    pub healthy: usize,
    /// Providers currently `DEGRADED`
    pub degraded: usize,
    /// Providers currently `UNHEALTHY`
    pub unhealthy: usize,
    /// Providers not yet probed
    pub unknown: usize,
    /// Worst-case status across providers
    pub overall_status: HealthStatus,
    /// When the summary was computed
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct ProbeState {
    history: VecDeque<HealthCheckResult>,
    status: HealthStatus,
    consecutive_failures: u32,
}

struct MonitoredProvider {
    provider: Arc<dyn Provider>,
    breaker: Option<Arc<CircuitBreaker>>,
    interval: Duration,
    state: Mutex<ProbeState>,
}

impl MonitoredProvider {
    async fn probe(&self, config: &HealthMonitorConfig) -> HealthCheckResult {
        let name = self.provider.name().to_string();
        let started = Instant::now();
        let outcome = tokio::time::timeout(config.timeout(), self.provider.health_check()).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(true) => None,
            Ok(false) => Some("health check reported unhealthy".to_string()),
            Err(_) => Some(format!("health check timed out after {}ms", config.timeout_ms)),
        };
        let result = HealthCheckResult {
            provider: name,
            status: if error.is_none() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            response_time_ms,
            timestamp: Utc::now(),
            error,
        };
        self.record(config, result.clone());
        result
    }

    fn record(&self, config: &HealthMonitorConfig, result: HealthCheckResult) {
        let mut state = self.state.lock();
        if result.is_healthy() {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }
        state.history.push_back(result);
        while state.history.len() > config.history_size {
            state.history.pop_front();
        }

        let previous = state.status;
        state.status = derive_status(&state, config);
        if previous != state.status {
            let name = self.provider.name();
            match state.status {
                HealthStatus::Healthy => {
                    tracing::info!("Provider {} is {} (was {})", name, state.status, previous)
                }
                _ => tracing::warn!("Provider {} is {} (was {})", name, state.status, previous),
            }
        }
    }

    fn healthy_ratio(&self, window: usize) -> Option<f64> {
        let state = self.state.lock();
        recent_ratio(&state.history, window)
    }

    fn info(&self) -> ProviderHealthInfo {
        let state = self.state.lock();
        let circuit_state = self.breaker.as_ref().map(|b| b.state());
        let current_status = match circuit_state {
            Some(CircuitState::Open) => HealthStatus::Unhealthy,
            _ => state.status,
        };

        let total = state.history.len();
        let healthy: Vec<_> = state.history.iter().filter(|r| r.is_healthy()).collect();
        let uptime_percent = if total == 0 {
            0.0
        } else {
            healthy.len() as f64 / total as f64 * 100.0
        };
        let avg_response_time_ms = if healthy.is_empty() {
            0.0
        } else {
            healthy.iter().map(|r| r.response_time_ms as f64).sum::<f64>() / healthy.len() as f64
        };

        ProviderHealthInfo {
            provider: self.provider.name().to_string(),
            current_status,
            last_check: state.history.back().map(|r| r.timestamp),
            consecutive_failures: state.consecutive_failures,
            uptime_percent,
            avg_response_time_ms,
            history: state.history.iter().cloned().collect(),
            circuit_state,
        }
    }
}

fn recent_ratio(history: &VecDeque<HealthCheckResult>, window: usize) -> Option<f64> {
    let recent: Vec<_> = history.iter().rev().take(window).collect();
    if recent.is_empty() {
        return None;
    }
    let healthy = recent.iter().filter(|r| r.is_healthy()).count();
    Some(healthy as f64 / recent.len() as f64)
}

fn derive_status(state: &ProbeState, config: &HealthMonitorConfig) -> HealthStatus {
    if state.consecutive_failures >= config.max_consecutive_failures {
        return HealthStatus::Unhealthy;
    }
    match recent_ratio(&state.history, config.status_window) {
        None => HealthStatus::Unknown,
        Some(ratio) if ratio >= config.degraded_threshold => HealthStatus::Healthy,
        Some(ratio) if ratio >= config.unhealthy_threshold => HealthStatus::Degraded,
        Some(_) => HealthStatus::Unhealthy,
    }
}

/// Periodic liveness prober for registered providers
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    providers: DashMap<String, Arc<MonitoredProvider>>,
    tasks: Mutex<HashMap<String, PeriodicTask>>,
    running: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor after validating its configuration
    pub fn new(config: HealthMonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            providers: DashMap::new(),
            tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Configuration
    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Monitor a provider, optionally combining its status with a breaker and
    /// overriding the probe interval
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since a running monitor spawns the probe loop right away.
    pub fn register_provider(
        &self,
        provider: Arc<dyn Provider>,
        breaker: Option<Arc<CircuitBreaker>>,
        interval: Option<Duration>,
    ) {
        let name = provider.name().to_string();
        let monitored = Arc::new(MonitoredProvider {
            provider,
            breaker,
            interval: interval
                .filter(|d| !d.is_zero())
                .unwrap_or_else(|| self.config.check_interval()),
            state: Mutex::new(ProbeState {
                history: VecDeque::with_capacity(self.config.history_size),
                status: HealthStatus::Unknown,
                consecutive_failures: 0,
            }),
        });
        self.providers.insert(name.clone(), monitored.clone());

        if self.running.load(Ordering::Acquire) {
            let task = self.spawn_probe_task(&name, monitored);
            self.tasks.lock().insert(name, task);
        }
    }

    /// Stop monitoring a provider
    pub fn unregister_provider(&self, name: &str) -> bool {
        // dropping the task signals its loop to exit
        self.tasks.lock().remove(name);
        self.providers.remove(name).is_some()
    }

    /// Start one probe loop per registered provider
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since each probe loop is a spawned task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();
        for entry in self.providers.iter() {
            let task = self.spawn_probe_task(entry.key(), entry.value().clone());
            tasks.insert(entry.key().clone(), task);
        }
        tracing::info!("Health monitor started for {} providers", tasks.len());
    }

    /// Stop every probe loop and wait for them to exit
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks.values() {
            task.stop().await;
        }
        if !tasks.is_empty() {
            tracing::info!("Health monitor stopped");
        }
    }

    /// Whether probe loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Probe one provider now
    pub async fn check_provider_health(&self, name: &str) -> Result<HealthCheckResult> {
        let monitored = self
            .providers
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::provider(name, "not monitored"))?;
        Ok(monitored.probe(&self.config).await)
    }

    /// Probe every provider concurrently
    pub async fn check_all_providers(&self) -> Vec<HealthCheckResult> {
        let monitored: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        let config = &self.config;
        join_all(monitored.iter().map(|m| m.probe(config))).await
    }

    /// Health view of one provider
    pub fn get_provider_health(&self, name: &str) -> Option<ProviderHealthInfo> {
        self.providers.get(name).map(|e| e.value().info())
    }

    /// Health view of every provider, sorted by name
    pub fn get_all_provider_health(&self) -> Vec<ProviderHealthInfo> {
        let mut all: Vec<_> = self.providers.iter().map(|e| e.value().info()).collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Counts per status and the worst-case overall status
    pub fn get_system_health_summary(&self) -> SystemHealthSummary {
        let all = self.get_all_provider_health();
        let count = |status: HealthStatus| all.iter().filter(|i| i.current_status == status).count();
        let healthy = count(HealthStatus::Healthy);
        let degraded = count(HealthStatus::Degraded);
        let unhealthy = count(HealthStatus::Unhealthy);
        let unknown = count(HealthStatus::Unknown);

        let overall_status = if unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if degraded > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealthSummary {
            total_providers: all.len(),
            healthy,
            degraded,
            unhealthy,
            unknown,
            overall_status,
            timestamp: Utc::now(),
        }
    }

    /// Healthy probe ratio over the status window; 1.0 before the first probe
    pub fn availability(&self, name: &str) -> f64 {
        self.providers
            .get(name)
            .and_then(|e| e.value().healthy_ratio(self.config.status_window))
            .unwrap_or(1.0)
    }

    fn spawn_probe_task(&self, name: &str, monitored: Arc<MonitoredProvider>) -> PeriodicTask {
        let config = self.config.clone();
        let period = monitored.interval;
        PeriodicTask::spawn(format!("health:{}", name), period, move || {
            let monitored = monitored.clone();
            let config = config.clone();
            async move {
                monitored.probe(&config).await;
            }
        })
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("providers", &self.providers.len())
            .field("running", &self.is_running())
            .finish()
    }
}
