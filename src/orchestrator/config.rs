//! Ensemble configuration
//!
//! Loaded from YAML, optionally layered with `ENSEMBLE__*` environment
//! variables (`ENSEMBLE__PERFORMANCE__MIN_PROVIDERS_REQUIRED=2`). Every
//! section has defaults, so a partial file is valid.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::cost::CostTrackerConfig;
use crate::error::{Error, Result};
use crate::health::HealthMonitorConfig;
use crate::load_balancer::LoadBalancerConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::tracing_ext::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level ensemble configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Which providers take traffic and how they are biased
    pub providers: ProvidersConfig,
    /// Timeouts and dispatch limits
    pub performance: PerformanceConfig,
    /// Response reconciliation
    pub aggregation: AggregationConfig,
    /// Tracking and health probing switches
    pub monitoring: MonitoringConfig,
    /// Breaker settings applied to every provider without its own breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limits keyed by provider name
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Health monitor settings
    pub health: HealthMonitorConfig,
    /// Load balancer settings
    pub load_balancer: LoadBalancerConfig,
    /// Pricing and budgets
    pub cost: CostTrackerConfig,
    /// Logging setup
    pub logging: LogConfig,
}

/// Provider selection overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// When non-empty, only these providers are enabled at registration
    pub enabled: Vec<String>,
    /// Priority overrides keyed by provider name
    pub priority: HashMap<String, u32>,
    /// Weight overrides keyed by provider name
    pub weights: HashMap<String, f64>,
}

/// Timeouts and dispatch limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Ceiling on one ensemble request (ms)
    pub max_total_timeout_ms: u64,
    /// Ceiling on one provider call, including admission (ms)
    pub max_provider_timeout_ms: u64,
    /// Healthy providers required before dispatch
    pub min_providers_required: usize,
    /// Let the load balancer choose providers instead of using all healthy ones
    pub enable_load_balancing: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_total_timeout_ms: 60_000,
            max_provider_timeout_ms: 30_000,
            min_providers_required: 1,
            enable_load_balancing: true,
        }
    }
}

impl PerformanceConfig {
    /// Total timeout as a `Duration`
    pub fn max_total_timeout(&self) -> Duration {
        Duration::from_millis(self.max_total_timeout_ms)
    }

    /// Per-provider timeout as a `Duration`
    pub fn max_provider_timeout(&self) -> Duration {
        Duration::from_millis(self.max_provider_timeout_ms)
    }
}

/// Weights of the ensemble confidence blend
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeighting {
    /// Consensus agreement level
    pub agreement: f64,
    /// Successful / attempted providers
    pub completeness: f64,
    /// Mean individual confidence
    pub consistency: f64,
}

impl Default for ConfidenceWeighting {
    fn default() -> Self {
        Self {
            agreement: 0.4,
            completeness: 0.3,
            consistency: 0.3,
        }
    }
}

/// Built-in consensus policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusKind {
    /// First successful response, agreement = mean confidence
    #[default]
    ConfidenceAverage,
    /// Confidence-weighted voting per topic
    MajorityVote,
}

/// Response reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Agreement level at which consensus counts as reached
    pub consensus_threshold: f64,
    /// Ensemble confidence blend
    pub confidence_weighting: ConfidenceWeighting,
    /// Token similarity at which two text answers are the same vote
    pub component_clustering_threshold: f64,
    /// Default consensus policy
    pub policy: ConsensusKind,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.7,
            confidence_weighting: ConfidenceWeighting::default(),
            component_clustering_threshold: 0.8,
            policy: ConsensusKind::ConfidenceAverage,
        }
    }
}

/// Tracking and health probing switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Feed call outcomes into the load balancer
    pub enable_performance_tracking: bool,
    /// Run scheduled health probes
    pub enable_health_checks: bool,
    /// Probe interval (ms); when set it wins over `health.check_interval_ms`
    pub health_check_interval_ms: Option<u64>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_performance_tracking: true,
            enable_health_checks: true,
            health_check_interval_ms: None,
        }
    }
}

impl EnsembleConfig {
    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Layer an optional YAML file with `ENSEMBLE__*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ENSEMBLE")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        let perf = &self.performance;
        if perf.max_total_timeout_ms == 0 || perf.max_provider_timeout_ms == 0 {
            return Err(Error::config("performance timeouts must be positive"));
        }
        if perf.min_providers_required == 0 {
            return Err(Error::config("min_providers_required must be at least 1"));
        }

        let agg = &self.aggregation;
        for (name, value) in [
            ("consensus_threshold", agg.consensus_threshold),
            (
                "component_clustering_threshold",
                agg.component_clustering_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!("{} must be in [0, 1]", name)));
            }
        }
        let w = agg.confidence_weighting;
        if [w.agreement, w.completeness, w.consistency]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
            || w.agreement + w.completeness + w.consistency <= 0.0
        {
            return Err(Error::config(
                "confidence weights must be non-negative and not all zero",
            ));
        }

        if self.monitoring.health_check_interval_ms == Some(0) {
            return Err(Error::config("health_check_interval_ms must be positive"));
        }
        if self.providers.weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::config("provider weights must be non-negative"));
        }

        self.circuit_breaker.validate()?;
        for (name, limits) in &self.rate_limits {
            limits
                .validate()
                .map_err(|e| Error::config(format!("rate_limits.{}: {}", name, e)))?;
        }
        self.health.validate()?;
        self.load_balancer.validate()?;
        self.cost.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Health monitor settings with the monitoring interval applied, if set
    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        let mut health = self.health.clone();
        if let Some(interval) = self.monitoring.health_check_interval_ms {
            health.check_interval_ms = interval;
        }
        health
    }

    /// Install the global tracing subscriber described by `logging`
    pub fn init_tracing(&self) -> Result<()> {
        crate::tracing_ext::init_tracing(&self.logging)
    }
}
