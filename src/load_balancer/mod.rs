//! Provider selection
//!
//! The [`LoadBalancer`] chooses which registered providers receive a request.
//! Candidates are enabled, not excluded, and not behind an open circuit;
//! candidates that violate a cost or latency ceiling score zero and are only
//! listed as alternatives. Required providers are always included.
//!
//! # Strategies
//!
//! - **RoundRobin**: rotate through candidates
//! - **WeightedRoundRobin**: rotate through a sequence repeating each
//!   provider in proportion to its weight
//! - **LeastConnections**: fewest requests in flight first
//! - **FastestResponse**: lowest average response time first
//! - **LowestCost**: lowest average cost first
//! - **Adaptive** (default): weighted blend of performance, cost and
//!   availability scores

pub mod metrics;

pub use metrics::{ProviderMetrics, ProviderMetricsSnapshot, RollingWindow};

use crate::circuit_breaker::CircuitState;
use crate::error::{Error, Result};
use crate::provider::AnalysisOptions;
use crate::registry::{ProviderEntry, ProviderRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Rotate through candidates
    RoundRobin,
    /// Rotate with weight-proportional repetition
    WeightedRoundRobin,
    /// Fewest in-flight requests
    LeastConnections,
    /// Lowest average response time
    FastestResponse,
    /// Lowest average cost
    LowestCost,
    /// Composite performance / cost / availability score
    #[default]
    Adaptive,
}

/// Weights of the adaptive composite score
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Performance component
    pub performance: f64,
    /// Cost component
    pub cost: f64,
    /// Availability component
    pub availability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            performance: 0.5,
            cost: 0.3,
            availability: 0.2,
        }
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Selection strategy
    pub strategy: BalancingStrategy,
    /// Samples kept per rolling window
    pub window_size: usize,
    /// Adaptive score weights
    pub weights: ScoreWeights,
    /// Response time that scores 0.5 on speed (ms)
    pub reference_response_time_ms: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::Adaptive,
            window_size: 100,
            weights: ScoreWeights::default(),
            reference_response_time_ms: 1_000.0,
        }
    }
}

impl LoadBalancerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::config("window_size must be positive"));
        }
        let w = self.weights;
        if [w.performance, w.cost, w.availability]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(Error::config("score weights must be non-negative"));
        }
        if w.performance + w.cost + w.availability <= 0.0 {
            return Err(Error::config("score weights must not all be zero"));
        }
        if !self.reference_response_time_ms.is_finite() || self.reference_response_time_ms <= 0.0 {
            return Err(Error::config("reference_response_time_ms must be positive"));
        }
        Ok(())
    }
}

/// How many providers to select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCount {
    /// At most this many (more if more are required)
    Exact(usize),
    /// Every eligible candidate
    All,
}

/// Per-request selection constraints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    /// Never select these
    pub exclude: Vec<String>,
    /// Always select these when they are candidates
    pub require: Vec<String>,
    /// Average cost ceiling
    pub max_cost: Option<f64>,
    /// Average response time ceiling (ms)
    pub max_response_time_ms: Option<u64>,
}

impl From<&AnalysisOptions> for SelectionCriteria {
    fn from(options: &AnalysisOptions) -> Self {
        Self {
            exclude: options.exclude.clone(),
            require: options.require.clone(),
            max_cost: options.max_cost,
            max_response_time_ms: options.max_response_time_ms,
        }
    }
}

/// Averages expected from the selected providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedPerformance {
    /// Mean of the selected providers' average response times (ms)
    pub response_time_ms: Option<f64>,
    /// Mean of the selected providers' success rates
    pub success_rate: f64,
    /// Sum of the selected providers' average costs
    pub total_cost: f64,
}

/// Outcome of a selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionDecision {
    /// Chosen providers in dispatch order
    pub selected: Vec<String>,
    /// Human-readable explanation
    pub reasoning: String,
    /// Expected aggregate behaviour
    pub expected_performance: ExpectedPerformance,
    /// Candidates that were not chosen
    pub alternatives: Vec<String>,
    /// Strategy score of every candidate
    pub scores: BTreeMap<String, f64>,
    /// Strategy used
    pub strategy: BalancingStrategy,
}

/// Aggregate load balancer statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerStatistics {
    /// Strategy in use
    pub strategy: BalancingStrategy,
    /// Selections performed
    pub total_selections: u64,
    /// Executions recorded across providers
    pub total_requests: u64,
    /// Successful share of recorded executions
    pub overall_success_rate: f64,
    /// Per-provider metrics
    pub providers: Vec<ProviderMetricsSnapshot>,
}

struct Candidate {
    entry: Arc<ProviderEntry>,
    metrics: ProviderMetrics,
    cost_estimate: f64,
    violates: Option<String>,
}

/// Scores and selects providers from the shared registry
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    registry: Arc<ProviderRegistry>,
    metrics: DashMap<String, ProviderMetrics>,
    cursor: AtomicUsize,
    selections: AtomicU64,
}

impl LoadBalancer {
    /// Create a load balancer over `registry`
    pub fn new(config: LoadBalancerConfig, registry: Arc<ProviderRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            metrics: DashMap::new(),
            cursor: AtomicUsize::new(0),
            selections: AtomicU64::new(0),
        })
    }

    /// Configuration
    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Start tracking a provider with fresh metrics
    pub fn register_provider(&self, name: &str) {
        self.metrics
            .insert(name.to_string(), ProviderMetrics::new(self.config.window_size));
    }

    /// Stop tracking a provider
    pub fn remove_provider(&self, name: &str) {
        self.metrics.remove(name);
    }

    /// Choose providers for one request
    pub fn select_providers(
        &self,
        count: SelectionCount,
        criteria: &SelectionCriteria,
    ) -> SelectionDecision {
        self.selections.fetch_add(1, Ordering::Relaxed);
        let strategy = self.config.strategy;
        let mut candidates = self.candidates(criteria);

        let max_cost = candidates
            .iter()
            .map(|c| c.cost_estimate)
            .fold(0.0_f64, f64::max);
        let mut scores = BTreeMap::new();
        for c in &candidates {
            let score = if c.violates.is_some() {
                0.0
            } else {
                self.score(strategy, c, max_cost)
            };
            scores.insert(c.entry.name().to_string(), score);
        }

        let eligible: Vec<String> = match strategy {
            BalancingStrategy::RoundRobin => self.round_robin_order(&candidates),
            BalancingStrategy::WeightedRoundRobin => self.weighted_order(&candidates),
            _ => {
                candidates.sort_by(|a, b| {
                    let sa = scores.get(a.entry.name()).copied().unwrap_or(0.0);
                    let sb = scores.get(b.entry.name()).copied().unwrap_or(0.0);
                    sb.total_cmp(&sa)
                        .then_with(|| a.entry.name().cmp(b.entry.name()))
                });
                candidates
                    .iter()
                    .filter(|c| c.violates.is_none())
                    .map(|c| c.entry.name().to_string())
                    .collect()
            }
        };

        let mut selected: Vec<String> = Vec::new();
        for name in &criteria.require {
            let is_candidate = candidates.iter().any(|c| c.entry.name() == name);
            if is_candidate && !selected.contains(name) {
                selected.push(name.clone());
            }
        }
        let target = match count {
            SelectionCount::Exact(n) => n.max(selected.len()),
            SelectionCount::All => usize::MAX,
        };
        for name in eligible {
            if selected.len() >= target {
                break;
            }
            if !selected.contains(&name) {
                selected.push(name);
            }
        }

        let alternatives: Vec<String> = candidates
            .iter()
            .map(|c| c.entry.name().to_string())
            .filter(|n| !selected.contains(n))
            .collect();

        let expected_performance = self.expected(&candidates, &selected);
        for name in &selected {
            if let Some(mut m) = self.metrics.get_mut(name) {
                m.times_selected += 1;
            }
        }

        let reasoning = self.reasoning(strategy, &selected, &scores, &candidates);
        tracing::debug!("Load balancer selected {:?} ({:?})", selected, strategy);

        SelectionDecision {
            selected,
            reasoning,
            expected_performance,
            alternatives,
            scores,
            strategy,
        }
    }

    /// Mark a request as in flight
    pub fn record_execution_start(&self, name: &str) {
        self.with_metrics(name, |m| m.active_connections += 1);
    }

    /// Record a finished request
    pub fn record_execution(
        &self,
        name: &str,
        response_time: Duration,
        success: bool,
        tokens: u64,
        cost: f64,
    ) {
        self.with_metrics(name, |m| {
            m.active_connections = m.active_connections.saturating_sub(1);
            m.response_times.push(response_time.as_secs_f64() * 1_000.0);
            m.successes.push(if success { 1.0 } else { 0.0 });
            // only successful calls are billed, so failures stay out of the cost average
            if success {
                m.costs.push(cost);
            }
            m.total_requests += 1;
            if !success {
                m.total_failures += 1;
            }
            m.total_tokens += tokens;
            m.total_cost += cost;
        });
    }

    /// Record a request short-circuited before reaching the provider.
    ///
    /// Counts as a failure but leaves the response-time window untouched.
    pub fn record_rejection(&self, name: &str) {
        self.with_metrics(name, |m| {
            m.active_connections = m.active_connections.saturating_sub(1);
            m.successes.push(0.0);
            m.total_requests += 1;
            m.total_failures += 1;
        });
    }

    /// Release a request that was dropped before it finished
    pub fn record_cancellation(&self, name: &str) {
        self.with_metrics(name, |m| {
            m.active_connections = m.active_connections.saturating_sub(1);
        });
    }

    /// Set the health-derived availability ratio
    pub fn update_availability(&self, name: &str, availability: f64) {
        self.with_metrics(name, |m| m.availability = availability.clamp(0.0, 1.0));
    }

    /// Set the circuit flags
    pub fn update_circuit_state(&self, name: &str, state: CircuitState) {
        self.with_metrics(name, |m| {
            m.circuit_open = state == CircuitState::Open;
            m.half_open = state == CircuitState::HalfOpen;
        });
    }

    /// Clear metrics for one provider, or all when `name` is `None`
    pub fn reset_metrics(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                if let Some(mut m) = self.metrics.get_mut(name) {
                    *m = ProviderMetrics::new(self.config.window_size);
                }
            }
            None => {
                for mut m in self.metrics.iter_mut() {
                    *m = ProviderMetrics::new(self.config.window_size);
                }
            }
        }
    }

    /// Metrics of one provider, or all sorted by name
    pub fn get_provider_metrics(&self, name: Option<&str>) -> Vec<ProviderMetricsSnapshot> {
        match name {
            Some(name) => self
                .metrics
                .get(name)
                .map(|m| vec![m.snapshot(name)])
                .unwrap_or_default(),
            None => {
                let mut all: Vec<_> = self
                    .metrics
                    .iter()
                    .map(|e| e.value().snapshot(e.key()))
                    .collect();
                all.sort_by(|a, b| a.provider.cmp(&b.provider));
                all
            }
        }
    }

    /// Aggregate statistics
    pub fn get_statistics(&self) -> LoadBalancerStatistics {
        let providers = self.get_provider_metrics(None);
        let total_requests: u64 = providers.iter().map(|p| p.total_requests).sum();
        let total_failures: u64 = providers.iter().map(|p| p.total_failures).sum();
        let overall_success_rate = if total_requests == 0 {
            1.0
        } else {
            (total_requests - total_failures) as f64 / total_requests as f64
        };
        LoadBalancerStatistics {
            strategy: self.config.strategy,
            total_selections: self.selections.load(Ordering::Relaxed),
            total_requests,
            overall_success_rate,
            providers,
        }
    }

    fn with_metrics(&self, name: &str, f: impl FnOnce(&mut ProviderMetrics)) {
        let mut entry = self
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| ProviderMetrics::new(self.config.window_size));
        f(entry.value_mut());
    }

    fn candidates(&self, criteria: &SelectionCriteria) -> Vec<Candidate> {
        let mut out = Vec::new();
        for entry in self.registry.enabled() {
            let name = entry.name().to_string();
            if criteria.exclude.contains(&name) {
                continue;
            }
            let state = entry.breaker().state();
            let rate_limit = entry.provider().rate_limit();
            let metrics = {
                let mut m = self
                    .metrics
                    .entry(name.clone())
                    .or_insert_with(|| ProviderMetrics::new(self.config.window_size));
                m.circuit_open = entry.breaker().is_open();
                m.half_open = state == CircuitState::HalfOpen;
                m.rate_limit = Some(rate_limit);
                m.clone()
            };
            if metrics.circuit_open {
                continue;
            }

            let cost_estimate = metrics
                .costs
                .average()
                .unwrap_or_else(|| entry.provider().cost(1_000));
            let avg_rt = metrics.response_times.average();
            let violates = match (criteria.max_cost, criteria.max_response_time_ms, avg_rt) {
                (Some(max), _, _) if cost_estimate > max => {
                    Some(format!("cost {:.4} > {:.4}", cost_estimate, max))
                }
                (_, Some(max), Some(rt)) if rt > max as f64 => {
                    Some(format!("response time {:.0}ms > {}ms", rt, max))
                }
                _ => None,
            };

            out.push(Candidate {
                entry,
                metrics,
                cost_estimate,
                violates,
            });
        }
        out.sort_by(|a, b| a.entry.name().cmp(b.entry.name()));
        out
    }

    fn speed_score(&self, metrics: &ProviderMetrics) -> f64 {
        let reference = self.config.reference_response_time_ms;
        match metrics.response_times.average() {
            Some(avg) => reference / (reference + avg.max(0.0)),
            None => 1.0,
        }
    }

    fn performance_score(&self, metrics: &ProviderMetrics) -> f64 {
        let reference = self.config.reference_response_time_ms;
        // falling response times earn a bonus, rising ones a penalty
        let trend_bonus = (-metrics.response_times.trend() / reference).clamp(-0.1, 0.1);
        (0.6 * self.speed_score(metrics) + 0.4 * metrics.success_rate() + trend_bonus)
            .clamp(0.0, 1.0)
    }

    fn cost_score(cost: f64, max_cost: f64) -> f64 {
        if max_cost <= 0.0 {
            1.0
        } else {
            1.0 - 0.9 * (cost / max_cost).clamp(0.0, 1.0)
        }
    }

    fn availability_score(metrics: &ProviderMetrics) -> f64 {
        if metrics.circuit_open {
            return 0.0;
        }
        let half_open_penalty = if metrics.half_open { 0.5 } else { 1.0 };
        let headroom = metrics.rate_limit.map(|r| r.headroom()).unwrap_or(1.0);
        metrics.availability * half_open_penalty * (0.5 + 0.5 * headroom)
    }

    fn score(&self, strategy: BalancingStrategy, c: &Candidate, max_cost: f64) -> f64 {
        match strategy {
            BalancingStrategy::RoundRobin => 1.0,
            BalancingStrategy::WeightedRoundRobin => c.entry.weight(),
            BalancingStrategy::LeastConnections => {
                1.0 / (1.0 + c.metrics.active_connections as f64)
            }
            BalancingStrategy::FastestResponse => self.speed_score(&c.metrics),
            BalancingStrategy::LowestCost => Self::cost_score(c.cost_estimate, max_cost),
            BalancingStrategy::Adaptive => {
                let w = self.config.weights;
                let total = w.performance + w.cost + w.availability;
                (w.performance * self.performance_score(&c.metrics)
                    + w.cost * Self::cost_score(c.cost_estimate, max_cost)
                    + w.availability * Self::availability_score(&c.metrics))
                    / total
            }
        }
    }

    fn round_robin_order(&self, candidates: &[Candidate]) -> Vec<String> {
        let eligible: Vec<_> = candidates
            .iter()
            .filter(|c| c.violates.is_none())
            .map(|c| c.entry.name().to_string())
            .collect();
        if eligible.is_empty() {
            return eligible;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        eligible[start..]
            .iter()
            .chain(eligible[..start].iter())
            .cloned()
            .collect()
    }

    fn weighted_order(&self, candidates: &[Candidate]) -> Vec<String> {
        let eligible: Vec<_> = candidates
            .iter()
            .filter(|c| c.violates.is_none() && c.entry.weight() > 0.0)
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let min_weight = eligible
            .iter()
            .map(|c| c.entry.weight())
            .fold(f64::INFINITY, f64::min);

        let mut sequence = Vec::new();
        for c in &eligible {
            let reps = (c.entry.weight() / min_weight).round().clamp(1.0, 100.0) as usize;
            sequence.extend(std::iter::repeat(c.entry.name().to_string()).take(reps));
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % sequence.len();
        let mut order: Vec<String> = Vec::new();
        for name in sequence[start..].iter().chain(sequence[..start].iter()) {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    fn expected(&self, candidates: &[Candidate], selected: &[String]) -> ExpectedPerformance {
        let chosen: Vec<_> = candidates
            .iter()
            .filter(|c| selected.iter().any(|s| s == c.entry.name()))
            .collect();
        if chosen.is_empty() {
            return ExpectedPerformance::default();
        }
        let times: Vec<f64> = chosen
            .iter()
            .filter_map(|c| c.metrics.response_times.average())
            .collect();
        ExpectedPerformance {
            response_time_ms: (!times.is_empty())
                .then(|| times.iter().sum::<f64>() / times.len() as f64),
            success_rate: chosen.iter().map(|c| c.metrics.success_rate()).sum::<f64>()
                / chosen.len() as f64,
            total_cost: chosen.iter().map(|c| c.cost_estimate).sum(),
        }
    }

    fn reasoning(
        &self,
        strategy: BalancingStrategy,
        selected: &[String],
        scores: &BTreeMap<String, f64>,
        candidates: &[Candidate],
    ) -> String {
        if candidates.is_empty() {
            return "No eligible providers (all disabled, excluded or circuit open)".to_string();
        }
        let picks = selected
            .iter()
            .map(|n| format!("{} ({:.3})", n, scores.get(n).copied().unwrap_or(0.0)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut reasoning = format!(
            "{:?} selected {} of {} candidates: {}",
            strategy,
            selected.len(),
            candidates.len(),
            picks
        );
        for c in candidates.iter().filter(|c| c.violates.is_some()) {
            if let Some(why) = &c.violates {
                reasoning.push_str(&format!("; {} skipped: {}", c.entry.name(), why));
            }
        }
        reasoning
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("config", &self.config)
            .field("tracked", &self.metrics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::provider::mock::MockProvider;
    use crate::registry::ProviderOptions;

    fn setup(
        strategy: BalancingStrategy,
        providers: Vec<(MockProvider, f64)>,
    ) -> (Arc<ProviderRegistry>, LoadBalancer) {
        let registry = Arc::new(ProviderRegistry::new());
        for (provider, weight) in providers {
            let name = provider.name.clone();
            registry
                .register(
                    Arc::new(provider),
                    Arc::new(CircuitBreaker::new(
                        &name,
                        CircuitBreakerConfig {
                            failure_threshold: 1,
                            ..Default::default()
                        },
                    )),
                    None,
                    ProviderOptions::default().with_weight(weight),
                )
                .unwrap();
        }
        let lb = LoadBalancer::new(
            LoadBalancerConfig {
                strategy,
                ..Default::default()
            },
            registry.clone(),
        )
        .unwrap();
        (registry, lb)
    }

    fn record(lb: &LoadBalancer, name: &str, ms: u64, success: bool, cost: f64, n: usize) {
        for _ in 0..n {
            lb.record_execution_start(name);
            lb.record_execution(name, Duration::from_millis(ms), success, 100, cost);
        }
    }

    #[test]
    fn test_open_circuit_never_selected_even_if_cheaper() {
        let (registry, lb) = setup(
            BalancingStrategy::Adaptive,
            vec![
                (MockProvider::succeeding("cheap", 0.9).with_cost(0.0001), 1.0),
                (MockProvider::succeeding("pricey", 0.9).with_cost(10.0), 1.0),
            ],
        );
        registry.get("cheap").unwrap().breaker().record_failure();

        for _ in 0..5 {
            let decision = lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default());
            assert_eq!(decision.selected, vec!["pricey".to_string()]);
            assert!(!decision.scores.contains_key("cheap"));
        }
    }

    #[test]
    fn test_adaptive_prefers_fast_reliable_provider() {
        let (_, lb) = setup(
            BalancingStrategy::Adaptive,
            vec![
                (MockProvider::succeeding("fast", 0.9), 1.0),
                (MockProvider::succeeding("slow", 0.9), 1.0),
            ],
        );
        record(&lb, "fast", 100, true, 0.01, 10);
        record(&lb, "slow", 5_000, false, 0.01, 10);

        let decision = lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default());
        assert_eq!(decision.selected, vec!["fast".to_string()]);
        assert_eq!(decision.alternatives, vec!["slow".to_string()]);
        assert!(decision.scores["fast"] > decision.scores["slow"]);
        assert!(decision.expected_performance.response_time_ms.unwrap() < 200.0);
    }

    #[test]
    fn test_ties_break_by_name() {
        let (_, lb) = setup(
            BalancingStrategy::Adaptive,
            vec![
                (MockProvider::succeeding("charlie", 0.9), 1.0),
                (MockProvider::succeeding("alpha", 0.9), 1.0),
                (MockProvider::succeeding("bravo", 0.9), 1.0),
            ],
        );
        let decision = lb.select_providers(SelectionCount::Exact(2), &SelectionCriteria::default());
        assert_eq!(decision.selected, vec!["alpha".to_string(), "bravo".to_string()]);
    }

    #[test]
    fn test_exclude_require_and_all() {
        let (_, lb) = setup(
            BalancingStrategy::FastestResponse,
            vec![
                (MockProvider::succeeding("a", 0.9), 1.0),
                (MockProvider::succeeding("b", 0.9), 1.0),
                (MockProvider::succeeding("c", 0.9), 1.0),
            ],
        );
        record(&lb, "a", 50, true, 0.0, 3);
        record(&lb, "b", 500, true, 0.0, 3);
        record(&lb, "c", 5_000, true, 0.0, 3);

        let criteria = SelectionCriteria {
            require: vec!["c".into()],
            ..Default::default()
        };
        let decision = lb.select_providers(SelectionCount::Exact(1), &criteria);
        assert_eq!(decision.selected, vec!["c".to_string()]);

        let criteria = SelectionCriteria {
            require: vec!["c".into()],
            exclude: vec!["a".into()],
            ..Default::default()
        };
        let decision = lb.select_providers(SelectionCount::Exact(2), &criteria);
        assert_eq!(decision.selected, vec!["c".to_string(), "b".to_string()]);

        let decision = lb.select_providers(SelectionCount::All, &SelectionCriteria::default());
        assert_eq!(decision.selected.len(), 3);
        assert_eq!(decision.selected[0], "a");
    }

    #[test]
    fn test_constraint_violators_score_zero() {
        let (_, lb) = setup(
            BalancingStrategy::Adaptive,
            vec![
                (MockProvider::succeeding("quick", 0.9), 1.0),
                (MockProvider::succeeding("laggy", 0.9), 1.0),
            ],
        );
        record(&lb, "quick", 100, true, 0.01, 5);
        record(&lb, "laggy", 3_000, true, 0.01, 5);

        let criteria = SelectionCriteria {
            max_response_time_ms: Some(1_000),
            ..Default::default()
        };
        let decision = lb.select_providers(SelectionCount::All, &criteria);
        assert_eq!(decision.selected, vec!["quick".to_string()]);
        assert_eq!(decision.scores["laggy"], 0.0);
        assert!(decision.alternatives.contains(&"laggy".to_string()));
        assert!(decision.reasoning.contains("laggy skipped"));
    }

    #[test]
    fn test_lowest_cost_uses_provider_estimate_before_observations() {
        let (_, lb) = setup(
            BalancingStrategy::LowestCost,
            vec![
                (MockProvider::succeeding("budget", 0.9).with_cost(0.001), 1.0),
                (MockProvider::succeeding("premium", 0.9).with_cost(0.05), 1.0),
            ],
        );
        let decision = lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default());
        assert_eq!(decision.selected, vec!["budget".to_string()]);

        let criteria = SelectionCriteria {
            max_cost: Some(0.01),
            ..Default::default()
        };
        let decision = lb.select_providers(SelectionCount::All, &criteria);
        assert_eq!(decision.selected, vec!["budget".to_string()]);
    }

    #[test]
    fn test_least_connections() {
        let (_, lb) = setup(
            BalancingStrategy::LeastConnections,
            vec![
                (MockProvider::succeeding("busy", 0.9), 1.0),
                (MockProvider::succeeding("idle", 0.9), 1.0),
            ],
        );
        lb.record_execution_start("busy");
        lb.record_execution_start("busy");
        let decision = lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default());
        assert_eq!(decision.selected, vec!["idle".to_string()]);
    }

    #[test]
    fn test_round_robin_rotates() {
        let (_, lb) = setup(
            BalancingStrategy::RoundRobin,
            vec![
                (MockProvider::succeeding("a", 0.9), 1.0),
                (MockProvider::succeeding("b", 0.9), 1.0),
                (MockProvider::succeeding("c", 0.9), 1.0),
            ],
        );
        let picks: Vec<String> = (0..4)
            .map(|_| {
                lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default())
                    .selected[0]
                    .clone()
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_weighted_round_robin_is_proportional() {
        let (_, lb) = setup(
            BalancingStrategy::WeightedRoundRobin,
            vec![
                (MockProvider::succeeding("heavy", 0.9), 3.0),
                (MockProvider::succeeding("light", 0.9), 1.0),
            ],
        );
        let mut heavy = 0;
        for _ in 0..8 {
            let decision = lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default());
            if decision.selected[0] == "heavy" {
                heavy += 1;
            }
        }
        assert_eq!(heavy, 6);
    }

    #[test]
    fn test_half_open_and_rate_limit_reduce_availability() {
        let mut metrics = ProviderMetrics::new(10);
        let full = LoadBalancer::availability_score(&metrics);
        metrics.half_open = true;
        assert!((LoadBalancer::availability_score(&metrics) - full / 2.0).abs() < 1e-9);

        metrics.half_open = false;
        metrics.rate_limit = Some(crate::provider::RateLimitInfo {
            requests_per_minute: 100,
            requests_remaining: 0,
        });
        assert!((LoadBalancer::availability_score(&metrics) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rejection_and_cancellation_skip_latency() {
        let (_, lb) = setup(
            BalancingStrategy::Adaptive,
            vec![(MockProvider::succeeding("a", 0.9), 1.0)],
        );
        record(&lb, "a", 300, true, 0.01, 1);

        lb.record_execution_start("a");
        lb.record_rejection("a");
        lb.record_execution_start("a");
        lb.record_cancellation("a");

        let m = &lb.get_provider_metrics(Some("a"))[0];
        assert_eq!(m.active_connections, 0);
        assert_eq!(m.total_requests, 2);
        assert_eq!(m.total_failures, 1);
        assert!((m.success_rate - 0.5).abs() < 1e-9);
        assert!((m.avg_response_time_ms.unwrap() - 300.0).abs() < 1e-9);
        assert!((m.avg_cost.unwrap() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_and_statistics() {
        let (_, lb) = setup(
            BalancingStrategy::Adaptive,
            vec![(MockProvider::succeeding("a", 0.9), 1.0)],
        );
        record(&lb, "a", 200, true, 0.02, 3);
        record(&lb, "a", 400, false, 0.0, 1);
        lb.select_providers(SelectionCount::Exact(1), &SelectionCriteria::default());

        let m = &lb.get_provider_metrics(Some("a"))[0];
        assert_eq!(m.total_requests, 4);
        assert_eq!(m.total_failures, 1);
        assert_eq!(m.active_connections, 0);
        assert_eq!(m.times_selected, 1);
        assert!((m.avg_response_time_ms.unwrap() - 250.0).abs() < 1e-9);

        let stats = lb.get_statistics();
        assert_eq!(stats.total_selections, 1);
        assert!((stats.overall_success_rate - 0.75).abs() < 1e-9);

        lb.reset_metrics(Some("a"));
        assert_eq!(lb.get_provider_metrics(Some("a"))[0].total_requests, 0);
    }
}
