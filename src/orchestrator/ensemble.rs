//! Ensemble orchestrator
//!
//! Dispatches one request to several providers in parallel and reconciles
//! the survivors. Each provider task runs behind its circuit breaker and
//! rate limiter, is bounded by its own deadline, and records its outcome
//! whether or not the ensemble as a whole succeeds. The orchestrator waits
//! for every task to settle; one provider failing never aborts another.

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::cost::{CostTracker, UsageRecord};
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, SystemHealthSummary};
use crate::load_balancer::{LoadBalancer, LoadBalancerStatistics, SelectionCount, SelectionCriteria};
use crate::orchestrator::config::EnsembleConfig;
use crate::orchestrator::consensus::{mean_confidence, policy_for, ConsensusPolicy};
use crate::orchestrator::response::{
    AggregatedResponse, CostBreakdownSummary, EnsembleMetadata, EnsembleResponse,
    PerformanceSummary, ProviderFailure,
};
use crate::provider::{AnalysisOptions, Provider, ProviderResponse};
use crate::rate_limiter::{LimiterStatus, RateLimiter};
use crate::registry::{ProviderEntry, ProviderOptions, ProviderRegistry};
use crate::types::{RequestId, TokenUsage};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Running request counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatistics {
    /// Ensemble requests received
    pub total_requests: u64,
    /// Requests that returned a response
    pub successful_requests: u64,
    /// Requests that failed as a whole
    pub failed_requests: u64,
    /// Mean wall time of completed requests (ms)
    pub average_response_time_ms: f64,
    /// Cost attributed across all requests
    pub total_cost: f64,
    /// Registered providers
    pub registered_providers: usize,
    /// Enabled providers with a closed or half-open circuit
    pub healthy_providers: usize,
    /// Breaker snapshot per provider
    pub circuit_breakers: BTreeMap<String, CircuitSnapshot>,
    /// Rate limiter status per provider that has one
    pub rate_limiters: BTreeMap<String, LimiterStatus>,
    /// Load balancer view
    pub load_balancer: Option<LoadBalancerStatistics>,
    /// Health monitor view
    pub health: Option<SystemHealthSummary>,
}

#[derive(Debug, Default)]
struct RequestCounters {
    total: u64,
    successful: u64,
    failed: u64,
    total_time_ms: u64,
    total_cost: f64,
}

/// Builder for [`EnsembleOrchestrator`]
pub struct EnsembleBuilder {
    config: EnsembleConfig,
    consensus: Option<Box<dyn ConsensusPolicy>>,
    cost_tracker: Option<Arc<CostTracker>>,
}

impl EnsembleBuilder {
    /// Override the consensus policy chosen in configuration
    pub fn consensus_policy(mut self, policy: Box<dyn ConsensusPolicy>) -> Self {
        self.consensus = Some(policy);
        self
    }

    /// Record every provider call in a shared cost tracker
    pub fn cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = Some(tracker);
        self
    }

    /// Build a cost tracker from the `cost` section of the configuration
    pub fn with_configured_cost_tracking(mut self) -> Result<Self> {
        self.cost_tracker = Some(Arc::new(CostTracker::new(self.config.cost.clone())?));
        Ok(self)
    }

    /// Validate configuration and build the orchestrator
    pub fn build(self) -> Result<EnsembleOrchestrator> {
        self.config.validate()?;
        let registry = Arc::new(ProviderRegistry::new());
        let load_balancer = LoadBalancer::new(self.config.load_balancer.clone(), registry.clone())?;
        let health = HealthMonitor::new(self.config.health_monitor_config())?;
        let consensus = self
            .consensus
            .unwrap_or_else(|| policy_for(self.config.aggregation.policy));

        Ok(EnsembleOrchestrator {
            config: self.config,
            registry,
            load_balancer,
            health,
            cost_tracker: self.cost_tracker,
            consensus,
            counters: Mutex::new(RequestCounters::default()),
        })
    }
}

/// Outcome of one provider task
struct ProviderOutcome {
    provider: String,
    result: Result<ProviderResponse>,
    elapsed: Duration,
    cost: f64,
}

/// In-flight bookkeeping for one provider task.
///
/// A task dropped before it settles (the caller cancelled the ensemble
/// future) hands back its half-open trial slot and its load balancer
/// connection.
struct InFlight<'a> {
    entry: &'a ProviderEntry,
    load_balancer: Option<&'a LoadBalancer>,
    holds_trial: bool,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.holds_trial {
            self.entry.breaker().release_trial();
        }
        if let Some(lb) = self.load_balancer {
            lb.record_cancellation(self.entry.name());
        }
        tracing::debug!("Provider {} call cancelled", self.entry.name());
    }
}

/// Parallel multi-provider analysis with failure isolation
pub struct EnsembleOrchestrator {
    config: EnsembleConfig,
    registry: Arc<ProviderRegistry>,
    load_balancer: LoadBalancer,
    health: HealthMonitor,
    cost_tracker: Option<Arc<CostTracker>>,
    consensus: Box<dyn ConsensusPolicy>,
    counters: Mutex<RequestCounters>,
}

impl EnsembleOrchestrator {
    /// Start building an orchestrator
    pub fn builder(config: EnsembleConfig) -> EnsembleBuilder {
        EnsembleBuilder {
            config,
            consensus: None,
            cost_tracker: None,
        }
    }

    /// Build with configuration defaults for every optional part
    pub fn new(config: EnsembleConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Configuration
    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Shared provider registry
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Load balancer
    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    /// Health monitor
    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    /// Cost tracker, if attached
    pub fn cost_tracker(&self) -> Option<&Arc<CostTracker>> {
        self.cost_tracker.as_ref()
    }

    /// Register a provider.
    ///
    /// Configured `providers.enabled`, `providers.priority` and
    /// `providers.weights` take precedence over `options`. Without a breaker
    /// one is built from `circuit_breaker`; a rate limiter is built when
    /// `rate_limits` has an entry for the provider.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime after [`Self::start`],
    /// since the provider's probe loop is spawned right away.
    pub fn register_provider(
        &self,
        provider: Arc<dyn Provider>,
        breaker: Option<Arc<CircuitBreaker>>,
        options: ProviderOptions,
    ) -> Result<()> {
        let name = provider.name().to_string();
        let mut options = options;
        let providers = &self.config.providers;
        if !providers.enabled.is_empty() && !providers.enabled.contains(&name) {
            options.enabled = false;
        }
        if let Some(priority) = providers.priority.get(&name) {
            options.priority = *priority;
        }
        if let Some(weight) = providers.weights.get(&name) {
            options.weight = *weight;
        }

        let breaker = breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(&name, self.config.circuit_breaker.clone()))
        });
        let limiter = match self.config.rate_limits.get(&name) {
            Some(limits) => Some(Arc::new(RateLimiter::new(&name, limits.clone())?)),
            None => None,
        };

        let entry = self
            .registry
            .register(provider.clone(), breaker.clone(), limiter, options)?;
        self.load_balancer.register_provider(&name);
        if self.config.monitoring.enable_health_checks {
            self.health.register_provider(provider, Some(breaker), None);
        }

        tracing::info!(
            "Registered provider {} (priority {}, weight {}, enabled {})",
            name,
            entry.priority(),
            entry.weight(),
            entry.is_enabled()
        );
        Ok(())
    }

    /// Remove a provider and stop its rate limiter
    pub async fn unregister_provider(&self, name: &str) -> Result<()> {
        let entry = self
            .registry
            .unregister(name)
            .ok_or_else(|| Error::provider(name, "not registered"))?;
        self.load_balancer.remove_provider(name);
        self.health.unregister_provider(name);
        if let Some(limiter) = entry.limiter() {
            limiter.shutdown().await;
        }
        tracing::info!("Unregistered provider {}", name);
        Ok(())
    }

    /// Enabled providers in priority order
    pub fn get_available_providers(&self) -> Vec<String> {
        self.registry
            .enabled()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Enabled providers whose circuit is not open, in priority order
    pub fn get_healthy_providers(&self) -> Vec<String> {
        self.registry
            .healthy()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Start health probing and cost maintenance
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since both run as spawned tasks.
    pub fn start(&self) {
        if self.config.monitoring.enable_health_checks {
            self.health.start();
        }
        if let Some(tracker) = &self.cost_tracker {
            tracker.start();
        }
        tracing::info!("Ensemble orchestrator started");
    }

    /// Stop every background task and fail queued admissions
    pub async fn shutdown(&self) {
        self.health.stop().await;
        for entry in self.registry.all() {
            if let Some(limiter) = entry.limiter() {
                limiter.shutdown().await;
            }
        }
        if let Some(tracker) = &self.cost_tracker {
            tracker.stop().await;
        }
        tracing::info!("Ensemble orchestrator shut down");
    }

    /// Probe every monitored provider now and feed the results to the
    /// load balancer
    pub async fn perform_health_check(&self) -> SystemHealthSummary {
        let results = self.health.check_all_providers().await;
        for result in results.iter().filter(|r| !r.is_healthy()) {
            tracing::debug!(
                "Health probe for {} returned {}",
                result.provider,
                result.status
            );
        }
        self.sync_balancer();
        self.health.get_system_health_summary()
    }

    /// Running counters plus component views
    pub fn get_statistics(&self) -> OrchestratorStatistics {
        let (total, successful, failed, total_time_ms, total_cost) = {
            let c = self.counters.lock();
            (c.total, c.successful, c.failed, c.total_time_ms, c.total_cost)
        };
        let completed = successful + failed;
        let entries = self.registry.all();

        OrchestratorStatistics {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            average_response_time_ms: if completed == 0 {
                0.0
            } else {
                total_time_ms as f64 / completed as f64
            },
            total_cost,
            registered_providers: entries.len(),
            healthy_providers: entries.iter().filter(|e| e.is_healthy()).count(),
            circuit_breakers: entries
                .iter()
                .map(|e| (e.name().to_string(), e.breaker().snapshot()))
                .collect(),
            rate_limiters: entries
                .iter()
                .filter_map(|e| e.limiter().map(|l| (e.name().to_string(), l.get_status())))
                .collect(),
            load_balancer: self
                .config
                .monitoring
                .enable_performance_tracking
                .then(|| self.load_balancer.get_statistics()),
            health: self
                .config
                .monitoring
                .enable_health_checks
                .then(|| self.health.get_system_health_summary()),
        }
    }

    /// Analyze `image` with `prompt` across the selected providers.
    ///
    /// Fails only when fewer than `min_providers_required` providers are
    /// healthy, or when every dispatched provider fails.
    pub async fn analyze_with_ensemble(
        &self,
        image: Bytes,
        prompt: &str,
        options: Option<AnalysisOptions>,
    ) -> Result<EnsembleResponse> {
        let options = options.unwrap_or_else(AnalysisOptions::new);
        let request_id = RequestId::new();
        let started_at = Utc::now();
        let start = Instant::now();
        self.counters.lock().total += 1;

        let healthy = self.registry.healthy();
        let required = self.config.performance.min_providers_required;
        if healthy.len() < required {
            self.finish(false, start, 0.0);
            return Err(Error::analysis(format!(
                "Insufficient healthy providers: {} available, {} required",
                healthy.len(),
                required
            )));
        }

        let (selected, selection_reasoning) = self.select(&options, &healthy);
        if selected.is_empty() {
            self.finish(false, start, 0.0);
            return Err(Error::analysis("No providers eligible for this request"));
        }

        let perf = &self.config.performance;
        let budget = options
            .timeout()
            .unwrap_or_else(|| perf.max_provider_timeout())
            .min(perf.max_provider_timeout())
            .min(perf.max_total_timeout());
        let deadline = start + budget;

        tracing::debug!(
            "Ensemble request {} dispatching to {:?} (timeout {}ms)",
            request_id,
            selected.iter().map(|e| e.name()).collect::<Vec<_>>(),
            budget.as_millis()
        );

        let tasks = selected.iter().map(|entry| {
            self.run_provider(
                entry.clone(),
                image.clone(),
                prompt,
                &options,
                deadline,
                budget,
                request_id,
            )
        });
        let outcomes = join_all(tasks).await;
        let wall_time = start.elapsed();

        let attempted: Vec<String> = outcomes.iter().map(|o| o.provider.clone()).collect();
        let mut individual = Vec::new();
        let mut failed = Vec::new();
        let mut timings = Vec::new();
        let mut cost = CostBreakdownSummary::default();
        for outcome in outcomes {
            let ms = outcome.elapsed.as_millis() as u64;
            match outcome.result {
                Ok(mut response) => {
                    timings.push((outcome.provider.clone(), ms, true));
                    response.response_time_ms = ms;
                    cost.total_cost += outcome.cost;
                    cost.total_tokens += response.tokens_used;
                    cost.by_provider.insert(outcome.provider, outcome.cost);
                    individual.push(response);
                }
                Err(e) => {
                    timings.push((outcome.provider.clone(), ms, false));
                    failed.push(ProviderFailure::new(outcome.provider, &e));
                }
            }
        }

        if individual.is_empty() {
            self.finish(false, start, 0.0);
            let reasons: Vec<String> = failed
                .iter()
                .map(|f| format!("{}: {}", f.provider, f.error))
                .collect();
            tracing::error!(
                "Ensemble request {} failed: all {} providers failed",
                request_id,
                attempted.len()
            );
            return Err(Error::analysis(format!(
                "All {} providers failed: {}",
                attempted.len(),
                reasons.join("; ")
            )));
        }

        let consensus = self.consensus.reconcile(&individual, &self.config.aggregation);
        let completeness = individual.len() as f64 / attempted.len() as f64;
        let confidence = self.ensemble_confidence(
            consensus.agreement_level,
            completeness,
            mean_confidence(&individual),
        );
        let aggregated = AggregatedResponse::from_responses(&individual, &cost.by_provider);

        let circuit_breakers = attempted
            .iter()
            .filter_map(|name| {
                self.registry
                    .get(name)
                    .map(|e| (name.clone(), e.breaker().snapshot()))
            })
            .collect();
        let providers_successful = individual.iter().map(|r| r.provider.clone()).collect();
        let wall_ms = wall_time.as_millis() as u64;

        self.finish(true, start, cost.total_cost);
        tracing::info!(
            "Ensemble request {} completed: {}/{} providers succeeded in {}ms",
            request_id,
            individual.len(),
            attempted.len(),
            wall_ms
        );

        Ok(EnsembleResponse {
            request_id,
            individual,
            aggregated,
            consensus,
            confidence,
            metadata: EnsembleMetadata {
                started_at,
                completed_at: Utc::now(),
                providers_attempted: attempted,
                providers_successful,
                providers_failed: failed,
                selection_reasoning,
                circuit_breakers,
                cost,
                performance: PerformanceSummary::compute(wall_ms, &timings),
            },
        })
    }

    fn select(
        &self,
        options: &AnalysisOptions,
        healthy: &[Arc<ProviderEntry>],
    ) -> (Vec<Arc<ProviderEntry>>, String) {
        if self.config.performance.enable_load_balancing {
            self.sync_balancer();
            let count = options
                .max_providers
                .map(SelectionCount::Exact)
                .unwrap_or(SelectionCount::All);
            let decision = self
                .load_balancer
                .select_providers(count, &SelectionCriteria::from(options));
            let selected = decision
                .selected
                .iter()
                .filter_map(|name| self.registry.get(name))
                .collect();
            return (selected, decision.reasoning);
        }

        let mut selected: Vec<_> = healthy
            .iter()
            .filter(|e| !options.exclude.iter().any(|x| x == e.name()))
            .cloned()
            .collect();
        if let Some(max) = options.max_providers {
            selected.truncate(max);
        }
        let reasoning = format!(
            "Load balancing disabled; dispatching to {} healthy providers in priority order",
            selected.len()
        );
        (selected, reasoning)
    }

    /// Push health availability and breaker state into the load balancer
    fn sync_balancer(&self) {
        for entry in self.registry.all() {
            let name = entry.name();
            if self.config.monitoring.enable_health_checks {
                self.load_balancer
                    .update_availability(name, self.health.availability(name));
            }
            self.load_balancer
                .update_circuit_state(name, entry.breaker().state());
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_provider(
        &self,
        entry: Arc<ProviderEntry>,
        image: Bytes,
        prompt: &str,
        options: &AnalysisOptions,
        deadline: Instant,
        budget: Duration,
        request_id: RequestId,
    ) -> ProviderOutcome {
        let name = entry.name().to_string();
        let tracking = self.config.monitoring.enable_performance_tracking;
        let task_start = Instant::now();
        if tracking {
            self.load_balancer.record_execution_start(&name);
        }
        let mut in_flight = InFlight {
            entry: entry.as_ref(),
            load_balancer: tracking.then_some(&self.load_balancer),
            holds_trial: false,
            settled: false,
        };

        if !entry.breaker().allow_request() {
            in_flight.settled = true;
            tracing::debug!("Provider {} skipped: circuit open", name);
            if tracking {
                self.load_balancer.record_rejection(&name);
            }
            return ProviderOutcome {
                result: Err(Error::CircuitOpen(name.clone())),
                provider: name,
                elapsed: Duration::ZERO,
                cost: 0.0,
            };
        }
        in_flight.holds_trial = true;

        let reserved = options.estimated_tokens.unwrap_or(0);
        let admission = match entry.limiter() {
            Some(limiter) => match timeout_at(deadline, limiter.acquire_permission(reserved)).await {
                Ok(Ok(permit)) => {
                    if permit.queued {
                        tracing::debug!(
                            "Provider {} admitted after {}ms in queue",
                            name,
                            permit.waited.as_millis()
                        );
                    }
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Timeout {
                    provider: name.clone(),
                    timeout: budget,
                }),
            },
            None => Ok(()),
        };

        let admitted = admission.is_ok();
        let result = match admission {
            Ok(()) => {
                match timeout_at(deadline, entry.provider().analyze(image, prompt, options)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        provider: name.clone(),
                        timeout: budget,
                    }),
                }
            }
            Err(e) => Err(e),
        };
        let elapsed = task_start.elapsed();
        in_flight.settled = true;

        let (usage, cost) = match &result {
            Ok(response) => {
                entry.breaker().record_success();
                (response.usage(), self.price(&entry, response, options.has_vision))
            }
            Err(e) => {
                tracing::warn!("Provider {} failed: {}", name, e);
                entry.breaker().record_failure();
                (TokenUsage::default(), 0.0)
            }
        };
        let success = result.is_ok();

        if admitted {
            if let Some(limiter) = entry.limiter() {
                limiter.record_request(usage.total_tokens.saturating_sub(reserved), success);
            }
            if let Some(tracker) = &self.cost_tracker {
                let model = result
                    .as_ref()
                    .ok()
                    .and_then(|r| r.model.clone())
                    .unwrap_or_else(|| entry.provider().version().to_string());
                tracker.record_usage(
                    UsageRecord::new(
                        &name,
                        model,
                        usage,
                        cost,
                        success,
                        elapsed.as_millis() as u64,
                    )
                    .with_request_id(request_id),
                );
            }
        }
        if tracking {
            self.load_balancer
                .record_execution(&name, elapsed, success, usage.total_tokens, cost);
        }

        ProviderOutcome {
            provider: name,
            result,
            elapsed,
            cost,
        }
    }

    /// Cost from the tracker's pricing table, else the provider's own estimate
    fn price(&self, entry: &ProviderEntry, response: &ProviderResponse, has_vision: bool) -> f64 {
        if let Some(tracker) = self.cost_tracker.as_ref().filter(|t| t.has_pricing(entry.name())) {
            match tracker.calculate_cost(
                entry.name(),
                response.model.as_deref(),
                &response.usage(),
                has_vision,
            ) {
                Ok(breakdown) => return breakdown.total_cost,
                Err(e) => tracing::warn!("Pricing {} failed: {}", entry.name(), e),
            }
        }
        entry.provider().cost(response.tokens_used)
    }

    fn ensemble_confidence(&self, agreement: f64, completeness: f64, mean: f64) -> f64 {
        let w = self.config.aggregation.confidence_weighting;
        let total = w.agreement + w.completeness + w.consistency;
        if total <= 0.0 {
            return mean.clamp(0.0, 1.0);
        }
        ((w.agreement * agreement + w.completeness * completeness + w.consistency * mean) / total)
            .clamp(0.0, 1.0)
    }

    fn finish(&self, success: bool, start: Instant, cost: f64) {
        let mut c = self.counters.lock();
        if success {
            c.successful += 1;
        } else {
            c.failed += 1;
        }
        c.total_time_ms += start.elapsed().as_millis() as u64;
        c.total_cost += cost;
    }
}

impl std::fmt::Debug for EnsembleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleOrchestrator")
            .field("providers", &self.registry.len())
            .field("consensus", &self.consensus.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::cost::{CostTrackerConfig, ProviderPricing};
    use crate::health::HealthStatus;
    use crate::orchestrator::config::ConsensusKind;
    use crate::orchestrator::consensus::MajorityVote;
    use crate::orchestrator::response::FailureKind;
    use crate::provider::mock::{MockBehavior, MockProvider};
    use crate::rate_limiter::RateLimitConfig;
    use serde_json::json;

    fn image() -> Bytes {
        Bytes::from_static(b"\x89PNG")
    }

    fn orchestrator(config: EnsembleConfig) -> EnsembleOrchestrator {
        EnsembleOrchestrator::new(config).unwrap()
    }

    fn register(orch: &EnsembleOrchestrator, provider: Arc<MockProvider>) {
        orch.register_provider(provider, None, ProviderOptions::default())
            .unwrap();
    }

    #[tokio::test]
    async fn test_all_providers_succeed() {
        let orch = orchestrator(EnsembleConfig::default());
        for (name, confidence) in [("a", 0.9), ("b", 0.8), ("c", 0.7)] {
            register(&orch, Arc::new(MockProvider::succeeding(name, confidence)));
        }

        let response = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap();

        assert_eq!(response.individual.len(), 3);
        assert_eq!(response.metadata.providers_attempted.len(), 3);
        assert!(response.metadata.providers_failed.is_empty());
        assert_eq!(response.aggregated.primary_provider, "a");
        assert!((response.consensus.agreement_level - 0.8).abs() < 1e-9);
        // 0.4 * 0.8 + 0.3 * 1.0 + 0.3 * 0.8
        assert!((response.confidence - 0.86).abs() < 1e-9);
        assert_eq!(response.metadata.circuit_breakers.len(), 3);
        assert_eq!(response.metadata.cost.total_tokens, 300);
        assert!(response.metadata.performance.parallel_efficiency > 0.0);
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_siblings() {
        let orch = orchestrator(EnsembleConfig::default());
        let good = Arc::new(MockProvider::succeeding("good", 0.9));
        let bad = Arc::new(MockProvider::failing("bad", "model overloaded"));
        register(&orch, good.clone());
        register(&orch, bad.clone());

        let response = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap();

        assert_eq!(response.metadata.providers_successful, vec!["good"]);
        let failure = &response.metadata.providers_failed[0];
        assert_eq!(failure.provider, "bad");
        assert_eq!(failure.kind, FailureKind::Provider);
        assert!(failure.error.contains("model overloaded"));
        assert_eq!(good.call_count(), 1);
        assert_eq!(bad.call_count(), 1);

        let breaker = orch.registry().require("bad").unwrap().breaker().snapshot();
        assert_eq!(breaker.total_failures, 1);
        let metrics = orch.load_balancer().get_provider_metrics(Some("bad"));
        assert_eq!(metrics[0].total_failures, 1);
        assert_eq!(metrics[0].active_connections, 0);
    }

    #[tokio::test]
    async fn test_all_providers_fail() {
        let orch = orchestrator(EnsembleConfig::default());
        register(&orch, Arc::new(MockProvider::failing("a", "boom")));
        register(&orch, Arc::new(MockProvider::failing("b", "bust")));

        let err = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, Error::Analysis(_)));
        assert!(message.contains("All 2 providers failed"));
        assert!(message.contains("boom") && message.contains("bust"));

        let stats = orch.get_statistics();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_insufficient_healthy_providers() {
        let mut config = EnsembleConfig::default();
        config.performance.min_providers_required = 2;
        let orch = orchestrator(config);
        let only = Arc::new(MockProvider::succeeding("only", 0.9));
        register(&orch, only.clone());

        let err = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Analysis error: Insufficient healthy providers: 1 available, 2 required"
        );
        assert_eq!(only.call_count(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_is_never_called() {
        let orch = orchestrator(EnsembleConfig::default());
        let flaky = Arc::new(MockProvider::succeeding("flaky", 0.9));
        let breaker = Arc::new(CircuitBreaker::new("flaky", CircuitBreakerConfig::strict()));
        orch.register_provider(flaky.clone(), Some(breaker.clone()), ProviderOptions::default())
            .unwrap();
        register(&orch, Arc::new(MockProvider::succeeding("steady", 0.8)));

        for _ in 0..breaker.config().failure_threshold {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(orch.get_healthy_providers(), vec!["steady"]);

        let response = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap();
        assert_eq!(response.metadata.providers_attempted, vec!["steady"]);
        assert_eq!(flaky.call_count(), 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let mut config = EnsembleConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        let orch = orchestrator(config);
        let bad = Arc::new(MockProvider::failing("bad", "down"));
        register(&orch, bad.clone());
        register(&orch, Arc::new(MockProvider::succeeding("good", 0.9)));

        for _ in 0..3 {
            orch.analyze_with_ensemble(image(), "describe", None)
                .await
                .unwrap();
        }
        assert_eq!(bad.call_count(), 2);
        let breaker = orch.registry().require("bad").unwrap().breaker().clone();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_provider_failure() {
        let orch = orchestrator(EnsembleConfig::default());
        let stuck = Arc::new(MockProvider::new("stuck", MockBehavior::Hang));
        register(&orch, stuck.clone());
        register(&orch, Arc::new(MockProvider::succeeding("quick", 0.9)));

        let options = AnalysisOptions::new().with_timeout(Duration::from_millis(500));
        let response = orch
            .analyze_with_ensemble(image(), "describe", Some(options))
            .await
            .unwrap();

        assert_eq!(response.metadata.providers_successful, vec!["quick"]);
        let failure = &response.metadata.providers_failed[0];
        assert_eq!(failure.provider, "stuck");
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(stuck.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_timeout_is_capped() {
        let mut config = EnsembleConfig::default();
        config.performance.max_provider_timeout_ms = 1_000;
        let orch = orchestrator(config);
        register(&orch, Arc::new(MockProvider::new("stuck", MockBehavior::Hang)));
        register(&orch, Arc::new(MockProvider::succeeding("quick", 0.9)));

        let options = AnalysisOptions::new().with_timeout(Duration::from_secs(120));
        let start = Instant::now();
        orch.analyze_with_ensemble(image(), "describe", Some(options))
            .await
            .unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1_000));
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_every_provider_to_settle() {
        let orch = orchestrator(EnsembleConfig::default());
        register(&orch, Arc::new(MockProvider::succeeding("a", 0.9)));
        register(&orch, Arc::new(MockProvider::new("b", MockBehavior::Hang)));
        register(&orch, Arc::new(MockProvider::failing("c", "invalid image")));

        let options = AnalysisOptions::new().with_timeout(Duration::from_millis(500));
        let start = Instant::now();
        let response = orch
            .analyze_with_ensemble(image(), "describe", Some(options))
            .await
            .unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_secs(1));

        assert_eq!(response.individual.len(), 1);
        assert_eq!(response.metadata.providers_successful, vec!["a"]);
        assert_eq!(response.metadata.providers_attempted.len(), 3);
        assert_eq!(response.metadata.providers_failed.len(), 2);

        let failed = |name: &str| {
            response
                .metadata
                .providers_failed
                .iter()
                .find(|f| f.provider == name)
                .unwrap()
                .clone()
        };
        let timed_out = failed("b");
        assert_eq!(timed_out.kind, FailureKind::Timeout);
        assert_eq!(timed_out.error, "Provider b timed out after 500ms");
        let errored = failed("c");
        assert_eq!(errored.kind, FailureKind::Provider);
        assert!(errored.error.contains("invalid image"));

        let breaker = orch.registry().require("c").unwrap().breaker().snapshot();
        assert_eq!(breaker.consecutive_failures, 1);
        assert_eq!(breaker.total_failures, 1);
        for name in ["b", "c"] {
            let m = &orch.load_balancer().get_provider_metrics(Some(name))[0];
            assert_eq!(m.total_requests, 1);
            assert_eq!(m.total_failures, 1);
            assert_eq!(m.active_connections, 0);
        }
        let a = &orch.load_balancer().get_provider_metrics(Some("a"))[0];
        assert_eq!(a.total_failures, 0);
        assert_eq!(orch.get_statistics().successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_lock_out_provider() {
        let mut config = EnsembleConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration_ms: 1_000,
            half_open_max_calls: 1,
        };
        let orch = orchestrator(config);
        let slow = Arc::new(MockProvider::new("slow", MockBehavior::Hang));
        register(&orch, slow.clone());

        let breaker = orch.registry().require("slow").unwrap().breaker().clone();
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            orch.analyze_with_ensemble(image(), "describe", None),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(slow.call_count(), 1);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.is_open());
        assert_eq!(orch.get_healthy_providers(), vec!["slow"]);
        let metrics = orch.load_balancer().get_provider_metrics(Some("slow"));
        assert_eq!(metrics[0].active_connections, 0);

        slow.set_behavior(MockBehavior::Succeed { confidence: 0.9 });
        let response = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap();
        assert_eq!(response.metadata.providers_successful, vec!["slow"]);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rate_limited_provider_is_not_called() {
        let mut config = EnsembleConfig::default();
        config
            .rate_limits
            .insert("limited".to_string(), RateLimitConfig::per_minute(1));
        let orch = orchestrator(config);
        let limited = Arc::new(MockProvider::succeeding("limited", 0.9));
        register(&orch, limited.clone());
        register(&orch, Arc::new(MockProvider::succeeding("open", 0.8)));

        orch.analyze_with_ensemble(image(), "first", None)
            .await
            .unwrap();
        let second = orch
            .analyze_with_ensemble(image(), "second", None)
            .await
            .unwrap();

        assert_eq!(limited.call_count(), 1);
        let failure = second
            .metadata
            .providers_failed
            .iter()
            .find(|f| f.provider == "limited")
            .unwrap();
        assert_eq!(failure.kind, FailureKind::RateLimited);
        assert!(orch.get_statistics().rate_limiters.contains_key("limited"));
    }

    #[tokio::test]
    async fn test_max_providers_limits_dispatch() {
        let orch = orchestrator(EnsembleConfig::default());
        for name in ["a", "b", "c"] {
            register(&orch, Arc::new(MockProvider::succeeding(name, 0.9)));
        }
        let options = AnalysisOptions::new().with_max_providers(2).require("c");
        let response = orch
            .analyze_with_ensemble(image(), "describe", Some(options))
            .await
            .unwrap();
        assert_eq!(response.metadata.providers_attempted.len(), 2);
        assert!(response
            .metadata
            .providers_attempted
            .contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_without_load_balancing_excludes_are_honoured() {
        let mut config = EnsembleConfig::default();
        config.performance.enable_load_balancing = false;
        let orch = orchestrator(config);
        let skipped = Arc::new(MockProvider::succeeding("skipped", 0.9));
        register(&orch, skipped.clone());
        register(&orch, Arc::new(MockProvider::succeeding("used", 0.9)));

        let options = AnalysisOptions::new().exclude("skipped");
        let response = orch
            .analyze_with_ensemble(image(), "describe", Some(options))
            .await
            .unwrap();
        assert_eq!(response.metadata.providers_attempted, vec!["used"]);
        assert_eq!(skipped.call_count(), 0);
        assert!(response.metadata.selection_reasoning.contains("disabled"));
    }

    #[tokio::test]
    async fn test_usage_recorded_in_cost_tracker() {
        let mut cost = CostTrackerConfig::default();
        cost.pricing
            .insert("priced".to_string(), ProviderPricing::new(0.01, 0.02, 0.01));
        let tracker = Arc::new(CostTracker::new(cost).unwrap());
        let orch = EnsembleOrchestrator::builder(EnsembleConfig::default())
            .cost_tracker(tracker.clone())
            .build()
            .unwrap();
        register(&orch, Arc::new(MockProvider::succeeding("priced", 0.9)));
        register(&orch, Arc::new(MockProvider::succeeding("unpriced", 0.9).with_cost(0.5)));

        let response = orch
            .analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap();

        // 100 output tokens at 0.02/1k plus the 0.01 vision surcharge
        let priced = response.metadata.cost.by_provider["priced"];
        assert!((priced - 0.012).abs() < 1e-9);
        // provider's own estimate: 100 tokens at 0.5/1k
        let unpriced = response.metadata.cost.by_provider["unpriced"];
        assert!((unpriced - 0.05).abs() < 1e-9);

        let summary = tracker.get_cost_summary(
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
        );
        assert_eq!(summary.total_requests, 2);
        assert!((summary.total_cost - 0.062).abs() < 1e-9);
        let history = tracker.get_usage_history(
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
            Some("priced"),
        );
        assert_eq!(history[0].request_id, Some(response.request_id));
    }

    #[tokio::test]
    async fn test_configured_overrides_apply_at_registration() {
        let config = EnsembleConfig::from_yaml(
            "providers:\n  enabled: [a, b]\n  priority:\n    b: 1\n  weights:\n    a: 3.0\n",
        )
        .unwrap();
        let orch = orchestrator(config);
        for name in ["a", "b", "c"] {
            register(&orch, Arc::new(MockProvider::succeeding(name, 0.9)));
        }

        assert_eq!(orch.get_available_providers(), vec!["b", "a"]);
        assert_eq!(orch.registry().require("a").unwrap().weight(), 3.0);
        assert!(!orch.registry().require("c").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let orch = orchestrator(EnsembleConfig::default());
        register(&orch, Arc::new(MockProvider::succeeding("a", 0.9)));
        let duplicate = orch.register_provider(
            Arc::new(MockProvider::succeeding("a", 0.5)),
            None,
            ProviderOptions::default(),
        );
        assert!(duplicate.is_err());

        orch.unregister_provider("a").await.unwrap();
        assert!(orch.get_available_providers().is_empty());
        assert!(orch.health_monitor().get_provider_health("a").is_none());
        assert!(orch.unregister_provider("a").await.is_err());
    }

    #[tokio::test]
    async fn test_health_check_updates_balancer() {
        let orch = orchestrator(EnsembleConfig::default());
        let sick = Arc::new(MockProvider::succeeding("sick", 0.9));
        sick.set_healthy(false);
        register(&orch, sick);
        register(&orch, Arc::new(MockProvider::succeeding("well", 0.9)));

        let summary = orch.perform_health_check().await;
        assert_eq!(summary.total_providers, 2);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.overall_status, HealthStatus::Unhealthy);

        let metrics = orch.load_balancer().get_provider_metrics(Some("sick"));
        assert_eq!(metrics[0].availability, 0.0);
    }

    #[tokio::test]
    async fn test_majority_vote_policy() {
        let mut config = EnsembleConfig::default();
        config.aggregation.policy = ConsensusKind::MajorityVote;
        let orch = orchestrator(config);
        for (name, kind) in [("a", "filter"), ("b", "filter"), ("c", "amplifier")] {
            register(
                &orch,
                Arc::new(MockProvider::new(
                    name,
                    MockBehavior::SucceedWith {
                        content: json!({ "kind": kind }),
                        confidence: 0.9,
                    },
                )),
            );
        }

        let response = orch
            .analyze_with_ensemble(image(), "classify", None)
            .await
            .unwrap();
        assert_eq!(response.consensus.policy, "majority_vote");
        assert_eq!(response.consensus.content, json!({ "kind": "filter" }));
        assert!((response.consensus.agreement_level - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_builder_policy_overrides_config() {
        let orch = EnsembleOrchestrator::builder(EnsembleConfig::default())
            .consensus_policy(Box::new(MajorityVote))
            .build()
            .unwrap();
        assert!(format!("{:?}", orch).contains("majority_vote"));
    }

    #[tokio::test]
    async fn test_statistics_and_lifecycle() {
        let orch = orchestrator(EnsembleConfig::default());
        register(&orch, Arc::new(MockProvider::succeeding("a", 0.9)));
        orch.start();
        assert!(orch.health_monitor().is_running());

        orch.analyze_with_ensemble(image(), "describe", None)
            .await
            .unwrap();
        let stats = orch.get_statistics();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.registered_providers, 1);
        assert_eq!(stats.healthy_providers, 1);
        assert!(stats.load_balancer.is_some());

        orch.shutdown().await;
        assert!(!orch.health_monitor().is_running());
    }
}
