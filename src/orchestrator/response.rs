//! Ensemble response types

use crate::circuit_breaker::CircuitSnapshot;
use crate::error::Error;
use crate::orchestrator::consensus::ConsensusResult;
use crate::provider::ProviderResponse;
use crate::types::RequestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of one ensemble request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleResponse {
    /// Request identifier, also used on usage records
    pub request_id: RequestId,
    /// Successful provider responses
    pub individual: Vec<ProviderResponse>,
    /// Primary answer plus comparison
    pub aggregated: AggregatedResponse,
    /// Reconciled outcome
    pub consensus: ConsensusResult,
    /// Ensemble confidence in [0, 1]
    pub confidence: f64,
    /// Timings, outcomes and cost
    pub metadata: EnsembleMetadata,
}

/// Primary content and per-provider comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResponse {
    /// Content of the most confident response
    pub primary: serde_json::Value,
    /// Provider of the primary content
    pub primary_provider: String,
    /// One row per successful provider
    pub comparison: Vec<ProviderComparison>,
}

/// Comparison row for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderComparison {
    /// Provider name
    pub provider: String,
    /// Reported confidence
    pub confidence: f64,
    /// Measured latency (ms)
    pub response_time_ms: u64,
    /// Tokens used
    pub tokens_used: u64,
    /// Cost attributed to the call
    pub cost: f64,
}

impl AggregatedResponse {
    /// Build from successful responses; costs keyed by provider
    pub fn from_responses(responses: &[ProviderResponse], costs: &BTreeMap<String, f64>) -> Self {
        let primary = responses
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        Self {
            primary: primary
                .map(|r| r.content.clone())
                .unwrap_or(serde_json::Value::Null),
            primary_provider: primary.map(|r| r.provider.clone()).unwrap_or_default(),
            comparison: responses
                .iter()
                .map(|r| ProviderComparison {
                    provider: r.provider.clone(),
                    confidence: r.confidence,
                    response_time_ms: r.response_time_ms,
                    tokens_used: r.tokens_used,
                    cost: costs.get(&r.provider).copied().unwrap_or(0.0),
                })
                .collect(),
        }
    }
}

/// Why a provider contributed no response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Breaker was open, call never attempted
    CircuitOpen,
    /// Rate limiter rejected or queue timed out
    RateLimited,
    /// Call exceeded its time budget
    Timeout,
    /// Provider reported an error
    Provider,
    /// Anything else
    Other,
}

impl From<&Error> for FailureKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::CircuitOpen(_) => Self::CircuitOpen,
            Error::RateLimitExceeded { .. } | Error::QueueTimeout { .. } => Self::RateLimited,
            Error::Timeout { .. } => Self::Timeout,
            Error::Provider { .. } | Error::Analysis(_) => Self::Provider,
            _ => Self::Other,
        }
    }
}

/// One failed provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailure {
    /// Provider name
    pub provider: String,
    /// Error message
    pub error: String,
    /// Failure category
    pub kind: FailureKind,
}

impl ProviderFailure {
    /// Capture a provider error
    pub fn new(provider: impl Into<String>, error: &Error) -> Self {
        Self {
            provider: provider.into(),
            error: error.to_string(),
            kind: FailureKind::from(error),
        }
    }
}

/// Cost of one request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdownSummary {
    /// Sum over providers
    pub total_cost: f64,
    /// Per-provider cost
    pub by_provider: BTreeMap<String, f64>,
    /// Tokens used across providers
    pub total_tokens: u64,
}

/// Wall-clock and per-provider latency figures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Wall-clock duration of the request (ms)
    pub wall_time_ms: u64,
    /// Sum of per-provider durations (ms)
    pub sum_provider_time_ms: u64,
    /// Fastest successful provider
    pub fastest_provider: Option<String>,
    /// Slowest successful provider
    pub slowest_provider: Option<String>,
    /// Summed latency over wall time × providers attempted, in [0, 1]
    pub parallel_efficiency: f64,
}

impl PerformanceSummary {
    /// Compute from per-provider timings `(provider, ms, success)`
    pub fn compute(wall_time_ms: u64, timings: &[(String, u64, bool)]) -> Self {
        let sum: u64 = timings.iter().map(|(_, ms, _)| ms).sum();
        let successful = || timings.iter().filter(|(_, _, ok)| *ok);
        let parallel_efficiency = if wall_time_ms == 0 || timings.is_empty() {
            0.0
        } else {
            (sum as f64 / (wall_time_ms as f64 * timings.len() as f64)).clamp(0.0, 1.0)
        };
        Self {
            wall_time_ms,
            sum_provider_time_ms: sum,
            fastest_provider: successful()
                .min_by_key(|(_, ms, _)| *ms)
                .map(|(p, _, _)| p.clone()),
            slowest_provider: successful()
                .max_by_key(|(_, ms, _)| *ms)
                .map(|(p, _, _)| p.clone()),
            parallel_efficiency,
        }
    }
}

/// Request metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleMetadata {
    /// Dispatch time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Providers dispatched to
    pub providers_attempted: Vec<String>,
    /// Providers that returned a response
    pub providers_successful: Vec<String>,
    /// Providers that failed, with reasons
    pub providers_failed: Vec<ProviderFailure>,
    /// Load balancer reasoning
    pub selection_reasoning: String,
    /// Breaker state of each attempted provider after the request
    pub circuit_breakers: BTreeMap<String, CircuitSnapshot>,
    /// Cost of the request
    pub cost: CostBreakdownSummary,
    /// Latency figures
    pub performance: PerformanceSummary,
}
