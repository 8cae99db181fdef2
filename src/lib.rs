//! # Provider Ensemble
//!
//! Parallel dispatch of one analysis request to several remote inference
//! providers, with per-provider failure isolation and admission control.
//!
//! ## Features
//!
//! - **Ensemble Orchestration**: wait-for-all fan-out, consensus and a blended confidence score
//! - **Circuit Breaking**: CLOSED / OPEN / HALF_OPEN state machine per provider
//! - **Rate Limiting**: token bucket or sliding window with hour/day and token ceilings and a FIFO queue
//! - **Adaptive Load Balancing**: six selection strategies over rolling metrics
//! - **Health Monitoring**: independently scheduled probes with ratio-based status
//! - **Cost Tracking**: per-model pricing, budgets and threshold alerts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use provider_ensemble::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run(openai: Arc<dyn Provider>, claude: Arc<dyn Provider>) -> Result<()> {
//! let config = EnsembleConfig::load(None)?;
//! config.init_tracing()?;
//! let orchestrator = EnsembleOrchestrator::new(config)?;
//! orchestrator.register_provider(openai, None, ProviderOptions::default())?;
//! orchestrator.register_provider(claude, None, ProviderOptions::default().with_weight(2.0))?;
//! orchestrator.start();
//!
//! let image = bytes::Bytes::from(std::fs::read("schematic.png")?);
//! let response = orchestrator
//!     .analyze_with_ensemble(image, "List every component", None)
//!     .await?;
//! println!("confidence {:.2}", response.confidence);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod circuit_breaker;
pub mod cost;
pub mod error;
pub mod health;
pub mod load_balancer;
pub mod orchestrator;
pub mod provider;
pub mod rate_limiter;
pub mod registry;
pub mod tracing_ext;
pub mod types;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use cost::{
    BudgetAlert, BudgetCheck, BudgetConfig, BudgetPeriod, BudgetStatus, CostBreakdown,
    CostSummary, CostTracker, CostTrackerConfig, ProviderPricing, UsageRecord,
};
pub use error::{Error, Result};
pub use health::{
    HealthCheckResult, HealthMonitor, HealthMonitorConfig, HealthStatus, ProviderHealthInfo,
    SystemHealthSummary,
};
pub use load_balancer::{
    BalancingStrategy, LoadBalancer, LoadBalancerConfig, SelectionCount, SelectionCriteria,
    SelectionDecision,
};
pub use orchestrator::{
    ConsensusPolicy, EnsembleConfig, EnsembleOrchestrator, EnsembleResponse,
    OrchestratorStatistics,
};
pub use provider::{AnalysisOptions, Provider, ProviderResponse, RateLimitInfo};
pub use rate_limiter::{BackoffStrategy, RateLimitConfig, RateLimitStrategy, RateLimiter};
pub use registry::{ProviderOptions, ProviderRegistry};
pub use tracing_ext::{init_tracing, LogConfig, LogFormat};
pub use types::{RequestId, TokenUsage};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use crate::cost::{CostTracker, ProviderPricing};
    pub use crate::error::{Error, Result};
    pub use crate::orchestrator::{EnsembleConfig, EnsembleOrchestrator, EnsembleResponse};
    pub use crate::provider::{AnalysisOptions, Provider, ProviderResponse, RateLimitInfo};
    pub use crate::rate_limiter::RateLimitConfig;
    pub use crate::registry::ProviderOptions;
}
