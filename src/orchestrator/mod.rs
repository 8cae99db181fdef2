//! Orchestrator module - parallel multi-provider analysis
//!
//! The [`EnsembleOrchestrator`] sends one request to several providers at
//! once and reconciles whatever comes back. Every provider call passes
//! through that provider's circuit breaker and rate limiter, and every
//! outcome feeds the load balancer, the health view and the cost tracker.
//!
//! # Consensus policies
//!
//! - **ConfidenceAverage**: first response wins, agreement is mean confidence
//! - **MajorityVote**: confidence-weighted vote per topic with text clustering
//!
//! # Example
//!
//! ```rust,ignore
//! use provider_ensemble::orchestrator::{EnsembleConfig, EnsembleOrchestrator};
//! use provider_ensemble::registry::ProviderOptions;
//!
//! let config = EnsembleConfig::from_file("ensemble.yaml")?;
//! let orchestrator = EnsembleOrchestrator::new(config)?;
//! orchestrator.register_provider(openai, None, ProviderOptions::default())?;
//! orchestrator.start();
//!
//! let response = orchestrator
//!     .analyze_with_ensemble(image, "List every component", None)
//!     .await?;
//! println!("{} ({:.2})", response.aggregated.primary, response.confidence);
//! ```

pub mod config;
pub mod consensus;
pub mod ensemble;
pub mod response;

// Re-exports
pub use config::{
    AggregationConfig,
    ConfidenceWeighting,
    ConsensusKind,
    EnsembleConfig,
    MonitoringConfig,
    PerformanceConfig,
    ProvidersConfig,
};
pub use consensus::{
    ConfidenceAverage,
    ConsensusPolicy,
    ConsensusResult,
    MajorityVote,
    TopicVote,
    VoteOption,
};
pub use ensemble::{EnsembleBuilder, EnsembleOrchestrator, OrchestratorStatistics};
pub use response::{
    AggregatedResponse,
    CostBreakdownSummary,
    EnsembleMetadata,
    EnsembleResponse,
    FailureKind,
    PerformanceSummary,
    ProviderComparison,
    ProviderFailure,
};
