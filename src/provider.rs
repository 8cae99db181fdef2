//! Uniform capability interface for remote inference providers

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Per-call options forwarded to providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Requested time budget for each provider call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Maximum completion tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Token estimate reserved against rate-limit token ceilings at admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
    /// Cap on how many providers to dispatch to (all healthy when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_providers: Option<usize>,
    /// Providers that must not be used for this request
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Providers that must be used for this request when healthy
    #[serde(default)]
    pub require: Vec<String>,
    /// Skip providers whose average cost exceeds this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Skip providers whose average latency exceeds this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_time_ms: Option<u64>,
    /// Whether the payload carries an image (vision surcharge)
    #[serde(default = "default_has_vision")]
    pub has_vision: bool,
    /// Free-form provider-specific options
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_has_vision() -> bool {
    true
}

impl AnalysisOptions {
    /// Create default options
    pub fn new() -> Self {
        Self {
            has_vision: true,
            ..Default::default()
        }
    }

    /// Set the per-provider timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the token estimate used for admission control
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    /// Limit the number of providers dispatched to
    pub fn with_max_providers(mut self, count: usize) -> Self {
        self.max_providers = Some(count);
        self
    }

    /// Exclude a provider
    pub fn exclude(mut self, provider: impl Into<String>) -> Self {
        self.exclude.push(provider.into());
        self
    }

    /// Require a provider
    pub fn require(mut self, provider: impl Into<String>) -> Self {
        self.require.push(provider.into());
        self
    }

    /// Requested timeout as a duration
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Response returned by a single provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider that produced the response
    pub provider: String,
    /// Model that served the call, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Analysis content (free text or structured JSON)
    pub content: serde_json::Value,
    /// Provider-reported confidence in [0, 1]
    pub confidence: f64,
    /// Tokens consumed by the call
    pub tokens_used: u64,
    /// Input/output split, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<crate::types::TokenUsage>,
    /// Latency reported by the provider
    pub response_time_ms: u64,
}

impl ProviderResponse {
    /// Create a response with text content
    pub fn text(provider: impl Into<String>, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            content: serde_json::Value::String(content.into()),
            confidence,
            tokens_used: 0,
            token_usage: None,
            response_time_ms: 0,
        }
    }

    /// Create a response with structured content
    pub fn json(provider: impl Into<String>, content: serde_json::Value, confidence: f64) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            content,
            confidence,
            tokens_used: 0,
            token_usage: None,
            response_time_ms: 0,
        }
    }

    /// Set tokens used
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Token split, falling back to attributing the total to output
    pub fn usage(&self) -> crate::types::TokenUsage {
        self.token_usage
            .unwrap_or_else(|| crate::types::TokenUsage::from_total(self.tokens_used))
    }
}

/// Provider-side rate limit snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// Requests allowed per minute
    pub requests_per_minute: u32,
    /// Requests left in the current minute
    pub requests_remaining: u32,
}

impl RateLimitInfo {
    /// Fraction of the minute budget still available, in [0, 1]
    pub fn headroom(&self) -> f64 {
        if self.requests_per_minute == 0 {
            return 0.0;
        }
        (self.requests_remaining as f64 / self.requests_per_minute as f64).clamp(0.0, 1.0)
    }
}

/// Capability every inference backend exposes to the ensemble
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name, used as the registry key
    fn name(&self) -> &str;

    /// Provider version string
    fn version(&self) -> &str;

    /// Analyze an image with a prompt
    async fn analyze(
        &self,
        image: Bytes,
        prompt: &str,
        options: &AnalysisOptions,
    ) -> Result<ProviderResponse>;

    /// Cheap liveness probe
    async fn health_check(&self) -> bool;

    /// Estimated cost for the given number of tokens
    fn cost(&self, tokens_used: u64) -> f64;

    /// Current provider-side rate limit snapshot
    fn rate_limit(&self) -> RateLimitInfo;
}
