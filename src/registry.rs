//! Provider registry
//!
//! One [`ProviderEntry`] per provider name, owned by the orchestrator and
//! shared by handle with the collaborators that need per-provider lookup.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::rate_limiter::RateLimiter;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Registration options
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Lower value is preferred when ordering otherwise equal providers
    pub priority: u32,
    /// Relative selection bias for weighted strategies
    pub weight: f64,
    /// Whether the provider takes traffic
    pub enabled: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            priority: 100,
            weight: 1.0,
            enabled: true,
        }
    }
}

impl ProviderOptions {
    /// Set priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A registered provider and its per-provider guards
pub struct ProviderEntry {
    name: String,
    provider: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
    priority: u32,
    weight: f64,
    enabled: AtomicBool,
}

impl ProviderEntry {
    /// Provider name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote capability
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Circuit breaker guarding the provider
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Rate limiter gating the provider, if any
    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Priority
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Weight
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether the provider takes traffic
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enabled and circuit not open
    pub fn is_healthy(&self) -> bool {
        self.is_enabled() && !self.breaker.is_open()
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("enabled", &self.is_enabled())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

/// Concurrent map of registered providers
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: DashMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    ///
    /// Fails if a provider with the same name is already registered.
    pub fn register(
        &self,
        provider: Arc<dyn Provider>,
        breaker: Arc<CircuitBreaker>,
        limiter: Option<Arc<RateLimiter>>,
        options: ProviderOptions,
    ) -> Result<Arc<ProviderEntry>> {
        let name = provider.name().to_string();
        if !options.weight.is_finite() || options.weight < 0.0 {
            return Err(Error::provider(&name, "weight must be a non-negative number"));
        }

        let entry = Arc::new(ProviderEntry {
            name: name.clone(),
            provider,
            breaker,
            limiter,
            priority: options.priority,
            weight: options.weight,
            enabled: AtomicBool::new(options.enabled),
        });

        match self.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::provider(name, "already registered"))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    /// Remove a provider, returning its entry
    pub fn unregister(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.remove(name).map(|(_, entry)| entry)
    }

    /// Look up a provider
    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Look up a provider, failing with a provider error if absent
    pub fn require(&self, name: &str) -> Result<Arc<ProviderEntry>> {
        self.get(name)
            .ok_or_else(|| Error::provider(name, "not registered"))
    }

    /// Enable or disable a provider
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let entry = self.require(name)?;
        entry.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// All entries sorted by priority, then name
    pub fn all(&self) -> Vec<Arc<ProviderEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        entries
    }

    /// Enabled entries
    pub fn enabled(&self) -> Vec<Arc<ProviderEntry>> {
        self.all().into_iter().filter(|e| e.is_enabled()).collect()
    }

    /// Enabled entries whose circuit is not open
    pub fn healthy(&self) -> Vec<Arc<ProviderEntry>> {
        self.all().into_iter().filter(|e| e.is_healthy()).collect()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
