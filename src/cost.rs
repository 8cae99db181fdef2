//! Cost tracking, budgets and budget alerts
//!
//! The [`CostTracker`] keeps an append-only ledger of [`UsageRecord`]s, prices
//! calls from a per-provider table, and checks spending against optional
//! daily, monthly and total [`BudgetConfig`] limits. Crossing an alert
//! threshold raises a [`BudgetAlert`], at most once per period and threshold
//! within the alert cooldown.
//!
//! ```text
//! cost = input_tokens / 1000 × input_rate
//!      + output_tokens / 1000 × output_rate
//!      + (has_vision ? vision_rate : 0)
//! ```
//!
//! The tracker is consulted, never invoked automatically: callers use
//! [`CostTracker::would_exceed_budget`] before dispatch if they want a gate.

use crate::background::PeriodicTask;
use crate::error::{Error, Result};
use crate::types::{RequestId, TokenUsage};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Rates for one model of a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per 1k input tokens
    pub input_cost_per_1k: f64,
    /// Cost per 1k output tokens
    pub output_cost_per_1k: f64,
    /// Flat surcharge per image, falling back to the provider's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_cost: Option<f64>,
}

/// Rates for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPricing {
    /// Cost per 1k input tokens
    pub input_cost_per_1k: f64,
    /// Cost per 1k output tokens
    pub output_cost_per_1k: f64,
    /// Flat surcharge per image
    #[serde(default)]
    pub vision_cost: f64,
    /// Per-model overrides
    #[serde(default)]
    pub models: HashMap<String, ModelPricing>,
}

impl ProviderPricing {
    /// Create pricing without model overrides
    pub fn new(input_cost_per_1k: f64, output_cost_per_1k: f64, vision_cost: f64) -> Self {
        Self {
            input_cost_per_1k,
            output_cost_per_1k,
            vision_cost,
            models: HashMap::new(),
        }
    }

    /// Add a model override
    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    fn rates(&self, model: Option<&str>) -> (f64, f64, f64) {
        match model.and_then(|m| self.models.get(m)) {
            Some(m) => (
                m.input_cost_per_1k,
                m.output_cost_per_1k,
                m.vision_cost.unwrap_or(self.vision_cost),
            ),
            None => (self.input_cost_per_1k, self.output_cost_per_1k, self.vision_cost),
        }
    }
}

/// Priced components of one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Input token cost
    pub input_cost: f64,
    /// Output token cost
    pub output_cost: f64,
    /// Vision surcharge
    pub vision_cost: f64,
    /// Sum of the components
    pub total_cost: f64,
}

/// One completed provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record id
    pub id: Uuid,
    /// Completion time
    pub timestamp: DateTime<Utc>,
    /// Provider name
    pub provider: String,
    /// Model name
    pub model: String,
    /// Token counts
    pub usage: TokenUsage,
    /// Computed cost
    pub cost: f64,
    /// Whether the call succeeded
    pub success: bool,
    /// Call latency (ms)
    pub response_time_ms: u64,
    /// Ensemble request the call belonged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl UsageRecord {
    /// Create a record stamped now
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        usage: TokenUsage,
        cost: f64,
        success: bool,
        response_time_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            usage,
            cost,
            success,
            response_time_ms,
            request_id: None,
        }
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach the owning request id
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Budget limits and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Limit per UTC calendar day
    pub daily_limit: Option<f64>,
    /// Limit per UTC calendar month
    pub monthly_limit: Option<f64>,
    /// Lifetime limit
    pub total_limit: Option<f64>,
    /// Alert thresholds as percentages of a limit (e.g. 50, 75, 90)
    pub alert_thresholds: Vec<f64>,
    /// Currency label
    pub currency: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: None,
            monthly_limit: None,
            total_limit: None,
            alert_thresholds: vec![50.0, 75.0, 90.0],
            currency: "USD".to_string(),
        }
    }
}

impl BudgetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for limit in [self.daily_limit, self.monthly_limit, self.total_limit]
            .into_iter()
            .flatten()
        {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(Error::config("budget limits must be positive"));
            }
        }
        if self
            .alert_thresholds
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0)
        {
            return Err(Error::config("alert thresholds must be positive percentages"));
        }
        Ok(())
    }

    fn limit(&self, period: BudgetPeriod) -> Option<f64> {
        match period {
            BudgetPeriod::Daily => self.daily_limit,
            BudgetPeriod::Monthly => self.monthly_limit,
            BudgetPeriod::Total => self.total_limit,
        }
    }
}

/// Budget period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Current UTC day
    Daily,
    /// Current UTC month
    Monthly,
    /// Lifetime of the tracker
    Total,
}

impl BudgetPeriod {
    /// Periods in check order
    pub const ALL: [BudgetPeriod; 3] = [Self::Daily, Self::Monthly, Self::Total];
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Total => "total",
        };
        f.write_str(s)
    }
}

/// Threshold crossing notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    /// Alert id
    pub id: Uuid,
    /// Budget period crossed
    pub period: BudgetPeriod,
    /// Threshold crossed (percent)
    pub threshold_percent: f64,
    /// Usage when raised
    pub current_usage: f64,
    /// Limit of the period
    pub limit: f64,
    /// Usage as a percentage of the limit
    pub percent_used: f64,
    /// Currency label
    pub currency: String,
    /// When raised
    pub timestamp: DateTime<Utc>,
    /// Whether a caller has acknowledged it
    pub acknowledged: bool,
}

/// Usage against one budget period
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetUsage {
    /// Spent in the period
    pub used: f64,
    /// Configured limit
    pub limit: Option<f64>,
    /// Limit minus spend, floored at zero
    pub remaining: Option<f64>,
    /// Spend as a percentage of the limit
    pub percent_used: Option<f64>,
}

impl BudgetUsage {
    fn new(used: f64, limit: Option<f64>) -> Self {
        Self {
            used,
            limit,
            remaining: limit.map(|l| (l - used).max(0.0)),
            percent_used: limit.map(|l| used / l * 100.0),
        }
    }
}

/// Usage against every budget period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// Current UTC day
    pub daily: BudgetUsage,
    /// Current UTC month
    pub monthly: BudgetUsage,
    /// Lifetime
    pub total: BudgetUsage,
    /// Currency label
    pub currency: String,
}

/// Result of a budget pre-check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheck {
    /// Whether the estimated spend fits every limit
    pub allowed: bool,
    /// Which limit would be exceeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Period that failed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<BudgetPeriod>,
    /// Spend in the reported period (lifetime spend when allowed)
    pub current_usage: f64,
    /// Limit of the reported period
    pub limit: Option<f64>,
}

/// Spend rolled up by one key
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostRollup {
    /// Cost
    pub cost: f64,
    /// Tokens
    pub tokens: u64,
    /// Calls
    pub requests: u64,
}

impl CostRollup {
    fn add(&mut self, record: &UsageRecord) {
        self.cost += record.cost;
        self.tokens += record.usage.total_tokens;
        self.requests += 1;
    }
}

/// Spend over a time range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    /// Range start (inclusive)
    pub start: DateTime<Utc>,
    /// Range end (inclusive)
    pub end: DateTime<Utc>,
    /// Total cost
    pub total_cost: f64,
    /// Total tokens
    pub total_tokens: u64,
    /// Total calls
    pub total_requests: u64,
    /// Successful calls
    pub successful_requests: u64,
    /// Failed calls
    pub failed_requests: u64,
    /// Rollup per provider
    pub by_provider: BTreeMap<String, CostRollup>,
    /// Rollup per model
    pub by_model: BTreeMap<String, CostRollup>,
    /// Currency label
    pub currency: String,
}

/// Cost tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostTrackerConfig {
    /// Pricing per provider
    pub pricing: HashMap<String, ProviderPricing>,
    /// Budget limits
    pub budget: BudgetConfig,
    /// Days usage records are kept
    pub retention_days: u32,
    /// Minimum gap between alerts for the same period and threshold (ms)
    pub alert_cooldown_ms: u64,
    /// Age after which alerts are dropped (ms)
    pub alert_retention_ms: u64,
    /// Interval of the pruning task (ms)
    pub maintenance_interval_ms: u64,
}

impl Default for CostTrackerConfig {
    fn default() -> Self {
        Self {
            pricing: HashMap::new(),
            budget: BudgetConfig::default(),
            retention_days: 90,
            alert_cooldown_ms: 60 * 60 * 1_000,
            alert_retention_ms: 24 * 60 * 60 * 1_000,
            maintenance_interval_ms: 60 * 60 * 1_000,
        }
    }
}

impl CostTrackerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        if self.retention_days == 0 || self.maintenance_interval_ms == 0 {
            return Err(Error::config(
                "retention_days and maintenance_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Ledger {
    records: Vec<UsageRecord>,
    lifetime_cost: f64,
    budget: BudgetConfig,
    alerts: Vec<BudgetAlert>,
    last_alerted: HashMap<(BudgetPeriod, u64), DateTime<Utc>>,
}

impl Ledger {
    fn spent_since(&self, since: DateTime<Utc>) -> f64 {
        self.records
            .iter()
            .filter(|r| r.timestamp >= since)
            .map(|r| r.cost)
            .sum()
    }

    fn spent(&self, period: BudgetPeriod, now: DateTime<Utc>) -> f64 {
        match period {
            BudgetPeriod::Daily => self.spent_since(day_start(now)),
            BudgetPeriod::Monthly => self.spent_since(month_start(now)),
            BudgetPeriod::Total => self.lifetime_cost,
        }
    }

    fn prune(&mut self, config: &CostTrackerConfig, now: DateTime<Utc>) {
        let record_horizon = now - ChronoDuration::days(config.retention_days as i64);
        self.records.retain(|r| r.timestamp >= record_horizon);

        let alert_horizon = now - ChronoDuration::milliseconds(config.alert_retention_ms as i64);
        self.alerts.retain(|a| a.timestamp >= alert_horizon);
    }

    fn raise_alerts(&mut self, config: &CostTrackerConfig, now: DateTime<Utc>) {
        let cooldown = ChronoDuration::milliseconds(config.alert_cooldown_ms as i64);
        for period in BudgetPeriod::ALL {
            let Some(limit) = self.budget.limit(period) else {
                continue;
            };
            let used = self.spent(period, now);
            let percent_used = used / limit * 100.0;

            let thresholds = self.budget.alert_thresholds.clone();
            for threshold in thresholds {
                if percent_used < threshold {
                    continue;
                }
                let key = (period, threshold.to_bits());
                let cooling = self
                    .last_alerted
                    .get(&key)
                    .map(|at| now - *at < cooldown)
                    .unwrap_or(false);
                if cooling {
                    continue;
                }
                self.last_alerted.insert(key, now);
                tracing::warn!(
                    "Budget alert: {} spend {:.4} {} is {:.1}% of limit {:.4} (threshold {}%)",
                    period,
                    used,
                    self.budget.currency,
                    percent_used,
                    limit,
                    threshold
                );
                self.alerts.push(BudgetAlert {
                    id: Uuid::new_v4(),
                    period,
                    threshold_percent: threshold,
                    current_usage: used,
                    limit,
                    percent_used,
                    currency: self.budget.currency.clone(),
                    timestamp: now,
                    acknowledged: false,
                });
            }
        }
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Usage ledger, pricing table and budget gate
pub struct CostTracker {
    config: CostTrackerConfig,
    pricing: RwLock<HashMap<String, ProviderPricing>>,
    ledger: Arc<Mutex<Ledger>>,
    maintenance: Mutex<Option<PeriodicTask>>,
}

impl CostTracker {
    /// Create a tracker after validating its configuration
    pub fn new(config: CostTrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pricing: RwLock::new(config.pricing.clone()),
            ledger: Arc::new(Mutex::new(Ledger {
                records: Vec::new(),
                lifetime_cost: 0.0,
                budget: config.budget.clone(),
                alerts: Vec::new(),
                last_alerted: HashMap::new(),
            })),
            maintenance: Mutex::new(None),
            config,
        })
    }

    /// Configuration the tracker was created with
    pub fn config(&self) -> &CostTrackerConfig {
        &self.config
    }

    /// Register or replace a provider's pricing
    pub fn set_pricing(&self, provider: impl Into<String>, pricing: ProviderPricing) {
        self.pricing.write().insert(provider.into(), pricing);
    }

    /// Whether a provider has pricing
    pub fn has_pricing(&self, provider: &str) -> bool {
        self.pricing.read().contains_key(provider)
    }

    /// Price one call
    pub fn calculate_cost(
        &self,
        provider: &str,
        model: Option<&str>,
        usage: &TokenUsage,
        has_vision: bool,
    ) -> Result<CostBreakdown> {
        let pricing = self.pricing.read();
        let rates = pricing
            .get(provider)
            .ok_or_else(|| Error::MissingCostConfig(provider.to_string()))?;
        let (input_rate, output_rate, vision_rate) = rates.rates(model);

        let input_cost = usage.input_tokens as f64 / 1_000.0 * input_rate;
        let output_cost = usage.output_tokens as f64 / 1_000.0 * output_rate;
        let vision_cost = if has_vision { vision_rate } else { 0.0 };
        Ok(CostBreakdown {
            input_cost,
            output_cost,
            vision_cost,
            total_cost: input_cost + output_cost + vision_cost,
        })
    }

    /// Price a call before it happens, splitting the estimate evenly between
    /// input and output tokens
    pub fn estimate_cost(
        &self,
        provider: &str,
        model: Option<&str>,
        estimated_tokens: u64,
        has_vision: bool,
    ) -> Result<f64> {
        let input = estimated_tokens / 2;
        let usage = TokenUsage::new(input, estimated_tokens - input);
        Ok(self
            .calculate_cost(provider, model, &usage, has_vision)?
            .total_cost)
    }

    /// Append a record, prune expired history and raise alerts
    pub fn record_usage(&self, record: UsageRecord) {
        let now = Utc::now();
        let mut ledger = self.ledger.lock();
        ledger.prune(&self.config, now);
        ledger.lifetime_cost += record.cost;
        tracing::debug!(
            "Recorded usage for {} ({} tokens, cost {:.6})",
            record.provider,
            record.usage.total_tokens,
            record.cost
        );
        ledger.records.push(record);
        ledger.raise_alerts(&self.config, now);
    }

    /// Spend over `[start, end]`
    pub fn get_cost_summary(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CostSummary {
        let ledger = self.ledger.lock();
        let mut summary = CostSummary {
            start,
            end,
            total_cost: 0.0,
            total_tokens: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            by_provider: BTreeMap::new(),
            by_model: BTreeMap::new(),
            currency: ledger.budget.currency.clone(),
        };

        for record in ledger
            .records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
        {
            summary.total_cost += record.cost;
            summary.total_tokens += record.usage.total_tokens;
            summary.total_requests += 1;
            if record.success {
                summary.successful_requests += 1;
            } else {
                summary.failed_requests += 1;
            }
            summary
                .by_provider
                .entry(record.provider.clone())
                .or_default()
                .add(record);
            summary
                .by_model
                .entry(record.model.clone())
                .or_default()
                .add(record);
        }
        summary
    }

    /// Spend against every configured limit
    pub fn get_budget_status(&self) -> BudgetStatus {
        let now = Utc::now();
        let ledger = self.ledger.lock();
        let usage = |period| BudgetUsage::new(ledger.spent(period, now), ledger.budget.limit(period));
        BudgetStatus {
            daily: usage(BudgetPeriod::Daily),
            monthly: usage(BudgetPeriod::Monthly),
            total: usage(BudgetPeriod::Total),
            currency: ledger.budget.currency.clone(),
        }
    }

    /// Check whether spending `estimated_cost` more would exceed a limit.
    ///
    /// Limits are checked daily, then monthly, then total; the first that
    /// would be exceeded is reported.
    pub fn would_exceed_budget(&self, estimated_cost: f64) -> BudgetCheck {
        let now = Utc::now();
        let ledger = self.ledger.lock();
        for period in BudgetPeriod::ALL {
            let Some(limit) = ledger.budget.limit(period) else {
                continue;
            };
            let used = ledger.spent(period, now);
            if used + estimated_cost > limit {
                return BudgetCheck {
                    allowed: false,
                    reason: Some(format!(
                        "{} budget would be exceeded: {:.4} + {:.4} > {:.4} {}",
                        period, used, estimated_cost, limit, ledger.budget.currency
                    )),
                    period: Some(period),
                    current_usage: used,
                    limit: Some(limit),
                };
            }
        }
        BudgetCheck {
            allowed: true,
            reason: None,
            period: None,
            current_usage: ledger.lifetime_cost,
            limit: ledger.budget.total_limit,
        }
    }

    /// Records in `[start, end]`, optionally for one provider
    pub fn get_usage_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Vec<UsageRecord> {
        self.ledger
            .lock()
            .records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .filter(|r| provider.map(|p| r.provider == p).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Records in `[start, end]` as pretty-printed JSON
    pub fn export_usage_json(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<String> {
        let records = self.get_usage_history(start, end, None);
        Ok(serde_json::to_string_pretty(&records)?)
    }

    /// Replace the budget configuration; alert cooldowns restart
    pub fn set_budget_configuration(&self, budget: BudgetConfig) -> Result<()> {
        budget.validate()?;
        let mut ledger = self.ledger.lock();
        ledger.budget = budget;
        ledger.last_alerted.clear();
        Ok(())
    }

    /// Current budget configuration
    pub fn budget_configuration(&self) -> BudgetConfig {
        self.ledger.lock().budget.clone()
    }

    /// Alerts not yet acknowledged
    pub fn get_pending_alerts(&self) -> Vec<BudgetAlert> {
        self.ledger
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Acknowledge every pending alert, returning how many were pending
    pub fn acknowledge_alerts(&self) -> usize {
        let mut ledger = self.ledger.lock();
        let mut count = 0;
        for alert in ledger.alerts.iter_mut().filter(|a| !a.acknowledged) {
            alert.acknowledged = true;
            count += 1;
        }
        count
    }

    /// Start the pruning task
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since the pruning loop is a spawned task.
    pub fn start(&self) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let ledger = self.ledger.clone();
        let config = self.config.clone();
        *slot = Some(PeriodicTask::spawn(
            "cost-maintenance",
            Duration::from_millis(self.config.maintenance_interval_ms),
            move || {
                let ledger = ledger.clone();
                let config = config.clone();
                async move {
                    ledger.lock().prune(&config, Utc::now());
                }
            },
        ));
    }

    /// Stop the pruning task
    pub async fn stop(&self) {
        let task = self.maintenance.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("providers_priced", &self.pricing.read().len())
            .field("records", &self.ledger.lock().records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(budget: BudgetConfig) -> CostTracker {
        let mut config = CostTrackerConfig {
            budget,
            ..Default::default()
        };
        config.pricing.insert(
            "openai".into(),
            ProviderPricing::new(0.01, 0.03, 0.005).with_model(
                "mini",
                ModelPricing {
                    input_cost_per_1k: 0.001,
                    output_cost_per_1k: 0.002,
                    vision_cost: None,
                },
            ),
        );
        CostTracker::new(config).unwrap()
    }

    fn record(provider: &str, model: &str, cost: f64) -> UsageRecord {
        UsageRecord::new(provider, model, TokenUsage::new(100, 50), cost, true, 120)
    }

    #[test]
    fn test_calculate_cost_formula() {
        let t = tracker(BudgetConfig::default());
        let usage = TokenUsage::new(2_000, 1_000);
        let b = t.calculate_cost("openai", None, &usage, true).unwrap();
        assert!((b.input_cost - 0.02).abs() < 1e-12);
        assert!((b.output_cost - 0.03).abs() < 1e-12);
        assert!((b.vision_cost - 0.005).abs() < 1e-12);
        assert!((b.total_cost - 0.055).abs() < 1e-12);

        let b = t.calculate_cost("openai", Some("mini"), &usage, false).unwrap();
        assert!((b.total_cost - 0.004).abs() < 1e-12);
        assert_eq!(b.vision_cost, 0.0);
    }

    #[test]
    fn test_missing_pricing_is_error() {
        let t = tracker(BudgetConfig::default());
        let err = t
            .calculate_cost("nobody", None, &TokenUsage::new(1, 1), false)
            .unwrap_err();
        assert!(matches!(err, Error::MissingCostConfig(p) if p == "nobody"));
        assert!(t.estimate_cost("nobody", None, 100, false).is_err());
    }

    #[test]
    fn test_summary_partitions_total() {
        let t = tracker(BudgetConfig::default());
        let costs = [
            ("openai", "gpt", 0.5),
            ("openai", "mini", 0.25),
            ("claude", "sonnet", 0.125),
            ("claude", "sonnet", 1.0),
            ("gemini", "pro", 2.0),
        ];
        let mut expected = 0.0;
        for (p, m, c) in costs {
            t.record_usage(record(p, m, c));
            expected += c;
        }

        let start = Utc::now() - ChronoDuration::minutes(1);
        let end = Utc::now() + ChronoDuration::minutes(1);
        let summary = t.get_cost_summary(start, end);
        assert_eq!(summary.total_cost, expected);
        assert_eq!(summary.total_requests, 5);
        assert_eq!(summary.total_tokens, 750);

        let by_provider: f64 = summary.by_provider.values().map(|r| r.cost).sum();
        let by_model: f64 = summary.by_model.values().map(|r| r.cost).sum();
        assert_eq!(by_provider, expected);
        assert_eq!(by_model, expected);
        assert_eq!(summary.by_provider["claude"].requests, 2);
        assert_eq!(summary.by_model["sonnet"].cost, 1.125);
    }

    #[test]
    fn test_would_exceed_budget_reports_first_violated_limit() {
        let t = tracker(BudgetConfig {
            daily_limit: Some(10.0),
            monthly_limit: Some(5.0),
            total_limit: Some(100.0),
            ..Default::default()
        });
        t.record_usage(record("openai", "gpt", 4.0));

        let check = t.would_exceed_budget(0.5);
        assert!(check.allowed);

        // fits the daily limit, not the smaller monthly one
        let check = t.would_exceed_budget(2.0);
        assert!(!check.allowed);
        assert_eq!(check.period, Some(BudgetPeriod::Monthly));
        assert_eq!(check.limit, Some(5.0));
        assert_eq!(check.current_usage, 4.0);

        let t = tracker(BudgetConfig {
            daily_limit: Some(3.0),
            monthly_limit: Some(2.0),
            ..Default::default()
        });
        let check = t.would_exceed_budget(5.0);
        assert_eq!(check.period, Some(BudgetPeriod::Daily));
        assert!(check.reason.unwrap().contains("daily"));
    }

    #[test]
    fn test_no_limits_always_allowed() {
        let t = tracker(BudgetConfig::default());
        t.record_usage(record("openai", "gpt", 1_000.0));
        assert!(t.would_exceed_budget(1_000_000.0).allowed);
    }

    #[test]
    fn test_alerts_deduplicated_within_cooldown() {
        let t = tracker(BudgetConfig {
            daily_limit: Some(10.0),
            alert_thresholds: vec![50.0, 90.0],
            ..Default::default()
        });
        t.record_usage(record("openai", "gpt", 6.0));
        t.record_usage(record("openai", "gpt", 0.5));
        let alerts = t.get_pending_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].period, BudgetPeriod::Daily);
        assert_eq!(alerts[0].threshold_percent, 50.0);

        t.record_usage(record("openai", "gpt", 3.0));
        let alerts = t.get_pending_alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].threshold_percent, 90.0);

        assert_eq!(t.acknowledge_alerts(), 2);
        assert!(t.get_pending_alerts().is_empty());
    }

    #[test]
    fn test_old_records_pruned_on_write() {
        let t = tracker(BudgetConfig::default());
        let old = Utc::now() - ChronoDuration::days(91);
        t.record_usage(record("openai", "gpt", 1.0).with_timestamp(old));
        t.record_usage(record("openai", "gpt", 2.0));

        let all = t.get_usage_history(
            Utc::now() - ChronoDuration::days(365),
            Utc::now() + ChronoDuration::minutes(1),
            None,
        );
        assert_eq!(all.len(), 1);
        // lifetime spend survives pruning
        assert_eq!(t.get_budget_status().total.used, 3.0);
    }

    #[test]
    fn test_usage_history_filters_and_export() {
        let t = tracker(BudgetConfig::default());
        t.record_usage(record("openai", "gpt", 1.0));
        t.record_usage(record("claude", "sonnet", 2.0));
        let start = Utc::now() - ChronoDuration::minutes(1);
        let end = Utc::now() + ChronoDuration::minutes(1);

        let claude = t.get_usage_history(start, end, Some("claude"));
        assert_eq!(claude.len(), 1);
        assert_eq!(claude[0].model, "sonnet");

        let json = t.export_usage_json(start, end).unwrap();
        let parsed: Vec<UsageRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_budget_status_percentages() {
        let t = tracker(BudgetConfig {
            daily_limit: Some(8.0),
            ..Default::default()
        });
        t.record_usage(record("openai", "gpt", 2.0));
        let status = t.get_budget_status();
        assert_eq!(status.daily.used, 2.0);
        assert_eq!(status.daily.remaining, Some(6.0));
        assert_eq!(status.daily.percent_used, Some(25.0));
        assert_eq!(status.monthly.limit, None);
        assert_eq!(status.currency, "USD");
    }

    #[test]
    fn test_invalid_budget_rejected() {
        let t = tracker(BudgetConfig::default());
        let bad = BudgetConfig {
            daily_limit: Some(-1.0),
            ..Default::default()
        };
        assert!(t.set_budget_configuration(bad).is_err());
    }

    #[test]
    #[should_panic]
    fn test_start_outside_runtime_panics() {
        tracker(BudgetConfig::default()).start();
    }

    fn alert_at(timestamp: DateTime<Utc>) -> BudgetAlert {
        BudgetAlert {
            id: Uuid::new_v4(),
            period: BudgetPeriod::Daily,
            threshold_percent: 50.0,
            current_usage: 5.0,
            limit: 10.0,
            percent_used: 50.0,
            currency: "USD".into(),
            timestamp,
            acknowledged: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_prunes_expired_records_and_alerts() {
        let t = CostTracker::new(CostTrackerConfig {
            maintenance_interval_ms: 1_000,
            ..Default::default()
        })
        .unwrap();
        let now = Utc::now();
        t.record_usage(record("openai", "gpt", 2.0));
        {
            let mut ledger = t.ledger.lock();
            ledger
                .records
                .push(record("openai", "gpt", 1.0).with_timestamp(now - ChronoDuration::days(91)));
            ledger.alerts.push(alert_at(now - ChronoDuration::hours(25)));
            ledger.alerts.push(alert_at(now - ChronoDuration::hours(1)));
        }
        let history = |t: &CostTracker| {
            t.get_usage_history(
                now - ChronoDuration::days(365),
                Utc::now() + ChronoDuration::minutes(1),
                None,
            )
            .len()
        };
        assert_eq!(history(&t), 2);
        assert_eq!(t.get_pending_alerts().len(), 2);

        t.start();
        t.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(history(&t), 1);
        let alerts = t.get_pending_alerts();
        assert_eq!(alerts.len(), 1);
        assert!(now - alerts[0].timestamp < ChronoDuration::hours(24));

        // later ticks keep pruning
        t.ledger
            .lock()
            .records
            .push(record("openai", "gpt", 4.0).with_timestamp(now - ChronoDuration::days(120)));
        assert_eq!(history(&t), 2);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(history(&t), 1);
        assert_eq!(t.get_budget_status().total.used, 2.0);

        t.stop().await;
        t.stop().await;
        t.ledger
            .lock()
            .records
            .push(record("openai", "gpt", 4.0).with_timestamp(now - ChronoDuration::days(120)));
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(history(&t), 2);
    }
}
