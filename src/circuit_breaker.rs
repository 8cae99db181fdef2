//! Per-provider circuit breaker.
//!
//! The breaker counts consecutive failures for one provider. When the count
//! reaches the configured threshold the circuit *opens* and calls are
//! short-circuited. After the cool-down elapses the circuit enters
//! *half-open* state and lets a fixed number of trial calls through; one
//! trial success closes it again, one trial failure re-opens it. A trial
//! that never reports back is returned with [`CircuitBreaker::release_trial`];
//! failing that, its slot is re-armed once the cool-down has passed again.
//!
//! ```text
//! CLOSED ──[threshold failures]──► OPEN ──[cool-down]──► HALF_OPEN
//!    ▲                              ▲                        │
//!    └────────[trial success]───────┼────────────────────────┤
//!                                   └────[trial failure]─────┘
//! ```
//!
//! The breaker performs no I/O and never returns errors; callers decide what
//! to do with [`CircuitBreaker::allow_request`] / [`CircuitBreaker::is_open`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing trials (ms)
    pub open_duration_ms: u64,
    /// Trial calls allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Opens quickly and stays open longer
    pub fn strict() -> Self {
        Self {
            failure_threshold: 2,
            open_duration_ms: 120_000,
            half_open_max_calls: 1,
        }
    }

    /// Tolerates more failures and probes sooner
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            open_duration_ms: 15_000,
            half_open_max_calls: 3,
        }
    }

    /// Open duration as a `Duration`
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.failure_threshold == 0 || self.half_open_max_calls == 0 {
            return Err(crate::error::Error::config(
                "failure_threshold and half_open_max_calls must be positive",
            ));
        }
        if self.open_duration_ms == 0 {
            return Err(crate::error::Error::config("open_duration_ms must be positive"));
        }
        Ok(())
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are short-circuited
    Open,
    /// A limited number of trial requests are allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Serializable point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Provider the breaker guards
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures in the current closed period
    pub consecutive_failures: u32,
    /// Lifetime successes recorded
    pub total_successes: u64,
    /// Lifetime failures recorded
    pub total_failures: u64,
    /// Milliseconds since the circuit last opened
    pub opened_for_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
    last_trial_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
}

/// Failure-isolation state machine for one provider
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker for the named provider
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_calls: 0,
                last_trial_at: None,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    /// Create a breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Provider name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the OPEN → HALF_OPEN timer transition
    pub fn state(&self) -> CircuitState {
        let mut s = self.state.lock();
        self.refresh(&mut s);
        s.state
    }

    /// Whether a call would be rejected right now.
    ///
    /// True while OPEN, and while HALF_OPEN once every trial slot is taken.
    pub fn is_open(&self) -> bool {
        let mut s = self.state.lock();
        self.refresh(&mut s);
        match s.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => s.half_open_calls >= self.config.half_open_max_calls,
        }
    }

    /// Gate a call through the breaker, consuming a trial slot when half-open
    pub fn allow_request(&self) -> bool {
        let mut s = self.state.lock();
        self.refresh(&mut s);
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if s.half_open_calls < self.config.half_open_max_calls {
                    s.half_open_calls += 1;
                    s.last_trial_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Hand back a half-open trial slot whose call ended without an outcome
    pub fn release_trial(&self) {
        let mut s = self.state.lock();
        if s.state == CircuitState::HalfOpen && s.half_open_calls > 0 {
            s.half_open_calls -= 1;
            tracing::debug!("Circuit breaker for {} released an unfinished trial", self.name);
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut s = self.state.lock();
        self.refresh(&mut s);
        s.total_successes += 1;
        s.consecutive_failures = 0;

        if s.state == CircuitState::HalfOpen {
            s.state = CircuitState::Closed;
            s.opened_at = None;
            s.half_open_calls = 0;
            s.last_trial_at = None;
            tracing::info!("Circuit breaker for {} closed after successful trial", self.name);
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut s = self.state.lock();
        self.refresh(&mut s);
        s.total_failures += 1;

        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut s);
                }
            }
            CircuitState::HalfOpen => self.trip(&mut s),
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to CLOSED and clear counters
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
        s.half_open_calls = 0;
        s.last_trial_at = None;
    }

    /// Point-in-time view for metadata and statistics
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut s = self.state.lock();
        self.refresh(&mut s);
        CircuitSnapshot {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            total_successes: s.total_successes,
            total_failures: s.total_failures,
            opened_for_ms: s.opened_at.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    fn trip(&self, s: &mut BreakerState) {
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.half_open_calls = 0;
        s.last_trial_at = None;
        tracing::warn!(
            "Circuit breaker for {} opened after {} consecutive failures",
            self.name,
            s.consecutive_failures
        );
    }

    fn refresh(&self, s: &mut BreakerState) {
        if s.state == CircuitState::HalfOpen {
            // trials that never reported back stop holding their slots
            let stale = s
                .last_trial_at
                .map(|t| t.elapsed() >= self.config.open_duration())
                .unwrap_or(false);
            if stale && s.half_open_calls >= self.config.half_open_max_calls {
                s.half_open_calls = 0;
                s.last_trial_at = None;
                tracing::debug!("Circuit breaker for {} re-armed stale trials", self.name);
            }
            return;
        }
        if s.state != CircuitState::Open {
            return;
        }
        let expired = s
            .opened_at
            .map(|t| t.elapsed() >= self.config.open_duration())
            .unwrap_or(true);
        if expired {
            s.state = CircuitState::HalfOpen;
            s.half_open_calls = 0;
            tracing::debug!("Circuit breaker for {} half-open", self.name);
        }
    }
}
