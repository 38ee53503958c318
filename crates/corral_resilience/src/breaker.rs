//! Circuit breaker state machine.
//!
//! Three states: `closed` passes calls through, `open` rejects everything
//! until `reset_timeout` elapses, `half_open` admits a bounded number of
//! probes. Outcomes feed a sliding window of the last `window_size` calls;
//! the window survives state transitions.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use corral_protocol::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Time source, injectable so tests can advance time without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests are rejected
    Open,
    /// A bounded number of probe requests are admitted
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// Breaker thresholds and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Window failure rate that trips the circuit
    pub failure_rate_threshold: f64,
    /// How long the circuit stays open before probing
    pub reset_timeout: Duration,
    /// Probe budget while half-open
    pub half_open_max_calls: u32,
    /// Sliding window length
    pub window_size: usize,
    /// Minimum window occupancy before the circuit may trip
    pub min_calls_in_window: usize,
    /// Consecutive successes that close a half-open circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            window_size: 10,
            min_calls_in_window: 5,
            success_threshold: 3,
        }
    }
}

/// Request counters for one breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<DateTime<Utc>>,
}

impl CircuitStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }
}

/// Point-in-time breaker snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub stats: CircuitStats,
    pub window_len: usize,
    pub window_failure_rate: f64,
}

struct Inner {
    state: CircuitState,
    stats: CircuitStats,
    window: VecDeque<bool>,
    half_open_calls: u32,
    last_state_change: Instant,
}

/// A three-state admission guard for one external dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                stats: CircuitStats::default(),
                window: VecDeque::new(),
                half_open_calls: 0,
                last_state_change: now,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open→half_open timer transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.check_transition(&mut inner);
        inner.state
    }

    /// Whether a request would currently be admitted.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.check_transition(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_calls < self.config.half_open_max_calls,
        }
    }

    /// Admission check that surfaces `CircuitOpen` and counts the rejection.
    pub fn check(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.check_transition(&mut inner);

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_calls < self.config.half_open_max_calls,
        };

        if admitted {
            return Ok(());
        }

        inner.stats.rejected_requests += 1;
        let elapsed = self.clock.now().duration_since(inner.last_state_change);
        let remaining = self.config.reset_timeout.saturating_sub(elapsed);
        Err(CoreError::CircuitOpen {
            service: self.name.clone(),
            reset_in_seconds: remaining.as_secs(),
        })
    }

    /// Record a successful outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.total_requests += 1;
        inner.stats.successful_requests += 1;
        inner.stats.consecutive_successes += 1;
        inner.stats.consecutive_failures = 0;
        inner.stats.last_success_time = Some(Utc::now());
        self.push_window(&mut inner, true);

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_calls += 1;
            if inner.stats.consecutive_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    /// Record a failed outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.total_requests += 1;
        inner.stats.failed_requests += 1;
        inner.stats.consecutive_failures += 1;
        inner.stats.consecutive_successes = 0;
        inner.stats.last_failure_time = Some(Utc::now());
        self.push_window(&mut inner, false);

        match inner.state {
            // Any failure while probing reopens the circuit
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed if self.should_open(&inner) => {
                warn!(
                    circuit = %self.name,
                    consecutive_failures = inner.stats.consecutive_failures,
                    "circuit tripping open"
                );
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Run an operation under the breaker, recording its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.check()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Manual reset to closed with cleared stats.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.stats = CircuitStats::default();
        inner.window.clear();
        inner.half_open_calls = 0;
        inner.last_state_change = self.clock.now();
        info!(circuit = %self.name, "circuit manually reset");
    }

    /// Snapshot for dashboards.
    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.inner.lock().unwrap();
        self.check_transition(&mut inner);
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            stats: inner.stats.clone(),
            window_len: inner.window.len(),
            window_failure_rate: window_failure_rate(&inner.window),
        }
    }

    fn push_window(&self, inner: &mut Inner, outcome: bool) {
        if inner.window.len() == self.config.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(outcome);
    }

    fn should_open(&self, inner: &Inner) -> bool {
        if inner.window.len() < self.config.min_calls_in_window {
            return false;
        }
        if inner.stats.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        window_failure_rate(&inner.window) >= self.config.failure_rate_threshold
    }

    fn check_transition(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            let elapsed = self.clock.now().duration_since(inner.last_state_change);
            if elapsed >= self.config.reset_timeout {
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;
        inner.last_state_change = self.clock.now();

        if new_state == CircuitState::HalfOpen {
            inner.half_open_calls = 0;
            inner.stats.consecutive_successes = 0;
        }

        info!(circuit = %self.name, from = %old_state, to = %new_state, "circuit state change");
    }
}

fn window_failure_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window.iter().filter(|ok| !**ok).count();
    failures as f64 / window.len() as f64
}

/// Named breakers, one per external dependency, handed out idempotently.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> &'static BreakerRegistry {
        static REGISTRY: OnceLock<BreakerRegistry> = OnceLock::new();
        REGISTRY.get_or_init(BreakerRegistry::new)
    }

    /// Get the breaker named `name`, creating it with `config` on first use.
    /// The config of an existing breaker is left untouched.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Snapshot every registered breaker.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.lock().unwrap();
        breakers.values().map(|b| b.status()).collect()
    }
}
