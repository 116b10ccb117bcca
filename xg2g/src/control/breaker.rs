//! Circuit breaker for unreliable call-sites.
//!
//! One [`CircuitBreaker`] exists per named call-site and is shared by all of
//! its callers through the [`BreakerRegistry`]. State bookkeeping happens
//! under a single mutex that is never held across the protected call.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the open duration elapses.
    Open,
    /// A limited number of trial calls are let through.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub trial_successes: u32,
    /// Cooldown before a trial call is allowed.
    pub open_duration: Duration,
    /// Trial calls allowed in flight while half-open.
    pub half_open_max_requests: u32,
    /// Turn a panicking call into an ordinary failure.
    pub recover_panics: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            trial_successes: 2,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 1,
            recover_panics: true,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    changed_at: Instant,
    /// Bumped on every transition so late results from an earlier state are ignored.
    generation: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.changed_at = now;
        self.generation = self.generation.wrapping_add(1);
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub since_transition_ms: u64,
    pub rejected_total: u64,
}

/// Circuit breaker protecting one call-site.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    rejected: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Admission into the protected call. Dropping it without an outcome frees
/// the half-open slot without counting a result.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.on_result(self.generation, Some(success));
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_result(self.generation, None);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                changed_at: Instant::now(),
                generation: 0,
            }),
            rejected: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, as a caller arriving now would observe it.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open
            && inner.changed_at.elapsed() >= self.config.open_duration
        {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            since_transition_ms: inner.changed_at.elapsed().as_millis() as u64,
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Run `f` under the breaker.
    ///
    /// Rejected calls fail with [`Error::CircuitOpen`] without running `f`.
    /// [`Error::Cancelled`] results are not counted as failures.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;

        let result = if self.config.recover_panics {
            // `lazy` moves the call itself inside the unwind boundary.
            let call = future::lazy(|_| f()).flatten();
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let msg = crate::panic_hook::payload_message(payload.as_ref());
                    warn!(breaker = %self.name, panic = %msg, "Protected call panicked");
                    Err(Error::Other(format!(
                        "panic in call protected by '{}': {msg}",
                        self.name
                    )))
                }
            }
        } else {
            f().await
        };

        match &result {
            Ok(_) => permit.settle(true),
            Err(Error::Cancelled) => drop(permit),
            Err(_) => permit.settle(false),
        }
        result
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed, Instant::now());
        debug!(breaker = %self.name, "Circuit breaker reset to closed state");
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state == CircuitState::Open
            && now.duration_since(inner.changed_at) >= self.config.open_duration
        {
            inner.transition(CircuitState::HalfOpen, now);
            info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");
        }

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests.max(1) {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !admitted {
            drop(inner);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_breaker_rejection(&self.name);
            }
            debug!(breaker = %self.name, "Call rejected by open circuit");
            return Err(Error::CircuitOpen {
                name: self.name.clone(),
            });
        }

        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn on_result(&self, generation: u64, outcome: Option<bool>) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        let Some(success) = outcome else {
            return;
        };
        let now = Instant::now();

        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.transition(CircuitState::Open, now);
                    warn!(
                        breaker = %self.name,
                        failures,
                        "Circuit breaker opened after consecutive failures"
                    );
                    self.note_transition(CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.trial_successes {
                    inner.transition(CircuitState::Closed, now);
                    info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                    self.note_transition(CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, false) => {
                inner.transition(CircuitState::Open, now);
                warn!(breaker = %self.name, "Circuit breaker reopened by failed trial call");
                self.note_transition(CircuitState::Open);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn note_transition(&self, to: CircuitState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(&self.name, to);
        }
    }
}

/// Get-or-create registry of breakers keyed by call-site name.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            overrides: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use `config` instead of the defaults for breakers named `name`.
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                let breaker = CircuitBreaker::new(name, config);
                let breaker = match &self.metrics {
                    Some(metrics) => breaker.with_metrics(metrics.clone()),
                    None => breaker,
                };
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
