use chrono::{DateTime, Utc};
use failsafe::backoff;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-source failure isolation for upstream intelligence calls.
///
/// # States
///
/// - **CLOSED**: Normal operation, calls pass through. Consecutive failures are
///   counted and any success resets the count.
/// - **OPEN**: The failure threshold was reached. Calls are rejected without
///   touching the source until the recovery period has elapsed.
/// - **HALF_OPEN**: The first call after the recovery period runs as a single
///   trial. Concurrent callers are rejected until it settles.
///
/// A guarded future that is dropped before it completes (for example when the
/// batch deadline fires) is recorded as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// How long the breaker stays Open each time it trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryBackoff {
    /// Same recovery period after every trip.
    Constant(Duration),
    /// Doubles on every consecutive re-open, capped at `max`. Resets on close.
    Exponential { start: Duration, max: Duration },
}

impl RecoveryBackoff {
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match *self {
            RecoveryBackoff::Constant(delay) => Box::new(backoff::constant(delay)),
            RecoveryBackoff::Exponential { start, max } => {
                Box::new(backoff::exponential(start, max))
            }
        }
    }

    fn initial(&self) -> Duration {
        match *self {
            RecoveryBackoff::Constant(delay) => delay,
            RecoveryBackoff::Exponential { start, .. } => start,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    pub backoff: RecoveryBackoff,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            backoff: RecoveryBackoff::Constant(Duration::from_secs(30)),
        }
    }
}

/// Outcome of a guarded call that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker is open (or a half-open trial is in flight); the call was
    /// never made.
    Rejected,
    /// The call was made and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Rejected => write!(f, "circuit open, call rejected"),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

/// Read-only snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_for: Duration,
    trial_in_flight: bool,
    /// Bumped on every open and close so an outcome can be matched to the
    /// trial it belongs to.
    generation: u64,
    schedule: Box<dyn Iterator<Item = Duration> + Send>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at_utc: Option<DateTime<Utc>>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let inner = Inner {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            open_for: config.backoff.initial(),
            trial_in_flight: false,
            generation: 0,
            schedule: config.backoff.schedule(),
            last_failure_at: None,
            opened_at_utc: None,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
        };

        Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            opened_at: inner.opened_at_utc,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Runs `f` if the breaker admits the call and records its outcome.
    ///
    /// `f` is not invoked at all when the call is rejected.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = match self.try_acquire() {
            Admission::Rejected => return Err(BreakerError::Rejected),
            Admission::Regular => None,
            Admission::Trial(generation) => Some(generation),
        };

        let mut guard = CallGuard {
            breaker: self,
            trial,
            settled: false,
        };
        let result = f().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.on_success(trial);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(trial);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock();

        let admission = match inner.state {
            BreakerState::Closed => Admission::Regular,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= inner.open_for)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                    Admission::Trial(inner.generation)
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial(inner.generation)
                }
            }
        };

        if admission == Admission::Rejected {
            inner.rejected_calls += 1;
            tracing::debug!(breaker = %self.name, state = %inner.state, "Call rejected");
        } else {
            inner.total_calls += 1;
        }
        admission
    }

    /// True when `trial` is the outcome of the trial the breaker is waiting on.
    fn is_current_trial(inner: &Inner, trial: Option<u64>) -> bool {
        inner.state == BreakerState::HalfOpen && trial == Some(inner.generation)
    }

    fn on_success(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;

        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen if Self::is_current_trial(&inner, trial) => {
                self.close(&mut inner);
                tracing::info!(breaker = %self.name, "Trial call succeeded, circuit closed");
            }
            // Calls admitted before the trip that finish late neither shorten
            // the Open period nor settle the trial.
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn on_failure(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen if Self::is_current_trial(&inner, trial) => {
                inner.consecutive_failures += 1;
                self.open(&mut inner);
            }
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.trial_in_flight = false;
        inner.generation += 1;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_utc = Some(Utc::now());
        inner.open_for = inner.schedule.next().unwrap_or(inner.open_for);
        tracing::warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            open_for = ?inner.open_for,
            "Circuit opened"
        );
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.generation += 1;
        inner.opened_at = None;
        inner.opened_at_utc = None;
        inner.schedule = self.config.backoff.schedule();
        inner.open_for = self.config.backoff.initial();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Rejected,
    Regular,
    /// The single HalfOpen trial, tagged with the generation it was admitted in.
    Trial(u64),
}

struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(breaker = %self.breaker.name, "Guarded call abandoned before completion");
            self.breaker.on_failure(self.trial);
        }
    }
}

/// One breaker per upstream source, created lazily with a shared config.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }

        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Metrics for every known breaker, sorted by source name.
    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let mut metrics: Vec<BreakerMetrics> =
            self.breakers.read().values().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
