//! Per-endpoint circuit breakers with lock-free state transitions.
//!
//! Admission consults [`CircuitBreaker::is_open`] before evaluating limits and reports
//! outcomes back through `record_success` / `record_failure`. A closed breaker opens when the
//! failure rate over a rolling window crosses a threshold, once the window holds enough calls.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::ConfigError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Buckets the rolling window is split into.
const WINDOW_SLOTS: usize = 10;

/// Narrow breaker contract used by the admission controller.
pub trait CircuitBreaker: Send + Sync + Debug {
    /// Whether calls to `endpoint` should be short-circuited right now.
    fn is_open(&self, endpoint: &str) -> bool;
    /// Report a successful call.
    fn record_success(&self, endpoint: &str);
    /// Report a failed call.
    fn record_failure(&self, endpoint: &str);
    /// Time until an open breaker admits a probe; zero when closed.
    fn recovery_time(&self, endpoint: &str) -> Duration;
}

/// Current state of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the recovery timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    epoch: u64,
    calls: u32,
    failures: u32,
}

/// Call and failure counts over the last `WINDOW_SLOTS` slots.
#[derive(Debug, Default)]
struct RollingOutcomes {
    slots: [Slot; WINDOW_SLOTS],
}

impl RollingOutcomes {
    /// Record one call and return the window totals as `(calls, failures)`.
    fn record(&mut self, now_ms: u64, window_ms: u64, failed: bool) -> (u32, u32) {
        let slot_ms = (window_ms / WINDOW_SLOTS as u64).max(1);
        let epoch = now_ms / slot_ms;
        let slot = &mut self.slots[(epoch % WINDOW_SLOTS as u64) as usize];
        if slot.epoch != epoch {
            *slot = Slot { epoch, calls: 0, failures: 0 };
        }
        slot.calls = slot.calls.saturating_add(1);
        if failed {
            slot.failures = slot.failures.saturating_add(1);
        }
        self.slots
            .iter()
            .filter(|s| s.epoch <= epoch && epoch - s.epoch < WINDOW_SLOTS as u64)
            .fold((0u32, 0u32), |(c, f), s| (c.saturating_add(s.calls), f.saturating_add(s.failures)))
    }

    fn clear(&mut self) {
        self.slots = [Slot::default(); WINDOW_SLOTS];
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: AtomicU8,
    outcomes: Mutex<RollingOutcomes>,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicU32,
}

impl BreakerState {
    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn record(&self, now_ms: u64, window_ms: u64, failed: bool) -> (u32, u32) {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).record(now_ms, window_ms, failed)
    }

    fn clear_outcomes(&self) {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.clear_outcomes();
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }
}

/// Independent Closed/Open/HalfOpen breakers keyed by endpoint.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct EndpointCircuitBreakers {
    breakers: Arc<RwLock<HashMap<String, Arc<BreakerState>>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl EndpointCircuitBreakers {
    /// Validate `config` and build an empty set of breakers.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { breakers: Arc::default(), config, clock })
    }

    /// State of every breaker seen so far, sorted by endpoint.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = map.iter().map(|(k, s)| (k.clone(), s.current())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Close the breaker for `endpoint`. Returns whether one existed.
    pub fn reset(&self, endpoint: &str) -> bool {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        match map.get(endpoint) {
            Some(state) => {
                state.reset();
                info!(target: "tollgate::circuit_breaker", endpoint, "circuit breaker reset");
                true
            }
            None => false,
        }
    }

    /// State of one breaker.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .map_or(CircuitState::Closed, |s| s.current())
    }

    fn get(&self, endpoint: &str) -> Option<Arc<BreakerState>> {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).get(endpoint).cloned()
    }

    fn get_or_create(&self, endpoint: &str) -> Arc<BreakerState> {
        if let Some(state) = self.get(endpoint) {
            return state;
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(endpoint.to_string()).or_default().clone()
    }

    fn elapsed_since_open(&self, state: &BreakerState) -> u64 {
        self.clock.now_millis().saturating_sub(state.opened_at_millis.load(Ordering::Acquire))
    }

    fn recovery_millis(&self) -> u64 {
        self.config.recovery_timeout_ms
    }

    fn trips(&self, calls: u32, failures: u32) -> bool {
        calls >= self.config.minimum_requests
            && f64::from(failures) >= self.config.failure_rate_threshold * f64::from(calls)
    }

    fn trip(&self, state: &BreakerState, endpoint: &str, from: u8, calls: u32, failures: u32) {
        if state.transition(from, STATE_OPEN) {
            state.half_open_calls.store(0, Ordering::Release);
            state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            state.clear_outcomes();
            if from == STATE_HALF_OPEN {
                warn!(target: "tollgate::circuit_breaker", endpoint, "circuit breaker probe failed → open");
            } else {
                error!(
                    target: "tollgate::circuit_breaker",
                    endpoint,
                    calls,
                    failures,
                    threshold = self.config.failure_rate_threshold,
                    "circuit breaker → open"
                );
            }
        }
    }
}

impl CircuitBreaker for EndpointCircuitBreakers {
    fn is_open(&self, endpoint: &str) -> bool {
        let Some(state) = self.get(endpoint) else {
            return false;
        };
        loop {
            match state.current() {
                CircuitState::Closed => return false,
                CircuitState::Open => {
                    if self.elapsed_since_open(&state) < self.recovery_millis() {
                        return true;
                    }
                    if state.transition(STATE_OPEN, STATE_HALF_OPEN) {
                        info!(target: "tollgate::circuit_breaker", endpoint, "circuit breaker → half-open");
                    }
                    // Either way the next pass claims a probe slot in the new state.
                }
                CircuitState::HalfOpen => {
                    let in_flight = state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if in_flight >= self.config.half_open_max_calls {
                        state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return true;
                    }
                    debug!(
                        target: "tollgate::circuit_breaker",
                        endpoint,
                        in_flight = in_flight + 1,
                        max = self.config.half_open_max_calls,
                        "circuit breaker half-open probe"
                    );
                    return false;
                }
            }
        }
    }

    fn record_success(&self, endpoint: &str) {
        let state = self.get_or_create(endpoint);
        match state.current() {
            CircuitState::HalfOpen => {
                if state.transition(STATE_HALF_OPEN, STATE_CLOSED) {
                    state.half_open_calls.store(0, Ordering::Release);
                    state.clear_outcomes();
                    state.opened_at_millis.store(0, Ordering::Release);
                    info!(target: "tollgate::circuit_breaker", endpoint, "circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                state.record(self.clock.now_millis(), self.config.window_ms, false);
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, endpoint: &str) {
        let state = self.get_or_create(endpoint);
        match state.current() {
            CircuitState::HalfOpen => self.trip(&state, endpoint, STATE_HALF_OPEN, 1, 1),
            CircuitState::Closed => {
                let (calls, failures) = state.record(self.clock.now_millis(), self.config.window_ms, true);
                if self.trips(calls, failures) {
                    self.trip(&state, endpoint, STATE_CLOSED, calls, failures);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn recovery_time(&self, endpoint: &str) -> Duration {
        match self.get(endpoint) {
            Some(state) if state.current() == CircuitState::Open => Duration::from_millis(
                self.recovery_millis().saturating_sub(self.elapsed_since_open(&state)),
            ),
            _ => Duration::ZERO,
        }
    }
}

/// Breaker that never opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCircuitBreaker;

impl CircuitBreaker for NoopCircuitBreaker {
    fn is_open(&self, _endpoint: &str) -> bool {
        false
    }
    fn record_success(&self, _endpoint: &str) {}
    fn record_failure(&self, _endpoint: &str) {}
    fn recovery_time(&self, _endpoint: &str) -> Duration {
        Duration::ZERO
    }
}
