//! Per-dependency circuit breaker
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──> Open
//!   Open ──(reset_timeout elapsed, next call)──> HalfOpen
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open (cooldown restarts)
//! ```
//!
//! While half-open exactly one probe call is in flight; every other caller is
//! rejected as if the circuit were still open.
//!
//! # Deployment scope
//!
//! Breaker state lives in process memory, one registry per worker instance.
//! With several workers each keeps its own approximation of a dependency's
//! health, so a failing dependency may receive up to `failure_threshold`
//! calls per worker before every worker stops calling it. Correctness never
//! depends on breaker state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use lexa_common::config::BreakerPreset;
use lexa_common::events::{EventBus, LexaEvent};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Thresholds for one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Cooldown before a half-open probe is allowed
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Dependencies whose failure hurts most: trip early, back off long
    pub fn critical() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }

    pub fn normal() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }

    /// Best-effort dependencies: tolerate more noise, probe again soon
    pub fn relaxed() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_preset(preset: BreakerPreset) -> Self {
        match preset {
            BreakerPreset::Critical => Self::critical(),
            BreakerPreset::Normal => Self::normal(),
            BreakerPreset::Relaxed => Self::relaxed(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::normal()
    }
}

/// Error from a call made through a breaker
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Call rejected without invoking the operation
    #[error("circuit '{name}' is open, retry in {}ms", remaining.as_millis())]
    Open { name: String, remaining: Duration },

    /// The operation itself failed
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Probe,
}

/// Outcome reporter for one admitted call
///
/// A probe permit dropped without an outcome (the caller's future was
/// cancelled) counts as a failed probe so the breaker never stays wedged in
/// half-open.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.kind);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.kind);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Probe {
            self.breaker.record_failure(PermitKind::Probe);
        }
    }
}

/// Three-state circuit breaker for one named dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Run `operation` if the breaker admits it
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|remaining| CircuitError::Open {
            name: self.name.clone(),
            remaining,
        })?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Like [`call`](Self::call), but a rejected call yields `fallback(remaining)`
    pub async fn call_with_fallback<F, Fut, T, E, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(Duration) -> T,
    {
        match self.call(operation).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Open { remaining, .. }) => Ok(fallback(remaining)),
            Err(CircuitError::Inner(err)) => Err(err),
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.state != CircuitState::Closed;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            changed
        };
        if changed {
            self.announce(CircuitState::Closed);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a call or report the remaining cooldown
    fn try_acquire(&self) -> Result<Permit<'_>, Duration> {
        let mut announce = None;
        let result = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => Ok(PermitKind::Normal),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|t| t.elapsed())
                        .unwrap_or(self.config.reset_timeout);
                    if elapsed >= self.config.reset_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        announce = Some(CircuitState::HalfOpen);
                        Ok(PermitKind::Probe)
                    } else {
                        Err(self.config.reset_timeout - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        Err(Duration::ZERO)
                    } else {
                        inner.probe_in_flight = true;
                        Ok(PermitKind::Probe)
                    }
                }
            }
        };

        if let Some(state) = announce {
            tracing::info!(dependency = %self.name, "Circuit half-open, allowing probe call");
            self.announce(state);
        }

        match result {
            Ok(kind) => Ok(Permit {
                breaker: self,
                kind,
                settled: false,
            }),
            Err(remaining) => {
                tracing::debug!(
                    dependency = %self.name,
                    remaining_ms = remaining.as_millis() as u64,
                    "Circuit open, call rejected"
                );
                Err(remaining)
            }
        }
    }

    fn record_success(&self, kind: PermitKind) {
        let closed = {
            let mut inner = self.lock();
            match (kind, inner.state) {
                (PermitKind::Probe, _) => {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.probe_in_flight = false;
                    true
                }
                (PermitKind::Normal, CircuitState::Closed) => {
                    inner.consecutive_failures = 0;
                    false
                }
                // Late result of a call admitted before the breaker tripped
                (PermitKind::Normal, _) => false,
            }
        };

        if closed {
            tracing::info!(dependency = %self.name, "Circuit closed after successful probe");
            self.announce(CircuitState::Closed);
        }
    }

    fn record_failure(&self, kind: PermitKind) {
        let opened = {
            let mut inner = self.lock();
            match (kind, inner.state) {
                (PermitKind::Probe, _) => {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_in_flight = false;
                    Some(inner.consecutive_failures)
                }
                (PermitKind::Normal, CircuitState::Closed) => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        Some(inner.consecutive_failures)
                    } else {
                        None
                    }
                }
                (PermitKind::Normal, _) => None,
            }
        };

        if let Some(failures) = opened {
            tracing::warn!(
                dependency = %self.name,
                consecutive_failures = failures,
                cooldown_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
            self.announce(CircuitState::Open);
        }
    }

    fn announce(&self, state: CircuitState) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(LexaEvent::CircuitStateChanged {
                dependency: self.name.clone(),
                state: state.as_str().to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

/// Breakers keyed by dependency name, one registry per worker process
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    event_bus: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(event_bus: EventBus) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            event_bus: Some(event_bus),
        }
    }

    /// Breaker for `name`, created with `config` on first use
    ///
    /// Later calls return the existing breaker even if `config` differs.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
        {
            return existing.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(name, config);
                if let Some(bus) = &self.event_bus {
                    breaker = breaker.with_event_bus(bus.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Snapshots sorted by dependency name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
