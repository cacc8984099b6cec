//! LLM health monitor (circuit breaker)
//!
//! Every change to circuit state goes through [`transition`], a pure function
//! over `(state, event, now)`. [`CircuitBreaker`] owns the state behind a mutex
//! and is the only caller of it; nothing else reads or writes the raw fields.
//!
//! ```text
//!   CLOSED --failure_threshold failures--> OPEN
//!   OPEN --recovery_timeout elapsed / probe ok--> HALF_OPEN
//!   HALF_OPEN --any failure--> OPEN (opened_at reset)
//!   HALF_OPEN --half_open_max_calls successes--> CLOSED
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CircuitConfig, CircuitScope};
use crate::error::{Error, ProviderError, Result};
use crate::llm::InferenceProvider;

/// Kind of inference call guarded by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Embedding,
    Extraction,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedding => f.write_str("embedding"),
            Self::Extraction => f.write_str("extraction"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// In-memory circuit state. Never persisted; a restart resets it to closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// Trial calls admitted since entering half-open
    pub half_open_probe_count: u32,
    /// Trial calls that succeeded since entering half-open
    pub half_open_successes: u32,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probe_count: 0,
            half_open_successes: 0,
        }
    }
}

impl CircuitState {
    fn open(&mut self, now: Instant) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.half_open_probe_count = 0;
        self.half_open_successes = 0;
    }

    fn half_open(&mut self) {
        self.status = CircuitStatus::HalfOpen;
        self.half_open_probe_count = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        *self = Self::default();
    }

    fn remaining_open(&self, now: Instant, recovery_timeout: Duration) -> Duration {
        let elapsed = self
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(recovery_timeout);
        recovery_timeout.saturating_sub(elapsed)
    }
}

/// Input to the circuit state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    /// A caller wants to make a real call
    Acquire,
    Success,
    Failure,
    /// An admitted call was dropped before it reported an outcome
    Abandoned,
    ProbeSucceeded,
    ProbeFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject { retry_after: Duration },
    Recorded,
}

/// The circuit state machine
pub fn transition(
    state: &mut CircuitState,
    event: CircuitEvent,
    now: Instant,
    config: &CircuitConfig,
) -> Decision {
    let recovery = config.recovery_timeout();

    match (state.status, event) {
        (CircuitStatus::Closed, CircuitEvent::Acquire) => Decision::Admit,
        (CircuitStatus::Open, CircuitEvent::Acquire) => {
            let remaining = state.remaining_open(now, recovery);
            if !remaining.is_zero() {
                return Decision::Reject { retry_after: remaining };
            }
            state.half_open();
            state.half_open_probe_count = 1;
            Decision::Admit
        }
        (CircuitStatus::HalfOpen, CircuitEvent::Acquire) => {
            if state.half_open_probe_count >= config.half_open_max_calls {
                return Decision::Reject { retry_after: recovery };
            }
            state.half_open_probe_count += 1;
            Decision::Admit
        }

        (CircuitStatus::Closed, CircuitEvent::Success | CircuitEvent::ProbeSucceeded) => {
            state.consecutive_failures = 0;
            Decision::Recorded
        }
        (CircuitStatus::HalfOpen, CircuitEvent::Success) => {
            state.half_open_successes += 1;
            if state.half_open_successes >= config.half_open_max_calls {
                state.close();
            }
            Decision::Recorded
        }
        (CircuitStatus::Open, CircuitEvent::ProbeSucceeded) => {
            state.half_open();
            Decision::Recorded
        }

        (CircuitStatus::Closed, CircuitEvent::Failure | CircuitEvent::ProbeFailed) => {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= config.failure_threshold {
                state.open(now);
            }
            Decision::Recorded
        }
        (CircuitStatus::HalfOpen, CircuitEvent::Failure | CircuitEvent::ProbeFailed) => {
            state.consecutive_failures += 1;
            state.open(now);
            Decision::Recorded
        }
        (CircuitStatus::Open, CircuitEvent::Failure) => {
            state.consecutive_failures += 1;
            Decision::Recorded
        }

        (CircuitStatus::HalfOpen, CircuitEvent::Abandoned) => {
            state.half_open_probe_count = state.half_open_probe_count.saturating_sub(1);
            Decision::Recorded
        }

        // Late successes from calls admitted before the circuit opened, probe
        // failures while already open, and abandoned calls elsewhere change nothing
        (CircuitStatus::Open, CircuitEvent::Success | CircuitEvent::ProbeFailed)
        | (CircuitStatus::HalfOpen, CircuitEvent::ProbeSucceeded)
        | (_, CircuitEvent::Abandoned) => Decision::Recorded,
    }
}

/// Provider availability as seen by the degradation controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Circuit closed
    Available,
    /// Circuit half-open, or open with its recovery timeout elapsed
    Probing,
    /// Circuit open; calls fail fast
    Unavailable { retry_after: Duration },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unavailable { .. })
    }
}

/// One circuit breaker guarding one failure counter
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(CircuitState::default()),
        }
    }

    fn apply(&self, event: CircuitEvent) -> Decision {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.status;
        let decision = transition(&mut state, event, now, &self.config);

        if state.status != before {
            match state.status {
                CircuitStatus::Open => warn!(
                    circuit = self.name,
                    from = before.as_str(),
                    consecutive_failures = state.consecutive_failures,
                    recovery_secs = self.config.recovery_timeout_secs,
                    "Circuit opened, inference calls will fail fast"
                ),
                CircuitStatus::HalfOpen => info!(
                    circuit = self.name,
                    ?event,
                    "Circuit half-open, admitting trial calls"
                ),
                CircuitStatus::Closed => info!(circuit = self.name, "Circuit closed, provider recovered"),
            }
        }

        decision
    }

    /// Ask to make a call; the permit reports its outcome back to this breaker
    pub fn acquire(&self) -> Result<CallPermit<'_>> {
        match self.apply(CircuitEvent::Acquire) {
            Decision::Reject { retry_after } => Err(Error::CircuitOpen { retry_after }),
            _ => Ok(CallPermit {
                breaker: self,
                settled: false,
            }),
        }
    }

    pub fn record_probe(&self, healthy: bool) {
        self.apply(if healthy {
            CircuitEvent::ProbeSucceeded
        } else {
            CircuitEvent::ProbeFailed
        });
    }

    pub fn snapshot(&self) -> CircuitState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn availability(&self) -> Availability {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.status {
            CircuitStatus::Closed => Availability::Available,
            CircuitStatus::HalfOpen => Availability::Probing,
            CircuitStatus::Open => {
                let remaining = state.remaining_open(Instant::now(), self.config.recovery_timeout());
                if remaining.is_zero() {
                    Availability::Probing
                } else {
                    Availability::Unavailable { retry_after: remaining }
                }
            }
        }
    }
}

/// Admission to make one provider call
///
/// Dropping a permit without calling [`succeed`](Self::succeed) or
/// [`fail`](Self::fail) releases its half-open trial slot.
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.apply(CircuitEvent::Success);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.apply(CircuitEvent::Failure);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.apply(CircuitEvent::Abandoned);
        }
    }
}

/// Health monitor over the inference provider
///
/// Holds one breaker per call kind. With [`CircuitScope::Shared`] both kinds
/// point at the same breaker and share one failure counter.
#[derive(Debug)]
pub struct HealthMonitor {
    embedding: Arc<CircuitBreaker>,
    extraction: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(config: CircuitConfig, call_timeout: Duration) -> Self {
        let (embedding, extraction) = match config.scope {
            CircuitScope::Shared => {
                let shared = Arc::new(CircuitBreaker::new("inference", config));
                (shared.clone(), shared)
            }
            CircuitScope::PerCallType => (
                Arc::new(CircuitBreaker::new("embedding", config.clone())),
                Arc::new(CircuitBreaker::new("extraction", config)),
            ),
        };

        Self {
            embedding,
            extraction,
            call_timeout,
        }
    }

    pub fn breaker(&self, kind: CallKind) -> &CircuitBreaker {
        match kind {
            CallKind::Embedding => &self.embedding,
            CallKind::Extraction => &self.extraction,
        }
    }

    fn breakers(&self) -> impl Iterator<Item = &CircuitBreaker> {
        let extraction = (!Arc::ptr_eq(&self.embedding, &self.extraction)).then_some(&*self.extraction);
        std::iter::once(&*self.embedding).chain(extraction)
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run one provider call through the circuit with the per-call timeout.
    ///
    /// Fails fast with [`Error::CircuitOpen`] without polling `call` when the
    /// circuit rejects it. Every provider failure counts toward opening the
    /// circuit, whatever its recoverability.
    pub async fn call<T, F>(&self, kind: CallKind, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let permit = self.breaker(kind).acquire()?;

        let outcome = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::network(format!(
                "{} call timed out after {}ms",
                kind,
                self.call_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                debug!(%kind, kind_class = %err.kind, error = %err.message, "Provider call failed");
                permit.fail();
                Err(err.into())
            }
        }
    }

    /// Combined availability; the least available breaker wins
    pub fn availability(&self) -> Availability {
        self.breakers()
            .map(CircuitBreaker::availability)
            .fold(Availability::Available, |acc, next| match (acc, next) {
                (Availability::Unavailable { retry_after: a }, Availability::Unavailable { retry_after: b }) => {
                    Availability::Unavailable {
                        retry_after: a.max(b),
                    }
                }
                (Availability::Unavailable { .. }, _) => acc,
                (_, Availability::Unavailable { .. }) => next,
                (Availability::Probing, _) | (_, Availability::Probing) => Availability::Probing,
                _ => Availability::Available,
            })
    }

    pub fn snapshot(&self, kind: CallKind) -> CircuitState {
        self.breaker(kind).snapshot()
    }

    /// Exercise the provider once and feed the result to every breaker
    pub async fn probe_once(&self, provider: &dyn InferenceProvider) -> bool {
        let healthy = match tokio::time::timeout(self.call_timeout, provider.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(kind = %err.kind, error = %err.message, "Health probe failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = self.call_timeout.as_millis() as u64, "Health probe timed out");
                false
            }
        };

        for breaker in self.breakers() {
            breaker.record_probe(healthy);
        }
        healthy
    }

    /// Probe once now, then every `interval`, until cancelled
    pub fn spawn_probe(
        self: Arc<Self>,
        provider: Arc<dyn InferenceProvider>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let healthy = self.probe_once(provider.as_ref()).await;
                        debug!(healthy, "Health probe completed");
                    }
                }
            }

            debug!("Health probe loop stopped");
        })
    }
}
