//! Circuit breaker engine.
//!
//! One breaker per service, created lazily on first reference.
//! State machine: Closed -> Open -> HalfOpen -> Closed. The Open -> HalfOpen
//! step is taken lazily by `admit`; nothing runs in the background.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::clock::{self, Clock};
use crate::error::ConfigError;
use crate::telemetry::TelemetrySink;

/// Logical service name. Key for all per-service state.
pub type ServiceIdentity = String;

pub const DEFAULT_HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionReason {
    FailureThresholdExceeded,
    TimeoutExpired,
    SuccessThresholdMet,
    ProbeFailed,
    /// A healing attempt verified recovery and stood in for a probe.
    RecoveryVerified,
    ManualReset,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::FailureThresholdExceeded => "failure-threshold-exceeded",
            TransitionReason::TimeoutExpired => "timeout-expired",
            TransitionReason::SuccessThresholdMet => "success-threshold-met",
            TransitionReason::ProbeFailed => "probe-failed",
            TransitionReason::RecoveryVerified => "recovery-verified",
            TransitionReason::ManualReset => "manual-reset",
        }
    }
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a breaker's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Answer to "may I call this service?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "state", rename_all = "snake_case")]
pub enum Admission {
    Allow,
    /// Rejected; carries the state the breaker was in.
    Reject(CircuitState),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_window` that open the circuit.
    pub failure_threshold: u32,
    /// Time since the last failure before an Open circuit admits a probe.
    #[serde(with = "crate::config::duration")]
    pub open_timeout: Duration,
    /// Consecutive HalfOpen successes that close the circuit.
    pub success_threshold: u32,
    /// Failures older than this fall out of the count.
    #[serde(with = "crate::config::duration")]
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self, service: &str) -> Result<(), ConfigError> {
        let zero = |field| {
            Err(ConfigError::ZeroValue {
                service: service.to_string(),
                field,
            })
        };
        if self.failure_threshold == 0 {
            return zero("failure_threshold");
        }
        if self.success_threshold == 0 {
            return zero("success_threshold");
        }
        if self.open_timeout.is_zero() {
            return zero("open_timeout");
        }
        if self.monitoring_window.is_zero() {
            return zero("monitoring_window");
        }
        Ok(())
    }
}

/// State machine for a single service.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    probe_started_at: Option<DateTime<Utc>>,
    history: VecDeque<StateTransition>,
    history_cap: usize,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, history_cap: usize) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            last_failure_at: None,
            probe_started_at: None,
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
            total_successes: 0,
            total_failures: 0,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    fn transition(
        &mut self,
        to: CircuitState,
        reason: TransitionReason,
        at: DateTime<Utc>,
    ) -> StateTransition {
        let entry = StateTransition {
            from: self.state,
            to,
            reason,
            at,
        };
        self.state = to;
        if to == CircuitState::Open {
            self.times_opened += 1;
        }
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(entry.clone());
        entry
    }

    /// Drop failures that fell out of the monitoring window ending at `at`.
    fn prune(&mut self, at: DateTime<Utc>) {
        let cutoff = clock::sub(at, self.config.monitoring_window);
        self.failures.retain(|t| *t > cutoff);
    }

    fn probe_in_flight(&self, now: DateTime<Utc>) -> bool {
        // A probe whose outcome never came back stops blocking after open_timeout.
        self.probe_started_at
            .is_some_and(|started| clock::elapsed(started, now) < self.config.open_timeout)
    }

    /// Admission check. May promote Open -> HalfOpen.
    pub fn admit(&mut self, now: DateTime<Utc>) -> (Admission, Option<StateTransition>) {
        match self.state {
            CircuitState::Closed => (Admission::Allow, None),
            CircuitState::Open => {
                let expired = self
                    .last_failure_at
                    .map_or(true, |t| clock::elapsed(t, now) >= self.config.open_timeout);
                if !expired {
                    return (Admission::Reject(CircuitState::Open), None);
                }
                self.success_count = 0;
                self.probe_started_at = Some(now);
                let t = self.transition(CircuitState::HalfOpen, TransitionReason::TimeoutExpired, now);
                (Admission::Allow, Some(t))
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight(now) {
                    return (Admission::Reject(CircuitState::HalfOpen), None);
                }
                self.probe_started_at = Some(now);
                (Admission::Allow, None)
            }
        }
    }

    /// Feed one call outcome into the state machine.
    pub fn record_outcome(&mut self, success: bool, at: DateTime<Utc>) -> Option<StateTransition> {
        if success {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }

        match (self.state, success) {
            (CircuitState::Closed, true) => {
                self.prune(at);
                None
            }
            (CircuitState::Closed, false) => {
                self.failures.push_back(at);
                self.last_failure_at = Some(at);
                self.prune(at);
                if self.failures.len() >= self.config.failure_threshold as usize {
                    self.success_count = 0;
                    Some(self.transition(
                        CircuitState::Open,
                        TransitionReason::FailureThresholdExceeded,
                        at,
                    ))
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, true) => self.half_open_success(at),
            (CircuitState::HalfOpen, false) => {
                self.probe_started_at = None;
                self.failures.push_back(at);
                self.last_failure_at = Some(at);
                self.success_count = 0;
                Some(self.transition(CircuitState::Open, TransitionReason::ProbeFailed, at))
            }
            // Late outcomes of calls admitted before the circuit opened.
            (CircuitState::Open, _) => None,
        }
    }

    fn half_open_success(&mut self, at: DateTime<Utc>) -> Option<StateTransition> {
        self.probe_started_at = None;
        self.success_count += 1;
        if self.success_count < self.config.success_threshold {
            return None;
        }
        self.failures.clear();
        self.success_count = 0;
        Some(self.transition(
            CircuitState::Closed,
            TransitionReason::SuccessThresholdMet,
            at,
        ))
    }

    /// Synthetic successful probe from a verified healing attempt.
    pub fn record_probe_success(&mut self, at: DateTime<Utc>) -> Vec<StateTransition> {
        let mut transitions = Vec::new();
        if self.state == CircuitState::Closed {
            return transitions;
        }
        if self.state == CircuitState::Open {
            self.success_count = 0;
            transitions.push(self.transition(
                CircuitState::HalfOpen,
                TransitionReason::RecoveryVerified,
                at,
            ));
        }
        self.total_successes += 1;
        transitions.extend(self.half_open_success(at));
        transitions
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&mut self, at: DateTime<Utc>) -> Option<StateTransition> {
        self.failures.clear();
        self.success_count = 0;
        self.last_failure_at = None;
        self.probe_started_at = None;
        if self.state == CircuitState::Closed {
            return None;
        }
        Some(self.transition(CircuitState::Closed, TransitionReason::ManualReset, at))
    }

    pub fn status(&self, service: &str, now: DateTime<Utc>) -> CircuitStatus {
        let time_until_retry_ms = match (self.state, self.last_failure_at) {
            (CircuitState::Open, Some(t)) => Some(clock::millis(
                self.config
                    .open_timeout
                    .saturating_sub(clock::elapsed(t, now)),
            )),
            _ => None,
        };

        CircuitStatus {
            service: service.to_string(),
            state: self.state,
            failure_count: self.failures.len(),
            success_count: self.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_timeout_ms: clock::millis(self.config.open_timeout),
            last_failure_at: self.last_failure_at,
            time_until_retry_ms,
            probe_in_flight: self.state == CircuitState::HalfOpen && self.probe_in_flight(now),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            times_opened: self.times_opened,
            last_transition: self.history.back().cloned(),
        }
    }
}

/// Serialisable breaker snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub time_until_retry_ms: Option<u64>,
    pub probe_in_flight: bool,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    pub last_transition: Option<StateTransition>,
}

/// Owns every per-service breaker. Other components only read snapshots.
pub struct CircuitBreakerEngine {
    configs: HashMap<ServiceIdentity, CircuitBreakerConfig>,
    defaults: Option<CircuitBreakerConfig>,
    history_cap: usize,
    breakers: RwLock<HashMap<ServiceIdentity, Arc<Mutex<CircuitBreaker>>>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl CircuitBreakerEngine {
    pub fn new(
        configs: HashMap<ServiceIdentity, CircuitBreakerConfig>,
        defaults: Option<CircuitBreakerConfig>,
        history_cap: usize,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            configs,
            defaults,
            history_cap,
            breakers: RwLock::new(HashMap::new()),
            clock,
            sink,
        }
    }

    fn breaker(&self, service: &str) -> Result<Arc<Mutex<CircuitBreaker>>, ConfigError> {
        if let Some(b) = self.breakers.read().get(service) {
            return Ok(Arc::clone(b));
        }
        let config = self
            .configs
            .get(service)
            .or(self.defaults.as_ref())
            .cloned()
            .ok_or_else(|| ConfigError::MissingBreakerConfig(service.to_string()))?;

        let mut breakers = self.breakers.write();
        let entry = breakers.entry(service.to_string()).or_insert_with(|| {
            tracing::debug!(service, "creating circuit breaker");
            Arc::new(Mutex::new(CircuitBreaker::new(config, self.history_cap)))
        });
        Ok(Arc::clone(entry))
    }

    /// Called with the breaker lock released; `history` stays the ordered record.
    fn publish(&self, service: &str, transition: &StateTransition) {
        self.sink.breaker_transition(service, transition);
    }

    /// May the caller invoke `service` now?
    pub fn admit(&self, service: &str) -> Result<Admission, ConfigError> {
        let breaker = self.breaker(service)?;
        let (admission, transition) = breaker.lock().admit(self.clock.now());
        if let Some(t) = transition {
            self.publish(service, &t);
        }
        if let Admission::Reject(state) = admission {
            tracing::debug!(service, %state, "call rejected");
        }
        Ok(admission)
    }

    pub fn record_outcome(
        &self,
        service: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<StateTransition>, ConfigError> {
        let breaker = self.breaker(service)?;
        let transition = breaker.lock().record_outcome(success, at);
        if let Some(t) = &transition {
            self.publish(service, t);
        }
        Ok(transition)
    }

    /// Count a verified recovery as a successful probe.
    pub fn report_probe_success(
        &self,
        service: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<StateTransition>, ConfigError> {
        let breaker = self.breaker(service)?;
        let transitions = breaker.lock().record_probe_success(at);
        for t in &transitions {
            self.publish(service, t);
        }
        Ok(transitions)
    }

    pub fn reset(&self, service: &str) -> Result<Option<StateTransition>, ConfigError> {
        let breaker = self.breaker(service)?;
        let transition = breaker.lock().reset(self.clock.now());
        if let Some(t) = &transition {
            self.publish(service, t);
        }
        Ok(transition)
    }

    /// Current state, or `None` if the service was never referenced.
    pub fn state(&self, service: &str) -> Option<CircuitState> {
        self.breakers.read().get(service).map(|b| b.lock().state())
    }

    /// Services whose circuit is currently open.
    pub fn open_circuits(&self) -> BTreeSet<ServiceIdentity> {
        self.breakers
            .read()
            .iter()
            .filter(|(_, b)| b.lock().state() == CircuitState::Open)
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub fn status(&self, service: &str) -> Option<CircuitStatus> {
        let now = self.clock.now();
        self.breakers
            .read()
            .get(service)
            .map(|b| b.lock().status(service, now))
    }

    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let now = self.clock.now();
        let mut all: Vec<CircuitStatus> = self
            .breakers
            .read()
            .iter()
            .map(|(s, b)| b.lock().status(s, now))
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn history(&self, service: &str) -> Vec<StateTransition> {
        self.breakers
            .read()
            .get(service)
            .map(|b| b.lock().history().cloned().collect())
            .unwrap_or_default()
    }
}
