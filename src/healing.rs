//! Self-healing strategy executor.
//!
//! A classified failure selects a strategy; its actions run strictly in
//! order, the recovery budget is checked between actions, and the attempt
//! succeeds only if every success criterion passes afterwards. The returned
//! [`HealingAttemptRecord`] is the full trace whatever the outcome.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breaker::{CircuitBreakerEngine, ServiceIdentity};
use crate::clock::{self, Clock};
use crate::error::{ActionError, ConfigError, CriterionError, HealingFailure};
use crate::telemetry::TelemetrySink;

pub type ActionId = String;
pub type CriterionId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What the failure detector observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub kind: String,
    pub affected_service: ServiceIdentity,
    #[serde(default)]
    pub detection_methods_matched: BTreeSet<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl FailureClassification {
    pub fn new(kind: impl Into<String>, service: impl Into<ServiceIdentity>) -> Self {
        Self {
            kind: kind.into(),
            affected_service: service.into(),
            detection_methods_matched: BTreeSet::new(),
            severity: Severity::default(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealingStrategy {
    /// Executed in this order, one at a time.
    pub actions: Vec<ActionId>,
    #[serde(default)]
    pub success_criteria: BTreeSet<CriterionId>,
    #[serde(with = "crate::config::duration")]
    pub max_recovery_duration: Duration,
}

impl HealingStrategy {
    pub fn validate(&self, kind: &str) -> Result<(), ConfigError> {
        if self.max_recovery_duration.is_zero() {
            return Err(ConfigError::ZeroStrategyValue {
                kind: kind.to_string(),
                field: "max_recovery_duration",
            });
        }
        Ok(())
    }
}

/// Runs one remediation action against a service. `Ok(false)` means the
/// action ran and reported failure.
pub trait RemediationActions: Send + Sync {
    fn execute(&self, action: &str, service: &str) -> Result<bool, ActionError>;
}

/// Evaluates one health criterion against the live service.
pub trait HealthCriteria: Send + Sync {
    fn evaluate(&self, criterion: &str, service: &str) -> Result<bool, CriterionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingOutcome {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionExecution {
    pub action_id: ActionId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionResult {
    pub criterion_id: CriterionId,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Complete, replayable trace of one healing attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingAttemptRecord {
    pub attempt_id: Uuid,
    pub failure_kind: String,
    pub service: ServiceIdentity,
    pub severity: Severity,
    pub actions_executed: Vec<ActionExecution>,
    pub criteria_results: Vec<CriterionResult>,
    pub outcome: HealingOutcome,
    pub failure: Option<HealingFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl HealingAttemptRecord {
    fn start(classification: &FailureClassification, at: DateTime<Utc>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            failure_kind: classification.kind.clone(),
            service: classification.affected_service.clone(),
            severity: classification.severity,
            actions_executed: Vec::new(),
            criteria_results: Vec::new(),
            outcome: HealingOutcome::Pending,
            failure: None,
            started_at: at,
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == HealingOutcome::Succeeded
    }

    pub fn action_ids(&self) -> Vec<&str> {
        self.actions_executed
            .iter()
            .map(|a| a.action_id.as_str())
            .collect()
    }
}

pub struct HealingExecutor {
    strategies: BTreeMap<String, HealingStrategy>,
    actions: Arc<dyn RemediationActions>,
    criteria: Arc<dyn HealthCriteria>,
    breakers: Option<Arc<CircuitBreakerEngine>>,
    action_pause: Duration,
    retention: Duration,
    recent: Mutex<VecDeque<HealingAttemptRecord>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl HealingExecutor {
    pub fn new(
        strategies: BTreeMap<String, HealingStrategy>,
        actions: Arc<dyn RemediationActions>,
        criteria: Arc<dyn HealthCriteria>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            strategies,
            actions,
            criteria,
            breakers: None,
            action_pause: Duration::ZERO,
            retention: Duration::from_secs(3600),
            recent: Mutex::new(VecDeque::new()),
            clock,
            sink,
        }
    }

    /// Report verified recoveries to these breakers as probe successes.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerEngine>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_action_pause(mut self, pause: Duration) -> Self {
        self.action_pause = pause;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn strategy(&self, kind: &str) -> Option<&HealingStrategy> {
        self.strategies.get(kind)
    }

    /// Run the strategy for `classification`. Blocks until the attempt ends.
    pub fn heal(&self, classification: &FailureClassification) -> HealingAttemptRecord {
        let mut record = HealingAttemptRecord::start(classification, self.clock.now());

        let Some(strategy) = self.strategies.get(&classification.kind) else {
            let failure = HealingFailure::UnknownFailureKind {
                kind: classification.kind.clone(),
            };
            return self.finish(record, Some(failure));
        };

        tracing::info!(
            attempt = %record.attempt_id,
            kind = %classification.kind,
            service = %classification.affected_service,
            severity = %classification.severity,
            actions = strategy.actions.len(),
            "healing started"
        );

        if let Some(failure) = self.run_actions(strategy, &mut record) {
            return self.finish(record, Some(failure));
        }

        let failed = self.check_criteria(strategy, &mut record);
        let failure = if failed.is_empty() {
            None
        } else {
            Some(HealingFailure::CriteriaNotMet { failed })
        };
        self.finish(record, failure)
    }

    /// Returns the failure that aborted the plan, if any.
    fn run_actions(
        &self,
        strategy: &HealingStrategy,
        record: &mut HealingAttemptRecord,
    ) -> Option<HealingFailure> {
        let budget = strategy.max_recovery_duration;
        for (i, action) in strategy.actions.iter().enumerate() {
            if i > 0 {
                self.clock.sleep(self.action_pause);
            }
            let started_at = self.clock.now();
            let (succeeded, error) = match self.actions.execute(action, &record.service) {
                Ok(true) => (true, None),
                Ok(false) => (false, Some("action reported failure".to_string())),
                Err(e) => (false, Some(e.to_string())),
            };
            tracing::debug!(action = %action, service = %record.service, succeeded, "remediation action finished");
            record.actions_executed.push(ActionExecution {
                action_id: action.clone(),
                started_at,
                finished_at: self.clock.now(),
                succeeded,
                error: error.clone(),
            });

            if let Some(reason) = error {
                return Some(HealingFailure::RemediationActionError {
                    action: action.clone(),
                    reason,
                });
            }

            let elapsed = clock::elapsed(record.started_at, self.clock.now());
            if elapsed > budget {
                return Some(HealingFailure::RecoveryTimeoutExceeded {
                    budget_ms: clock::millis(budget),
                    elapsed_ms: clock::millis(elapsed),
                });
            }
        }
        None
    }

    /// Evaluates every criterion; returns the ids that did not pass.
    fn check_criteria(
        &self,
        strategy: &HealingStrategy,
        record: &mut HealingAttemptRecord,
    ) -> Vec<CriterionId> {
        let mut failed = Vec::new();
        for criterion in &strategy.success_criteria {
            // An evaluator error is never read as healthy.
            let (passed, error) = match self.criteria.evaluate(criterion, &record.service) {
                Ok(passed) => (passed, None),
                Err(e) => (false, Some(e.to_string())),
            };
            if !passed {
                failed.push(criterion.clone());
            }
            record.criteria_results.push(CriterionResult {
                criterion_id: criterion.clone(),
                passed,
                error,
            });
        }
        failed
    }

    fn finish(
        &self,
        mut record: HealingAttemptRecord,
        failure: Option<HealingFailure>,
    ) -> HealingAttemptRecord {
        let now = self.clock.now();
        record.finished_at = Some(now);
        record.outcome = if failure.is_none() {
            HealingOutcome::Succeeded
        } else {
            HealingOutcome::Failed
        };
        record.failure = failure;

        if record.succeeded() {
            if let Some(breakers) = &self.breakers {
                if let Err(e) = breakers.report_probe_success(&record.service, now) {
                    tracing::warn!(service = %record.service, error = %e, "could not report recovery probe");
                }
            }
        }

        self.sink.healing_completed(&record);
        let mut recent = self.recent.lock();
        recent.push_back(record.clone());
        Self::prune(&mut recent, clock::sub(now, self.retention));
        record
    }

    fn prune(recent: &mut VecDeque<HealingAttemptRecord>, cutoff: DateTime<Utc>) {
        while recent
            .front()
            .is_some_and(|r| r.finished_at.unwrap_or(r.started_at) < cutoff)
        {
            recent.pop_front();
        }
    }

    /// Attempts finished within the retention window, oldest first.
    pub fn recent_attempts(&self) -> Vec<HealingAttemptRecord> {
        let cutoff = clock::sub(self.clock.now(), self.retention);
        let mut recent = self.recent.lock();
        Self::prune(&mut recent, cutoff);
        recent.iter().cloned().collect()
    }
}
