//! Coordinator: the three components wired together.
//!
//! Breaker changes that touch an open circuit trigger tier re-selection,
//! verified healing feeds back into the breakers, and a rejected admission
//! is turned into a degraded route or a fast failure.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::{
    Admission, CircuitBreakerEngine, CircuitState, CircuitStatus, ServiceIdentity, StateTransition,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::ConfigError;
use crate::healing::{
    FailureClassification, HealingAttemptRecord, HealingExecutor, HealthCriteria,
    RemediationActions,
};
use crate::telemetry::TelemetrySink;
use crate::tier::{DegradationTier, SystemLoadSample, TierController};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FastFailReason {
    /// The current tier has no service for the capability.
    CapabilityDisabled,
    /// The breaker rejected the call and no alternative is available.
    CircuitRejected { state: CircuitState },
}

/// Where a call for a capability should go.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum RouteDecision {
    Call {
        service: ServiceIdentity,
    },
    Degraded {
        requested: ServiceIdentity,
        substitute: ServiceIdentity,
        tier: String,
    },
    FastFail {
        capability: String,
        #[serde(flatten)]
        reason: FastFailReason,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub tier: String,
    pub tier_rank: u32,
    pub last_load: Option<f64>,
    pub open_circuits: BTreeSet<ServiceIdentity>,
    pub circuits: Vec<CircuitStatus>,
}

pub struct Coordinator {
    breakers: Arc<CircuitBreakerEngine>,
    tiers: TierController,
    healer: HealingExecutor,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        actions: Arc<dyn RemediationActions>,
        criteria: Arc<dyn HealthCriteria>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let breakers = Arc::new(CircuitBreakerEngine::new(
            config.services.clone().into_iter().collect(),
            config.defaults.clone(),
            config.history_cap,
            Arc::clone(&clock),
            Arc::clone(&sink),
        ));
        let tiers = TierController::new(
            config.tiers.clone(),
            config.tier_dwell,
            Arc::clone(&clock),
            Arc::clone(&sink),
        )?;
        let healer = HealingExecutor::new(config.strategies.clone(), actions, criteria, clock, sink)
            .with_breakers(Arc::clone(&breakers))
            .with_action_pause(config.healing.action_pause)
            .with_retention(config.healing.retention);
        Ok(Self {
            breakers,
            tiers,
            healer,
        })
    }

    pub fn breakers(&self) -> &CircuitBreakerEngine {
        &self.breakers
    }

    pub fn tiers(&self) -> &TierController {
        &self.tiers
    }

    pub fn healer(&self) -> &HealingExecutor {
        &self.healer
    }

    fn refresh_tier(&self) -> Arc<DegradationTier> {
        self.tiers.reselect(&self.breakers.open_circuits())
    }

    pub fn admit(&self, service: &str) -> Result<Admission, ConfigError> {
        let before = self.breakers.state(service);
        let admission = self.breakers.admit(service)?;
        if before == Some(CircuitState::Open) && self.breakers.state(service) != before {
            self.refresh_tier();
        }
        Ok(admission)
    }

    pub fn record_outcome(
        &self,
        service: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<StateTransition>, ConfigError> {
        let transition = self.breakers.record_outcome(service, success, at)?;
        if let Some(t) = &transition {
            if t.from == CircuitState::Open || t.to == CircuitState::Open {
                self.refresh_tier();
            }
        }
        Ok(transition)
    }

    /// Feed a load sample; returns the tier now in effect.
    pub fn observe_load(&self, sample: SystemLoadSample) -> Arc<DegradationTier> {
        self.tiers.select_tier(sample, &self.breakers.open_circuits())
    }

    /// Decide where a call for `capability` goes right now.
    pub fn route(&self, capability: &str) -> Result<RouteDecision, ConfigError> {
        let tier = self.tiers.current();
        let Some(primary) = tier.service_for(capability).cloned() else {
            return Ok(RouteDecision::FastFail {
                capability: capability.to_string(),
                reason: FastFailReason::CapabilityDisabled,
            });
        };

        let state = match self.admit(&primary)? {
            Admission::Allow => return Ok(RouteDecision::Call { service: primary }),
            Admission::Reject(state) => state,
        };

        let tier = self.refresh_tier();
        if let Some(substitute) = tier.service_for(capability) {
            if *substitute != primary && self.admit(substitute)?.is_allowed() {
                tracing::info!(capability, requested = %primary, %substitute, tier = %tier.id, "routing to degraded service");
                return Ok(RouteDecision::Degraded {
                    requested: primary,
                    substitute: substitute.clone(),
                    tier: tier.id.clone(),
                });
            }
        }
        Ok(RouteDecision::FastFail {
            capability: capability.to_string(),
            reason: FastFailReason::CircuitRejected { state },
        })
    }

    /// Run the healing strategy for a detected failure. Long-running.
    pub fn heal(&self, classification: &FailureClassification) -> HealingAttemptRecord {
        let record = self.healer.heal(classification);
        if record.succeeded() {
            self.refresh_tier();
        }
        record
    }

    pub fn reset(&self, service: &str) -> Result<Option<StateTransition>, ConfigError> {
        let transition = self.breakers.reset(service)?;
        if transition.is_some() {
            self.refresh_tier();
        }
        Ok(transition)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let tier = self.tiers.current();
        CoordinatorStatus {
            tier: tier.id.clone(),
            tier_rank: tier.rank,
            last_load: self.tiers.last_sample().map(|s| s.load()),
            open_circuits: self.breakers.open_circuits(),
            circuits: self.breakers.statuses(),
        }
    }
}
