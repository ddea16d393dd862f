//! Telemetry sinks.
//!
//! Everything the coordinator publishes goes through [`TelemetrySink`]:
//! breaker transitions, tier transitions and completed healing attempts.
//! Sinks are fire-and-forget and are invoked with no breaker or tier lock
//! held. Anything slower than a log line belongs behind a queue.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::breaker::StateTransition;
use crate::healing::HealingAttemptRecord;
use crate::tier::TierTransitionEvent;

pub trait TelemetrySink: Send + Sync {
    fn breaker_transition(&self, service: &str, transition: &StateTransition);
    fn tier_transition(&self, event: &TierTransitionEvent);
    fn healing_completed(&self, record: &HealingAttemptRecord);
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn breaker_transition(&self, service: &str, t: &StateTransition) {
        tracing::info!(
            target: "fault_coordinator::breaker",
            service,
            from = %t.from,
            to = %t.to,
            reason = %t.reason,
            at = %t.at,
            "circuit transition"
        );
    }

    fn tier_transition(&self, event: &TierTransitionEvent) {
        tracing::warn!(
            target: "fault_coordinator::tier",
            from = %event.from_tier,
            to = %event.to_tier,
            cause = %event.cause,
            ux_impact_pct = event.ux_impact,
            "degradation tier changed"
        );
    }

    fn healing_completed(&self, record: &HealingAttemptRecord) {
        match &record.failure {
            None => tracing::info!(
                target: "fault_coordinator::healing",
                attempt = %record.attempt_id,
                service = %record.service,
                kind = %record.failure_kind,
                actions = record.actions_executed.len(),
                "healing succeeded"
            ),
            Some(failure) => tracing::warn!(
                target: "fault_coordinator::healing",
                attempt = %record.attempt_id,
                service = %record.service,
                kind = %record.failure_kind,
                actions = record.actions_executed.len(),
                %failure,
                "healing failed"
            ),
        }
    }
}

/// Keeps every event in memory. Used by hosts that poll, and by tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    breaker: Mutex<Vec<(String, StateTransition)>>,
    tiers: Mutex<Vec<TierTransitionEvent>>,
    healing: Mutex<Vec<HealingAttemptRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker_transitions(&self) -> Vec<(String, StateTransition)> {
        self.breaker.lock().clone()
    }

    pub fn tier_transitions(&self) -> Vec<TierTransitionEvent> {
        self.tiers.lock().clone()
    }

    pub fn healing_records(&self) -> Vec<HealingAttemptRecord> {
        self.healing.lock().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn breaker_transition(&self, service: &str, transition: &StateTransition) {
        self.breaker
            .lock()
            .push((service.to_string(), transition.clone()));
    }

    fn tier_transition(&self, event: &TierTransitionEvent) {
        self.tiers.lock().push(event.clone());
    }

    fn healing_completed(&self, record: &HealingAttemptRecord) {
        self.healing.lock().push(record.clone());
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }
}

impl TelemetrySink for FanoutSink {
    fn breaker_transition(&self, service: &str, transition: &StateTransition) {
        for sink in &self.sinks {
            sink.breaker_transition(service, transition);
        }
    }

    fn tier_transition(&self, event: &TierTransitionEvent) {
        for sink in &self.sinks {
            sink.tier_transition(event);
        }
    }

    fn healing_completed(&self, record: &HealingAttemptRecord) {
        for sink in &self.sinks {
            sink.healing_completed(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitState, TransitionReason};
    use crate::clock::epoch_secs;

    #[test]
    fn fanout_forwards_to_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let mut fanout = FanoutSink::new(vec![a.clone() as Arc<dyn TelemetrySink>]);
        fanout.push(b.clone());
        fanout.push(Arc::new(TracingSink));

        let t = StateTransition {
            from: CircuitState::Closed,
            to: CircuitState::Open,
            reason: TransitionReason::FailureThresholdExceeded,
            at: epoch_secs(5),
        };
        fanout.breaker_transition("db", &t);

        assert_eq!(a.breaker_transitions(), vec![("db".to_string(), t.clone())]);
        assert_eq!(b.breaker_transitions().len(), 1);
        assert!(a.tier_transitions().is_empty());
    }
}
