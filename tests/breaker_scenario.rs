//! End-to-end breaker behaviour through the engine, driven by a manual clock.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Barrier, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use fault_coordinator::breaker::{
    Admission, CircuitBreakerConfig, CircuitBreakerEngine, CircuitState, StateTransition,
    TransitionReason,
};
use fault_coordinator::clock::{epoch_secs, ManualClock};
use fault_coordinator::error::ConfigError;
use fault_coordinator::healing::HealingAttemptRecord;
use fault_coordinator::telemetry::{RecordingSink, TelemetrySink};
use fault_coordinator::tier::TierTransitionEvent;

fn config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        open_timeout: Duration::from_secs(10),
        success_threshold: 2,
        monitoring_window: Duration::from_secs(60),
    }
}

fn engine(
    defaults: Option<CircuitBreakerConfig>,
) -> (Arc<CircuitBreakerEngine>, Arc<ManualClock>, Arc<RecordingSink>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let sink = Arc::new(RecordingSink::new());
    let mut configs = HashMap::new();
    configs.insert("payments".to_string(), config());
    let engine = CircuitBreakerEngine::new(configs, defaults, 1000, clock.clone(), sink.clone());
    (Arc::new(engine), clock, sink)
}

#[test]
fn trips_probes_and_recovers() {
    let (engine, clock, sink) = engine(None);

    for t in 1..=3 {
        clock.set(epoch_secs(t));
        assert_eq!(engine.admit("payments").unwrap(), Admission::Allow);
        engine.record_outcome("payments", false, epoch_secs(t)).unwrap();
    }
    assert_eq!(engine.state("payments"), Some(CircuitState::Open));

    // Open timeout runs from the last failure at t=3.
    clock.set(epoch_secs(12));
    assert_eq!(
        engine.admit("payments").unwrap(),
        Admission::Reject(CircuitState::Open)
    );
    clock.set(epoch_secs(13));
    assert_eq!(engine.admit("payments").unwrap(), Admission::Allow);
    assert_eq!(engine.state("payments"), Some(CircuitState::HalfOpen));

    // Probe in flight: everyone else is turned away.
    assert_eq!(
        engine.admit("payments").unwrap(),
        Admission::Reject(CircuitState::HalfOpen)
    );
    engine.record_outcome("payments", true, epoch_secs(13)).unwrap();
    assert_eq!(engine.state("payments"), Some(CircuitState::HalfOpen));

    clock.set(epoch_secs(14));
    assert_eq!(engine.admit("payments").unwrap(), Admission::Allow);
    let closed = engine
        .record_outcome("payments", true, epoch_secs(14))
        .unwrap()
        .unwrap();
    assert_eq!(closed.to, CircuitState::Closed);

    let reasons: Vec<TransitionReason> = engine
        .history("payments")
        .iter()
        .map(|t| t.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            TransitionReason::FailureThresholdExceeded,
            TransitionReason::TimeoutExpired,
            TransitionReason::SuccessThresholdMet,
        ]
    );
    assert_eq!(sink.breaker_transitions().len(), 3);
}

#[test]
fn failed_probe_reopens() {
    let (engine, clock, _) = engine(None);
    for t in 1..=3 {
        engine.record_outcome("payments", false, epoch_secs(t)).unwrap();
    }
    clock.set(epoch_secs(20));
    assert!(engine.admit("payments").unwrap().is_allowed());
    let t = engine
        .record_outcome("payments", false, epoch_secs(20))
        .unwrap()
        .unwrap();
    assert_eq!(t.reason, TransitionReason::ProbeFailed);
    assert_eq!(t.to, CircuitState::Open);

    // The fresh failure restarts the open timeout.
    clock.set(epoch_secs(25));
    assert!(!engine.admit("payments").unwrap().is_allowed());
    clock.set(epoch_secs(30));
    assert!(engine.admit("payments").unwrap().is_allowed());
}

#[test]
fn failures_outside_window_do_not_trip() {
    let (engine, clock, _) = engine(None);
    for t in [0, 40, 80, 120] {
        clock.set(epoch_secs(t));
        engine.record_outcome("payments", false, epoch_secs(t)).unwrap();
    }
    assert_eq!(engine.state("payments"), Some(CircuitState::Closed));
    assert_eq!(engine.status("payments").unwrap().failure_count, 2);
}

#[test]
fn unknown_service_uses_defaults_or_errors() {
    let (strict, _, _) = engine(None);
    assert!(matches!(
        strict.admit("search"),
        Err(ConfigError::MissingBreakerConfig(s)) if s == "search"
    ));

    let (lenient, _, _) = engine(Some(CircuitBreakerConfig {
        failure_threshold: 1,
        ..config()
    }));
    assert!(lenient.admit("search").unwrap().is_allowed());
    lenient.record_outcome("search", false, epoch_secs(0)).unwrap();
    assert_eq!(lenient.state("search"), Some(CircuitState::Open));
    assert!(lenient.open_circuits().contains("search"));
}

#[test]
fn manual_reset_closes_and_clears() {
    let (engine, _, _) = engine(None);
    for t in 1..=3 {
        engine.record_outcome("payments", false, epoch_secs(t)).unwrap();
    }
    let t = engine.reset("payments").unwrap().unwrap();
    assert_eq!(t.reason, TransitionReason::ManualReset);
    let status = engine.status("payments").unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);
    assert!(engine.reset("payments").unwrap().is_none());
}

#[test]
fn concurrent_admission_allows_single_probe() {
    let (engine, clock, _) = engine(None);
    for t in 1..=3 {
        engine.record_outcome("payments", false, epoch_secs(t)).unwrap();
    }
    clock.set(epoch_secs(60));

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.admit("payments").unwrap()
            })
        })
        .collect();

    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|a| a.is_allowed())
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(engine.state("payments"), Some(CircuitState::HalfOpen));
}

#[test]
fn concurrent_failures_trip_exactly_once() {
    let (engine, _, sink) = engine(None);
    let threads = 12;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .record_outcome("payments", false, epoch_secs(i as i64))
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let opened = sink
        .breaker_transitions()
        .iter()
        .filter(|(_, t)| t.to == CircuitState::Open)
        .count();
    assert_eq!(opened, 1);
    assert_eq!(engine.status("payments").unwrap().total_failures, 12);
}

/// Failures at t=0,1,2 with a 10s open timeout. The timeout runs from the
/// last failure (t=2), so t=11 is still rejected and the first trial call is
/// admitted at t=12.
#[test]
fn db_scenario_timeout_runs_from_last_failure() {
    let clock = Arc::new(ManualClock::at_epoch());
    let sink = Arc::new(RecordingSink::new());
    let engine = CircuitBreakerEngine::new(HashMap::new(), Some(config()), 1000, clock.clone(), sink);

    for t in 0..=2 {
        engine.record_outcome("db", false, epoch_secs(t)).unwrap();
    }
    clock.set(epoch_secs(5));
    assert!(!engine.admit("db").unwrap().is_allowed());
    clock.set(epoch_secs(11));
    assert!(!engine.admit("db").unwrap().is_allowed());
    clock.set(epoch_secs(12));
    assert!(engine.admit("db").unwrap().is_allowed());
    engine.record_outcome("db", true, epoch_secs(12)).unwrap();

    clock.set(epoch_secs(13));
    assert!(engine.admit("db").unwrap().is_allowed());
    engine.record_outcome("db", true, epoch_secs(13)).unwrap();
    assert_eq!(engine.state("db"), Some(CircuitState::Closed));
    for _ in 0..5 {
        assert!(engine.admit("db").unwrap().is_allowed());
    }
}

/// Reads the engine back from inside the transition callback.
struct StatusReadingSink {
    engine: OnceLock<Weak<CircuitBreakerEngine>>,
    seen: mpsc::Sender<CircuitState>,
}

impl TelemetrySink for StatusReadingSink {
    fn breaker_transition(&self, service: &str, _t: &StateTransition) {
        if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
            if let Some(status) = engine.status(service) {
                let _ = self.seen.send(status.state);
            }
        }
    }

    fn tier_transition(&self, _event: &TierTransitionEvent) {}

    fn healing_completed(&self, _record: &HealingAttemptRecord) {}
}

#[test]
fn sink_may_read_breaker_status_during_transition() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let sink = Arc::new(StatusReadingSink {
        engine: OnceLock::new(),
        seen: seen_tx,
    });
    let mut configs = HashMap::new();
    configs.insert("payments".to_string(), config());
    let clock = Arc::new(ManualClock::at_epoch());
    let engine = Arc::new(CircuitBreakerEngine::new(configs, None, 1000, clock, sink.clone()));
    assert!(sink.engine.set(Arc::downgrade(&engine)).is_ok());

    let (done_tx, done_rx) = mpsc::channel();
    let worker = Arc::clone(&engine);
    thread::spawn(move || {
        for t in 1..=3 {
            worker.record_outcome("payments", false, epoch_secs(t)).unwrap();
        }
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("record_outcome must not hold the breaker lock while notifying");
    assert_eq!(seen_rx.recv_timeout(Duration::from_secs(1)), Ok(CircuitState::Open));
}
