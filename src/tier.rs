//! Degradation tier controller.
//!
//! Tiers are ranked 1..N, 1 being the fullest capability set. On every load
//! sample or breaker change the controller picks the fullest tier that can
//! carry the load and does not depend on an open circuit. Downgrades apply
//! immediately; upgrades wait until the current tier has been held for the
//! configured dwell time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::breaker::ServiceIdentity;
use crate::clock::{self, Clock};
use crate::error::ConfigError;
use crate::telemetry::TelemetrySink;

/// Ordinal user-experience descriptor of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UxQuality {
    Minimal,
    Acceptable,
    Good,
    Optimal,
}

impl UxQuality {
    pub fn default_score(&self) -> f64 {
        match self {
            UxQuality::Minimal => 1.0,
            UxQuality::Acceptable => 2.0,
            UxQuality::Good => 3.0,
            UxQuality::Optimal => 4.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UxQuality::Minimal => "minimal",
            UxQuality::Acceptable => "acceptable",
            UxQuality::Good => "good",
            UxQuality::Optimal => "optimal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceTarget {
    #[serde(with = "crate::config::duration")]
    pub max_response_time: Duration,
    pub min_availability: f64,
    /// Highest observed load at which this tier still meets its targets.
    #[serde(default = "full_load")]
    pub max_load: f64,
}

fn full_load() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DegradationTier {
    pub id: String,
    /// 1 = fullest capability.
    pub rank: u32,
    /// capability -> service backing it in this tier.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceIdentity>,
    pub target: PerformanceTarget,
    pub ux: UxQuality,
    /// Overrides the default ordinal score of `ux`.
    #[serde(default)]
    pub ux_score: Option<f64>,
}

impl DegradationTier {
    pub fn ux_score(&self) -> f64 {
        self.ux_score.unwrap_or_else(|| self.ux.default_score())
    }

    pub fn load_compatible(&self, load: f64) -> bool {
        load <= self.target.max_load
    }

    /// Does this tier route to any of `services`?
    pub fn uses_any(&self, services: &BTreeSet<ServiceIdentity>) -> bool {
        self.services.values().any(|s| services.contains(s))
    }

    pub fn service_for(&self, capability: &str) -> Option<&ServiceIdentity> {
        self.services.get(capability)
    }

    pub(crate) fn validate(&self, is_known: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        for service in self.services.values() {
            if !is_known(service) {
                return Err(ConfigError::UnknownTierService {
                    tier: self.id.clone(),
                    service: service.clone(),
                });
            }
        }
        let unit = |field, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::OutOfUnitRange {
                    tier: self.id.clone(),
                    field,
                    value,
                })
            }
        };
        unit("min_availability", self.target.min_availability)?;
        unit("max_load", self.target.max_load)?;
        let score = self.ux_score();
        if !(score > 0.0) {
            return Err(ConfigError::NonPositiveUxScore {
                tier: self.id.clone(),
                value: score,
            });
        }
        Ok(())
    }
}

/// Load reading from the external monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemLoadSample {
    pub observed_load: f64,
    pub at: DateTime<Utc>,
}

impl SystemLoadSample {
    pub fn new(observed_load: f64, at: DateTime<Utc>) -> Self {
        Self { observed_load, at }
    }

    /// Load clamped to [0, 1]. NaN counts as fully loaded.
    pub fn load(&self) -> f64 {
        if self.observed_load.is_nan() {
            1.0
        } else {
            self.observed_load.clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionCause {
    LoadIncrease,
    LoadDecrease,
    CircuitOpen,
    CircuitRecovered,
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionCause::LoadIncrease => "load-increase",
            TransitionCause::LoadDecrease => "load-decrease",
            TransitionCause::CircuitOpen => "circuit-open",
            TransitionCause::CircuitRecovered => "circuit-recovered",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierTransitionEvent {
    pub from_tier: String,
    pub to_tier: String,
    pub from_rank: u32,
    pub to_rank: u32,
    pub cause: TransitionCause,
    /// Signed percentage; positive = degradation.
    pub ux_impact: f64,
    pub at: DateTime<Utc>,
}

/// `(score(from) - score(to)) / score(from)` as a percentage.
pub fn ux_impact(from: &DegradationTier, to: &DegradationTier) -> f64 {
    let base = from.ux_score();
    (base - to.ux_score()) / base * 100.0
}

/// Index of the fullest tier that carries `load` without touching `open`.
/// Falls back to the last (least capable) tier. `tiers` must be rank-sorted.
pub fn choose_tier(
    tiers: &[Arc<DegradationTier>],
    load: f64,
    open: &BTreeSet<ServiceIdentity>,
) -> usize {
    tiers
        .iter()
        .position(|t| t.load_compatible(load) && !t.uses_any(open))
        .unwrap_or(tiers.len().saturating_sub(1))
}

struct Selection {
    index: usize,
    entered_at: DateTime<Utc>,
    /// Last selection sat below what load alone allowed because of open circuits.
    held_by_circuits: bool,
    last_sample: Option<SystemLoadSample>,
}

pub struct TierController {
    tiers: Vec<Arc<DegradationTier>>,
    dwell: Duration,
    selection: Mutex<Selection>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl TierController {
    pub fn new(
        tiers: Vec<DegradationTier>,
        dwell: Duration,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        let mut tiers: Vec<Arc<DegradationTier>> = tiers.into_iter().map(Arc::new).collect();
        // Fullest first; equal ranks prefer more active capabilities.
        tiers.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| b.services.len().cmp(&a.services.len()))
        });
        let selection = Mutex::new(Selection {
            index: 0,
            entered_at: clock.now(),
            held_by_circuits: false,
            last_sample: None,
        });
        Ok(Self {
            tiers,
            dwell,
            selection,
            clock,
            sink,
        })
    }

    pub fn tiers(&self) -> &[Arc<DegradationTier>] {
        &self.tiers
    }

    /// The tier load alone would select, ignoring circuits and hysteresis.
    pub fn tier_of(&self, load: f64) -> Arc<DegradationTier> {
        let sample = SystemLoadSample::new(load, DateTime::<Utc>::UNIX_EPOCH);
        let idx = choose_tier(&self.tiers, sample.load(), &BTreeSet::new());
        Arc::clone(&self.tiers[idx])
    }

    pub fn current(&self) -> Arc<DegradationTier> {
        Arc::clone(&self.tiers[self.selection.lock().index])
    }

    pub fn last_sample(&self) -> Option<SystemLoadSample> {
        self.selection.lock().last_sample
    }

    /// Service the current tier routes `capability` to.
    pub fn route(&self, capability: &str) -> Option<ServiceIdentity> {
        self.current().service_for(capability).cloned()
    }

    /// Recompute the serving tier for a new sample and open-circuit snapshot.
    pub fn select_tier(
        &self,
        sample: SystemLoadSample,
        open: &BTreeSet<ServiceIdentity>,
    ) -> Arc<DegradationTier> {
        let load = sample.load();
        let load_only = choose_tier(&self.tiers, load, &BTreeSet::new());
        let target = choose_tier(&self.tiers, load, open);
        let held = target > load_only;
        let now = self.clock.now();

        let mut sel = self.selection.lock();
        sel.last_sample = Some(sample);
        let current = sel.index;

        if target == current {
            sel.held_by_circuits = held;
            return Arc::clone(&self.tiers[current]);
        }

        // Dwell only holds back upgrades out of a tier that can still serve.
        let current_usable =
            self.tiers[current].load_compatible(load) && !self.tiers[current].uses_any(open);
        if target < current && current_usable && clock::elapsed(sel.entered_at, now) < self.dwell {
            tracing::debug!(
                current = %self.tiers[current].id,
                candidate = %self.tiers[target].id,
                "tier upgrade deferred by dwell time"
            );
            return Arc::clone(&self.tiers[current]);
        }

        let cause = match (target > current, held, sel.held_by_circuits) {
            (true, true, _) => TransitionCause::CircuitOpen,
            (true, false, _) => TransitionCause::LoadIncrease,
            (false, _, true) => TransitionCause::CircuitRecovered,
            (false, _, false) => TransitionCause::LoadDecrease,
        };
        let from = &self.tiers[current];
        let to = &self.tiers[target];
        let event = TierTransitionEvent {
            from_tier: from.id.clone(),
            to_tier: to.id.clone(),
            from_rank: from.rank,
            to_rank: to.rank,
            cause,
            ux_impact: ux_impact(from, to),
            at: now,
        };

        sel.index = target;
        sel.entered_at = now;
        sel.held_by_circuits = held;
        drop(sel);
        self.sink.tier_transition(&event);
        Arc::clone(to)
    }

    /// Re-run selection with the last known load, e.g. after a breaker change.
    pub fn reselect(&self, open: &BTreeSet<ServiceIdentity>) -> Arc<DegradationTier> {
        let sample = self
            .last_sample()
            .unwrap_or_else(|| SystemLoadSample::new(0.0, self.clock.now()));
        self.select_tier(sample, open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::RecordingSink;

    fn tier(id: &str, rank: u32, max_load: f64, ux: UxQuality, services: &[(&str, &str)]) -> DegradationTier {
        DegradationTier {
            id: id.to_string(),
            rank,
            services: services
                .iter()
                .map(|(c, s)| (c.to_string(), s.to_string()))
                .collect(),
            target: PerformanceTarget {
                max_response_time: Duration::from_millis(200),
                min_availability: 0.99,
                max_load,
            },
            ux,
            ux_score: None,
        }
    }

    fn tiers() -> Vec<DegradationTier> {
        vec![
            tier("minimal", 3, 1.0, UxQuality::Minimal, &[("search", "search-static")]),
            tier("full", 1, 0.6, UxQuality::Optimal, &[("search", "search-ml"), ("recs", "recs-ml")]),
            tier("reduced", 2, 0.85, UxQuality::Good, &[("search", "search-basic")]),
        ]
    }

    fn controller(dwell: Duration) -> (TierController, Arc<ManualClock>, Arc<RecordingSink>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let sink = Arc::new(RecordingSink::new());
        let ctl = TierController::new(tiers(), dwell, clock.clone(), sink.clone()).unwrap();
        (ctl, clock, sink)
    }

    fn sample(load: f64, clock: &ManualClock) -> SystemLoadSample {
        SystemLoadSample::new(load, clock.now())
    }

    fn open(services: &[&str]) -> BTreeSet<ServiceIdentity> {
        services.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tiers_sorted_fullest_first() {
        let (ctl, _, _) = controller(Duration::ZERO);
        let ids: Vec<_> = ctl.tiers().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["full", "reduced", "minimal"]);
        assert_eq!(ctl.current().id, "full");
    }

    #[test]
    fn tier_of_follows_load() {
        let (ctl, _, _) = controller(Duration::ZERO);
        assert_eq!(ctl.tier_of(0.2).id, "full");
        assert_eq!(ctl.tier_of(0.6).id, "full");
        assert_eq!(ctl.tier_of(0.7).id, "reduced");
        assert_eq!(ctl.tier_of(0.95).id, "minimal");
        assert_eq!(ctl.tier_of(f64::NAN).id, "minimal");
    }

    #[test]
    fn open_circuit_excludes_tier() {
        let (ctl, clock, sink) = controller(Duration::ZERO);
        let t = ctl.select_tier(sample(0.1, &clock), &open(&["recs-ml"]));
        assert_eq!(t.id, "reduced");
        let events = sink.tier_transitions();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cause, TransitionCause::CircuitOpen);
        assert_eq!(events[0].ux_impact, 25.0);
    }

    #[test]
    fn falls_back_to_lowest_tier() {
        let (ctl, clock, _) = controller(Duration::ZERO);
        let t = ctl.select_tier(
            sample(0.1, &clock),
            &open(&["search-ml", "search-basic", "search-static"]),
        );
        assert_eq!(t.id, "minimal");
    }

    #[test]
    fn downgrade_immediate_upgrade_waits_for_dwell() {
        let (ctl, clock, sink) = controller(Duration::from_secs(30));
        assert_eq!(ctl.select_tier(sample(0.9, &clock), &open(&[])).id, "minimal");

        clock.advance(Duration::from_secs(10));
        assert_eq!(ctl.select_tier(sample(0.1, &clock), &open(&[])).id, "minimal");

        clock.advance(Duration::from_secs(20));
        assert_eq!(ctl.select_tier(sample(0.1, &clock), &open(&[])).id, "full");

        let events = sink.tier_transitions();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].cause, TransitionCause::LoadIncrease);
        assert_eq!(events[0].ux_impact, 75.0);
        assert_eq!(events[1].cause, TransitionCause::LoadDecrease);
        assert_eq!(events[1].ux_impact, -300.0);
    }

    #[test]
    fn recovery_cause_after_circuit_closes() {
        let (ctl, clock, sink) = controller(Duration::ZERO);
        ctl.select_tier(sample(0.1, &clock), &open(&["search-ml"]));
        ctl.select_tier(sample(0.1, &clock), &open(&[]));
        let causes: Vec<_> = sink.tier_transitions().iter().map(|e| e.cause).collect();
        assert_eq!(
            causes,
            [TransitionCause::CircuitOpen, TransitionCause::CircuitRecovered]
        );
    }

    #[test]
    fn no_event_without_change() {
        let (ctl, clock, sink) = controller(Duration::ZERO);
        ctl.select_tier(sample(0.1, &clock), &open(&[]));
        ctl.select_tier(sample(0.3, &clock), &open(&[]));
        assert!(sink.tier_transitions().is_empty());
    }

    #[test]
    fn reselect_reuses_last_sample() {
        let (ctl, clock, _) = controller(Duration::ZERO);
        ctl.select_tier(sample(0.7, &clock), &open(&[]));
        assert_eq!(ctl.reselect(&open(&["search-basic"])).id, "minimal");
        assert_eq!(ctl.route("search").as_deref(), Some("search-static"));
        assert_eq!(ctl.route("recs"), None);
    }

    #[test]
    fn validate_rejects_unknown_service_and_bad_ranges() {
        let t = tier("full", 1, 0.6, UxQuality::Optimal, &[("search", "ghost")]);
        assert!(matches!(
            t.validate(|_| false),
            Err(ConfigError::UnknownTierService { .. })
        ));
        let t = tier("full", 1, 1.5, UxQuality::Optimal, &[]);
        assert!(matches!(
            t.validate(|_| true),
            Err(ConfigError::OutOfUnitRange { field: "max_load", .. })
        ));
        let mut t = tier("full", 1, 0.5, UxQuality::Optimal, &[]);
        t.ux_score = Some(0.0);
        assert!(matches!(
            t.validate(|_| true),
            Err(ConfigError::NonPositiveUxScore { .. })
        ));
    }
}
