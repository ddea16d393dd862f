//! Fault-tolerance coordinator: per-service circuit breakers, load- and
//! failure-driven degradation tiers, and strategy-driven healing.

pub mod audit;
pub mod breaker;
pub mod clock;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod healing;
pub mod serve;
pub mod telemetry;
pub mod tier;

pub use breaker::{Admission, CircuitBreakerConfig, CircuitBreakerEngine, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{Coordinator, RouteDecision};
pub use error::{ConfigError, HealingFailure};
pub use healing::{FailureClassification, HealingExecutor, HealingStrategy};
pub use tier::{DegradationTier, SystemLoadSample, TierController};
