//! Error taxonomy.
//!
//! Only [`ConfigError`] is ever fatal. Healing-path failures are values
//! stored inside the attempt record; the admission path returns enums.

use serde::Serialize;

/// Invalid or missing configuration. Rejected at load time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("service {service}: {field} must be greater than zero")]
    ZeroValue { service: String, field: &'static str },

    #[error("no circuit breaker config for service {0} and no defaults configured")]
    MissingBreakerConfig(String),

    #[error("at least one degradation tier must be configured")]
    NoTiers,

    #[error("tier rank {0} is used by more than one tier")]
    DuplicateTierRank(u32),

    #[error("tier {tier} references unconfigured service {service}")]
    UnknownTierService { tier: String, service: String },

    #[error("tier {tier}: {field} must lie in [0, 1], got {value}")]
    OutOfUnitRange {
        tier: String,
        field: &'static str,
        value: f64,
    },

    #[error("tier {tier}: ux score must be positive, got {value}")]
    NonPositiveUxScore { tier: String, value: f64 },

    #[error("strategy {kind}: {field} must be greater than zero")]
    ZeroStrategyValue { kind: String, field: &'static str },

    #[error("strategy {kind} references unknown {what} {id}")]
    UnknownStrategyStep {
        kind: String,
        what: &'static str,
        id: String,
    },

    #[error("command {0}: timeout must be greater than zero")]
    ZeroCommandTimeout(String),

    #[error("invalid duration {0:?}; use seconds or a value like 500ms, 10s, 5m, 1h")]
    InvalidDuration(String),

    #[error("{field} must be greater than zero")]
    ZeroSetting { field: &'static str },
}

/// A remediation action could not be carried out.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("no remediation action registered as {0}")]
    Unknown(String),
    #[error("action {action} failed to start: {reason}")]
    Spawn { action: String, reason: String },
    #[error("action {action} timed out after {timeout_ms}ms")]
    TimedOut { action: String, timeout_ms: u64 },
}

/// The health criterion evaluator itself failed, as opposed to reporting "unhealthy".
#[derive(Debug, Clone, thiserror::Error)]
pub enum CriterionError {
    #[error("no health criterion registered as {0}")]
    Unknown(String),
    #[error("criterion {criterion} could not be evaluated: {reason}")]
    Evaluation { criterion: String, reason: String },
    #[error("criterion {criterion} timed out after {timeout_ms}ms")]
    TimedOut { criterion: String, timeout_ms: u64 },
}

/// Why a healing attempt ended `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum HealingFailure {
    #[error("no healing strategy for failure kind {kind}")]
    UnknownFailureKind { kind: String },

    #[error("remediation action {action} failed: {reason}")]
    RemediationActionError { action: String, reason: String },

    #[error("recovery exceeded {budget_ms}ms budget after {elapsed_ms}ms")]
    RecoveryTimeoutExceeded { budget_ms: u64, elapsed_ms: u64 },

    #[error("success criteria not met: {failed:?}")]
    CriteriaNotMet { failed: Vec<String> },
}

/// Audit store failures. Logged and dropped on the telemetry path.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit db directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit db: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("audit encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures that stop the host binary from starting.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}
