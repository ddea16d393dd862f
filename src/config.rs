use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::{CircuitBreakerConfig, ServiceIdentity, DEFAULT_HISTORY_CAP};
use crate::command::CommandSpec;
use crate::error::ConfigError;
use crate::healing::HealingStrategy;
use crate::tier::{DegradationTier, PerformanceTarget, UxQuality};

/// Coordinator configuration. Loaded once at startup, immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Breaker config for services referenced at runtime but not listed below.
    #[serde(default)]
    pub defaults: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub services: BTreeMap<ServiceIdentity, CircuitBreakerConfig>,
    pub tiers: Vec<DegradationTier>,
    #[serde(default)]
    pub strategies: BTreeMap<String, HealingStrategy>,
    /// Minimum time in a tier before an upward transition is honoured.
    #[serde(default = "default_tier_dwell", with = "duration")]
    pub tier_dwell: Duration,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default)]
    pub healing: HealingSettings,
    /// Remediation actions backed by shell commands.
    #[serde(default)]
    pub actions: BTreeMap<String, CommandSpec>,
    /// Health criteria backed by shell commands (exit 0 = pass).
    #[serde(default)]
    pub criteria: BTreeMap<String, CommandSpec>,
    #[serde(default)]
    pub audit_db: Option<String>,
    /// Audit rows older than this are pruned by the writer.
    #[serde(default = "default_audit_retention", with = "duration")]
    pub audit_retention: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealingSettings {
    /// How long completed attempt records stay queryable.
    #[serde(default = "default_retention", with = "duration")]
    pub retention: Duration,
    /// Pause between consecutive remediation actions.
    #[serde(default, with = "duration")]
    pub action_pause: Duration,
}

impl Default for HealingSettings {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            action_pause: Duration::ZERO,
        }
    }
}

fn default_tier_dwell() -> Duration {
    Duration::from_secs(30)
}

fn default_history_cap() -> usize {
    DEFAULT_HISTORY_CAP
}

fn default_audit_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_retention() -> Duration {
    Duration::from_secs(3600)
}

impl Default for Config {
    /// One unrestricted tier and lazily-defaulted breakers.
    fn default() -> Self {
        Self {
            defaults: Some(CircuitBreakerConfig::default()),
            services: BTreeMap::new(),
            tiers: vec![DegradationTier {
                id: "full".to_string(),
                rank: 1,
                services: BTreeMap::new(),
                target: PerformanceTarget {
                    max_response_time: Duration::from_secs(1),
                    min_availability: 0.99,
                    max_load: 1.0,
                },
                ux: UxQuality::Optimal,
                ux_score: None,
            }],
            strategies: BTreeMap::new(),
            tier_dwell: default_tier_dwell(),
            history_cap: DEFAULT_HISTORY_CAP,
            healing: HealingSettings::default(),
            actions: BTreeMap::new(),
            criteria: BTreeMap::new(),
            audit_db: None,
            audit_retention: default_audit_retention(),
        }
    }
}

impl Config {
    /// Load config from a YAML file, apply env overrides, then validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg = Self::parse(&content)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate YAML without consulting the environment.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg = Self::parse(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Default config location (~/.config/fault-coordinator/config.yaml).
    pub fn default_path() -> String {
        expand_tilde("~/.config/fault-coordinator/config.yaml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FAULT_COORDINATOR_AUDIT_DB") {
            self.audit_db = Some(expand_tilde(&v));
        }
        if let Ok(v) = std::env::var("FAULT_COORDINATOR_HISTORY_CAP") {
            match v.parse() {
                Ok(n) => self.history_cap = n,
                Err(_) => tracing::warn!(value = %v, "ignoring FAULT_COORDINATOR_HISTORY_CAP"),
            }
        }
        if let Ok(v) = std::env::var("FAULT_COORDINATOR_TIER_DWELL") {
            match parse_duration(&v) {
                Ok(d) => self.tier_dwell = d,
                Err(_) => tracing::warn!(value = %v, "ignoring FAULT_COORDINATOR_TIER_DWELL"),
            }
        }
        if let Some(path) = self.audit_db.take() {
            self.audit_db = Some(expand_tilde(&path));
        }
    }

    /// Reject malformed configuration before anything runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_cap == 0 {
            return Err(ConfigError::ZeroSetting {
                field: "history_cap",
            });
        }
        if self.audit_retention.is_zero() {
            return Err(ConfigError::ZeroSetting {
                field: "audit_retention",
            });
        }
        if let Some(defaults) = &self.defaults {
            defaults.validate("<defaults>")?;
        }
        for (service, cfg) in &self.services {
            cfg.validate(service)?;
        }

        if self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        let mut ranks = std::collections::BTreeSet::new();
        for tier in &self.tiers {
            if !ranks.insert(tier.rank) {
                return Err(ConfigError::DuplicateTierRank(tier.rank));
            }
            tier.validate(|s| self.services.contains_key(s))?;
        }

        for (kind, strategy) in &self.strategies {
            strategy.validate(kind)?;
        }
        Ok(())
    }

    /// Every action and criterion named by a strategy must have a command.
    /// Only required when the command-backed collaborators are in use.
    pub fn validate_command_tables(&self) -> Result<(), ConfigError> {
        for (kind, strategy) in &self.strategies {
            for action in &strategy.actions {
                if !self.actions.contains_key(action) {
                    return Err(ConfigError::UnknownStrategyStep {
                        kind: kind.clone(),
                        what: "action",
                        id: action.clone(),
                    });
                }
            }
            for criterion in &strategy.success_criteria {
                if !self.criteria.contains_key(criterion) {
                    return Err(ConfigError::UnknownStrategyStep {
                        kind: kind.clone(),
                        what: "criterion",
                        id: criterion.clone(),
                    });
                }
            }
        }
        for (name, spec) in self.actions.iter().chain(self.criteria.iter()) {
            if spec.timeout.is_zero() {
                return Err(ConfigError::ZeroCommandTimeout(name.clone()));
            }
        }
        Ok(())
    }
}

/// Parse `250ms`, `10s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let s = raw.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => scaled(n, 60, raw),
        "h" => scaled(n, 3600, raw),
        _ => Err(ConfigError::InvalidDuration(raw.to_string())),
    }
}

fn scaled(n: u64, unit_secs: u64, raw: &str) -> Result<Duration, ConfigError> {
    n.checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))
}

/// Serde adapter: durations as integer seconds or suffixed strings.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() == 0 {
            s.serialize_str(&format!("{}s", d.as_secs()))
        } else {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        }
    }
}

/// Expand ~ to home directory.
pub fn expand_tilde(path: &str) -> String {
    if path.starts_with("~/") || path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
