//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::tasks::model::TaskPriority;

/// Per-priority bonus added to a worker's fitness score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub urgent: f64,
}

impl PriorityWeights {
    pub fn for_priority(&self, priority: TaskPriority) -> f64 {
        match priority {
            TaskPriority::Low => self.low,
            TaskPriority::Medium => self.medium,
            TaskPriority::High => self.high,
            TaskPriority::Urgent => self.urgent,
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            low: 0.0,
            medium: 0.05,
            high: 0.1,
            urgent: 0.2,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Score penalty per unit of current load.
    pub penalty_weight: f64,
    /// Score bonus per task priority.
    pub priority_weights: PriorityWeights,
    /// Workers sharing no skill with a task are ineligible for it.
    pub require_skill_match: bool,
    /// Best score below this triggers collaboration planning.
    pub collaboration_threshold: f64,
    /// Maximum workflow steps running at once.
    pub max_parallel_steps: usize,
    /// Retries granted to a retryable step before it fails.
    pub step_max_retries: u32,
    /// Deadline for a single step attempt.
    pub step_timeout: Duration,
    /// Capacity of registered workers that do not declare one.
    pub default_worker_capacity: u32,
    /// Load above which a worker is considered overloaded.
    pub high_water_load: u32,
    /// Pending tasks older than this are picked up by the rebalancer.
    pub stale_after: Duration,
    /// Background rebalance interval.
    pub rebalance_interval: Duration,
    /// Events buffered per subscriber before it is dropped.
    pub event_backlog: usize,
    /// Status transitions kept per task.
    pub max_transition_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            penalty_weight: 0.2,
            priority_weights: PriorityWeights::default(),
            require_skill_match: true,
            collaboration_threshold: 0.5,
            max_parallel_steps: 4,
            step_max_retries: 1,
            step_timeout: Duration::from_secs(600), // 10 minutes
            default_worker_capacity: 1,
            high_water_load: 8,
            stale_after: Duration::from_secs(300), // 5 minutes
            rebalance_interval: Duration::from_secs(60),
            event_backlog: 256,
            max_transition_history: 200,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `ORCHESTRATOR_*` environment variables, falling
    /// back to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var::<u64>(&lookup, key)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        let priority_weights = PriorityWeights {
            low: parse_var(&lookup, "ORCHESTRATOR_PRIORITY_WEIGHT_LOW")?
                .unwrap_or(defaults.priority_weights.low),
            medium: parse_var(&lookup, "ORCHESTRATOR_PRIORITY_WEIGHT_MEDIUM")?
                .unwrap_or(defaults.priority_weights.medium),
            high: parse_var(&lookup, "ORCHESTRATOR_PRIORITY_WEIGHT_HIGH")?
                .unwrap_or(defaults.priority_weights.high),
            urgent: parse_var(&lookup, "ORCHESTRATOR_PRIORITY_WEIGHT_URGENT")?
                .unwrap_or(defaults.priority_weights.urgent),
        };

        let config = Self {
            penalty_weight: parse_var(&lookup, "ORCHESTRATOR_PENALTY_WEIGHT")?
                .unwrap_or(defaults.penalty_weight),
            priority_weights,
            require_skill_match: parse_var(&lookup, "ORCHESTRATOR_REQUIRE_SKILL_MATCH")?
                .unwrap_or(defaults.require_skill_match),
            collaboration_threshold: parse_var(&lookup, "ORCHESTRATOR_COLLABORATION_THRESHOLD")?
                .unwrap_or(defaults.collaboration_threshold),
            max_parallel_steps: parse_var(&lookup, "ORCHESTRATOR_MAX_PARALLEL_STEPS")?
                .unwrap_or(defaults.max_parallel_steps),
            step_max_retries: parse_var(&lookup, "ORCHESTRATOR_STEP_MAX_RETRIES")?
                .unwrap_or(defaults.step_max_retries),
            step_timeout: secs("ORCHESTRATOR_STEP_TIMEOUT_SECS", defaults.step_timeout)?,
            default_worker_capacity: parse_var(&lookup, "ORCHESTRATOR_DEFAULT_WORKER_CAPACITY")?
                .unwrap_or(defaults.default_worker_capacity),
            high_water_load: parse_var(&lookup, "ORCHESTRATOR_HIGH_WATER_LOAD")?
                .unwrap_or(defaults.high_water_load),
            stale_after: secs("ORCHESTRATOR_STALE_AFTER_SECS", defaults.stale_after)?,
            rebalance_interval: secs(
                "ORCHESTRATOR_REBALANCE_INTERVAL_SECS",
                defaults.rebalance_interval,
            )?,
            event_backlog: parse_var(&lookup, "ORCHESTRATOR_EVENT_BACKLOG")?
                .unwrap_or(defaults.event_backlog),
            max_transition_history: defaults.max_transition_history,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_parallel_steps".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.event_backlog == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_backlog".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.default_worker_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "default_worker_capacity".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.rebalance_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "rebalance_interval".into(),
                message: "must be non-zero".into(),
            });
        }
        if !self.penalty_weight.is_finite() || self.penalty_weight < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "penalty_weight".into(),
                message: format!("must be a non-negative number, got {}", self.penalty_weight),
            });
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.penalty_weight, 0.2);
        assert_eq!(config.step_max_retries, 1);
        assert_eq!(config.default_worker_capacity, 1);
        assert!(config.priority_weights.urgent > config.priority_weights.low);
    }

    #[test]
    fn overrides_from_vars() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("ORCHESTRATOR_PENALTY_WEIGHT", "0.5"),
            ("ORCHESTRATOR_HIGH_WATER_LOAD", "3"),
            ("ORCHESTRATOR_STEP_TIMEOUT_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.penalty_weight, 0.5);
        assert_eq!(config.high_water_load, 3);
        assert_eq!(config.step_timeout, Duration::from_secs(2));
    }

    #[test]
    fn bad_value_is_config_error() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "ORCHESTRATOR_MAX_PARALLEL_STEPS",
            "many",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORCHESTRATOR_MAX_PARALLEL_STEPS"));
    }

    #[test]
    fn zero_parallelism_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "ORCHESTRATOR_MAX_PARALLEL_STEPS",
            "0",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
