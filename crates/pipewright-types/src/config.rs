//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `pipewright.toml`. Every field has a
//! default so an absent file yields a working single-tenant setup.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quality::FeedbackMode;

/// Tolerance for the dimension-weight sum.
pub const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{scope}': {field} {reason}")]
    Invalid {
        scope: String,
        field: &'static str,
        reason: String,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration: {0}")]
    Io(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    /// Tenant settings used when a tenant has no table of its own.
    #[serde(default)]
    pub defaults: TenantConfig,

    /// Per-tenant overrides; a tenant table replaces the defaults entirely.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,

    /// Work units available to graphs.
    #[serde(default)]
    pub units: Vec<UnitEndpoint>,
}

impl EngineConfig {
    /// Settings for `tenant`, falling back to the defaults.
    pub fn tenant_config(&self, tenant: &str) -> &TenantConfig {
        self.tenants.get(tenant).unwrap_or(&self.defaults)
    }

    /// Validate every tenant table and unit entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.defaults.validate("defaults")?;
        for (name, cfg) in &self.tenants {
            cfg.validate(name)?;
        }
        let mut seen = std::collections::HashSet::new();
        for unit in &self.units {
            if unit.name.trim().is_empty() {
                return Err(invalid("units", "name", "must not be empty"));
            }
            if !seen.insert(unit.name.as_str()) {
                return Err(invalid("units", "name", format!("'{}' is defined twice", unit.name)));
            }
            if unit.kind == UnitKind::Http && unit.url.as_deref().is_none_or(str::is_empty) {
                return Err(invalid(&unit.name, "url", "is required for http units"));
            }
        }
        Ok(())
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineSettings {
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Grace period for in-flight tasks after cancellation, in milliseconds.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Cost charged for a unit attempt that reports no usage of its own.
    #[serde(default = "default_unit_cost")]
    pub default_unit_cost: f64,

    /// Directory holding graph YAML files, relative to the data dir.
    #[serde(default = "default_graphs_dir")]
    pub graphs_dir: String,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_unit_cost() -> f64 {
    1.0
}

fn default_graphs_dir() -> String {
    "graphs".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            cancel_grace_ms: default_cancel_grace_ms(),
            default_unit_cost: default_unit_cost(),
            graphs_dir: default_graphs_dir(),
        }
    }
}

impl EngineSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(invalid("engine", "event_capacity", "must be at least 1"));
        }
        if !(self.default_unit_cost >= 0.0) {
            return Err(invalid("engine", "default_unit_cost", "must be non-negative"));
        }
        Ok(())
    }
}

/// What to do with later waves once a task in a wave has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WaveFailurePolicy {
    /// Keep running every task whose dependencies succeeded.
    #[default]
    Continue,
    /// Fail every task in later waves without running it.
    Halt,
}

/// Retry policy for work-unit calls.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-tenant engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TenantConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Approval threshold on the 0-100 score scale.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,

    /// Must sum to 1.0 (within 1e-6).
    #[serde(default = "default_dimension_weights")]
    pub dimension_weights: BTreeMap<String, f64>,

    /// Initial resource budget for a tenant seen for the first time.
    #[serde(default = "default_resource_budget")]
    pub resource_budget: f64,

    /// Graphs a workflow moves through, in order.
    #[serde(default = "default_graph_sequence")]
    pub graph_sequence: Vec<String>,

    #[serde(default)]
    pub feedback_mode: FeedbackMode,

    #[serde(default)]
    pub on_task_failure: WaveFailurePolicy,

    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    #[serde(default = "default_wave_timeout_secs")]
    pub wave_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_quality_threshold() -> f64 {
    90.0
}

fn default_max_parallel_tasks() -> usize {
    4
}

fn default_dimension_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("completeness".to_string(), 0.7),
        ("consistency".to_string(), 0.3),
    ])
}

fn default_resource_budget() -> f64 {
    1000.0
}

fn default_graph_sequence() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_unit_timeout_secs() -> u64 {
    120
}

fn default_wave_timeout_secs() -> u64 {
    900
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            max_parallel_tasks: default_max_parallel_tasks(),
            dimension_weights: default_dimension_weights(),
            resource_budget: default_resource_budget(),
            graph_sequence: default_graph_sequence(),
            feedback_mode: FeedbackMode::default(),
            on_task_failure: WaveFailurePolicy::default(),
            unit_timeout_secs: default_unit_timeout_secs(),
            wave_timeout_secs: default_wave_timeout_secs(),
            retry: RetrySettings::default(),
        }
    }
}

impl TenantConfig {
    /// Check every bound; `scope` names the table in error messages.
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_iterations < 1 {
            return Err(invalid(scope, "max_iterations", "must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.quality_threshold) {
            return Err(invalid(scope, "quality_threshold", "must be within 0-100"));
        }
        if self.max_parallel_tasks < 1 {
            return Err(invalid(scope, "max_parallel_tasks", "must be at least 1"));
        }
        if self.dimension_weights.is_empty() {
            return Err(invalid(scope, "dimension_weights", "must name at least one dimension"));
        }
        if let Some((name, w)) = self
            .dimension_weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(invalid(
                scope,
                "dimension_weights",
                format!("weight for '{name}' is {w}; weights must be non-negative"),
            ));
        }
        let sum: f64 = self.dimension_weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(invalid(
                scope,
                "dimension_weights",
                format!("sum to {sum}, expected 1.0"),
            ));
        }
        if !(self.resource_budget >= 0.0) {
            return Err(invalid(scope, "resource_budget", "must be non-negative"));
        }
        if self.graph_sequence.is_empty() {
            return Err(invalid(scope, "graph_sequence", "must name at least one graph"));
        }
        if self.unit_timeout_secs == 0 {
            return Err(invalid(scope, "unit_timeout_secs", "must be at least 1"));
        }
        if self.wave_timeout_secs == 0 {
            return Err(invalid(scope, "wave_timeout_secs", "must be at least 1"));
        }
        if self.retry.max_attempts < 1 {
            return Err(invalid(scope, "retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// How a configured work unit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[default]
    Http,
    /// Returns its input unchanged; handy for dry runs.
    Echo,
}

/// A work unit registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UnitEndpoint {
    pub name: String,
    #[serde(default)]
    pub kind: UnitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Overrides the tenant's `unit_timeout_secs` for this unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn invalid(scope: &str, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        scope: scope.to_string(),
        field,
        reason: reason.into(),
    }
}
