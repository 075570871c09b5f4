//! Quality gate types: measurements, evaluations, gaps, decisions and feedback.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Gap severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A shortfall found while scoring an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub id: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    /// A non-retryable gap forces escalation regardless of remaining iterations.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl Gap {
    pub fn new(id: impl Into<String>, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            description: description.into(),
            suggested_fix: None,
            retryable: true,
        }
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Raw dimension readings for one attempt. `None` marks a dimension that is
/// structurally undefined for this attempt (e.g. no coverage data).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(default)]
    pub dimensions: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub gaps: Vec<Gap>,
}

/// Weighted score of one attempt, before a decision is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub iteration: u32,
    /// 0-100.
    pub overall_score: f64,
    /// Scores of the dimensions that took part.
    pub dimensions: BTreeMap<String, f64>,
    /// Effective (re-normalised) weights used for `overall_score`.
    pub weights: BTreeMap<String, f64>,
    /// Configured dimensions left out because they were undefined.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
    pub gaps: Vec<Gap>,
}

impl Scorecard {
    pub fn has_blocking_gap(&self) -> bool {
        self.gaps.iter().any(|g| !g.retryable)
    }
}

/// Quality gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Iterate,
    Escalate,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Iterate => write!(f, "iterate"),
            Decision::Escalate => write!(f, "escalate"),
        }
    }
}

/// Immutable record of one scored iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEvaluation {
    pub iteration: u32,
    pub overall_score: f64,
    pub dimensions: BTreeMap<String, f64>,
    pub weights: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
    pub gaps: Vec<Gap>,
    pub decision: Decision,
}

impl QualityEvaluation {
    pub fn new(card: Scorecard, decision: Decision) -> Self {
        Self {
            iteration: card.iteration,
            overall_score: card.overall_score,
            dimensions: card.dimensions,
            weights: card.weights,
            excluded: card.excluded,
            gaps: card.gaps,
            decision,
        }
    }
}

/// Whether iteration feedback replaces or augments the previous attempt's context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackMode {
    Replace,
    #[default]
    Augment,
}

/// Structured feedback handed to the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Iteration the feedback was produced for.
    pub iteration: u32,
    pub overall_score: f64,
    pub threshold: f64,
    /// Gaps in priority order.
    pub gaps: Vec<Gap>,
}
