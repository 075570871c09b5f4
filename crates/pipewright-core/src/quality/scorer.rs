//! Weighted scoring of a measurement.

use std::collections::BTreeMap;

use pipewright_types::quality::{Gap, Measurement, Scorecard, Severity};

/// Gap added when no weighted dimension could be measured.
pub const UNSCORABLE_GAP: &str = "quality.unscorable";

/// Scores measurements against a tenant's dimension weights.
#[derive(Debug, Clone)]
pub struct QualityScorer {
    weights: BTreeMap<String, f64>,
}

impl QualityScorer {
    /// Weights are divided by their sum.
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        let total: f64 = weights.values().sum();
        let weights = if total > 0.0 && total.is_finite() {
            weights.into_iter().map(|(name, w)| (name, w / total)).collect()
        } else {
            weights
        };
        Self { weights }
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    /// Weighted overall score of one attempt.
    ///
    /// Weighted dimensions that are missing or undefined are excluded and the
    /// remaining weights are divided by their sum. Dimensions that carry no
    /// weight are ignored.
    pub fn score(&self, iteration: u32, measurement: &Measurement) -> Scorecard {
        let mut dimensions = BTreeMap::new();
        let mut excluded = Vec::new();

        for name in self.weights.keys() {
            match measurement.dimensions.get(name).copied().flatten() {
                Some(raw) if raw.is_finite() => {
                    let clamped = raw.clamp(0.0, 100.0);
                    if clamped != raw {
                        tracing::warn!(dimension = %name, raw, clamped, "dimension score out of range, clamped");
                    }
                    dimensions.insert(name.clone(), clamped);
                }
                _ => excluded.push(name.clone()),
            }
        }

        let mut gaps = measurement.gaps.clone();
        let defined_weight: f64 = dimensions.keys().map(|name| self.weights[name]).sum();

        if dimensions.is_empty() || defined_weight <= 0.0 {
            tracing::warn!(iteration, excluded = ?excluded, "no weighted dimension could be scored");
            gaps.push(
                Gap::new(UNSCORABLE_GAP, Severity::Critical, "no weighted quality dimension could be measured")
                    .non_retryable(),
            );
            return Scorecard {
                iteration,
                overall_score: 0.0,
                dimensions,
                weights: BTreeMap::new(),
                excluded,
                gaps,
            };
        }

        let weights: BTreeMap<String, f64> = if excluded.is_empty() {
            dimensions.keys().map(|name| (name.clone(), self.weights[name])).collect()
        } else {
            let renormalized: BTreeMap<String, f64> = dimensions
                .keys()
                .map(|name| (name.clone(), self.weights[name] / defined_weight))
                .collect();
            tracing::warn!(
                iteration,
                excluded = ?excluded,
                weights = ?renormalized,
                "undefined dimensions excluded, weights renormalised"
            );
            renormalized
        };

        let overall_score = weights
            .iter()
            .map(|(name, weight)| weight * dimensions[name])
            .sum::<f64>();

        Scorecard {
            iteration,
            overall_score,
            dimensions,
            weights,
            excluded,
            gaps,
        }
    }
}
