//! Weighted aggregation of per-dimension scores.
//!
//! The final score is a convex combination of the per-dimension scores using
//! the configured weights, renormalised over the dimensions that actually
//! produced a usable number. Errored dimensions appear in the score map with
//! 0 but are excluded from the weight denominator, so a single failing worker
//! does not drag the final score down for the dimensions that did report.

use std::collections::BTreeMap;

use crate::config::DimensionWeights;
use crate::dimension::Dimension;
use crate::task::DimensionResult;

/// Outcome of aggregating one task's five dimension results.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    /// Per-dimension scores; errored dimensions carry 0.
    pub scores: BTreeMap<Dimension, f64>,
    /// Weighted final score in [0, 1]; 0 when no dimension scored.
    pub final_score: f64,
    /// One message per dimension that failed to produce a usable score.
    pub errors: Vec<String>,
    /// Number of dimensions that contributed to the final score.
    pub scored_dimensions: usize,
}

impl AggregateOutcome {
    /// True when no dimension produced a usable score. Completeness of the
    /// partial-result hash alone does not imply success: a task in this state
    /// ends in `failed`, not `completed`.
    pub fn all_errored(&self) -> bool {
        self.scored_dimensions == 0
    }
}

/// Aggregates the collected results for one task.
///
/// Every dimension is accounted for: a missing entry, a worker-reported
/// error, or an out-of-range/NaN score all count as an errored dimension with
/// score 0 and an entry in `errors`.
pub fn aggregate(
    results: &BTreeMap<Dimension, DimensionResult>,
    weights: &DimensionWeights,
) -> AggregateOutcome {
    let mut scores = BTreeMap::new();
    let mut errors = Vec::new();
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut scored = 0;

    for dimension in Dimension::ALL {
        match results.get(&dimension) {
            None => {
                scores.insert(dimension, 0.0);
                errors.push(format!("{}: no result recorded", dimension));
            }
            Some(result) => {
                if let Some(message) = &result.error {
                    scores.insert(dimension, 0.0);
                    errors.push(format!("{}: {}", dimension, message));
                } else if !result.has_valid_score() {
                    scores.insert(dimension, 0.0);
                    errors.push(format!(
                        "{}: invalid score {} (expected a number in [0, 1])",
                        dimension, result.score
                    ));
                } else {
                    let weight = weights.weight(dimension);
                    scores.insert(dimension, result.score);
                    numerator += weight * result.score;
                    denominator += weight;
                    scored += 1;
                }
            }
        }
    }

    let final_score = if denominator > 0.0 {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        0.0
    };

    AggregateOutcome {
        scores,
        final_score,
        errors,
        scored_dimensions: scored,
    }
}
