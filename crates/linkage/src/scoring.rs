//! Fellegi-Sunter scoring in log2 space.

use rayon::prelude::*;

use crate::comparison::ComparisonLevel;
use crate::error::LinkError;
use crate::model::{ComparisonVector, ScoredPair};
use crate::state::ModelState;

pub fn prob_to_bayes_factor(p: f64) -> f64 {
    p / (1.0 - p)
}

pub fn bayes_factor_to_prob(bf: f64) -> f64 {
    bf / (1.0 + bf)
}

/// Probability from a log2 bayes factor without overflowing `2^w`.
pub fn match_weight_to_prob(weight: f64) -> f64 {
    if weight >= 0.0 {
        1.0 / (1.0 + (-weight).exp2())
    } else {
        let bf = weight.exp2();
        bf / (1.0 + bf)
    }
}

/// Log2 of the term-frequency adjustment for one level and pair frequency.
fn tf_log2_adjustment(level: &ComparisonLevel, frequency: f64) -> Option<f64> {
    level.tf_adjustment_column.as_ref()?;
    let u = level.u_probability?;
    let adjusted = frequency.max(level.tf_minimum_u_value);
    if adjusted <= 0.0 {
        return None;
    }
    Some(level.tf_adjustment_weight * (u / adjusted).log2())
}

/// Per-level log2 bayes factors of one model, computed once and reused for
/// every pair. Degenerate levels only fail when a pair lands on them.
#[derive(Debug, Clone)]
pub struct WeightTable {
    prior: Result<f64, LinkError>,
    levels: Vec<Vec<Result<f64, LinkError>>>,
}

impl WeightTable {
    pub fn new(model: &ModelState) -> Self {
        let bf = prob_to_bayes_factor(model.probability_two_random_records_match);
        let prior = if bf.is_finite() && bf > 0.0 {
            Ok(bf.log2())
        } else {
            Err(LinkError::DegenerateParameter(format!(
                "probability_two_random_records_match {} gives bayes factor {bf}",
                model.probability_two_random_records_match
            )))
        };
        let levels = model
            .comparisons
            .iter()
            .map(|c| c.levels.iter().map(|l| l.bayes_factor().map(f64::log2)).collect())
            .collect();
        Self { prior, levels }
    }

    /// Give one level a bayes factor of 1.
    pub fn neutralize(&mut self, comparison: usize, level: usize) {
        if let Some(weight) = self.levels.get_mut(comparison).and_then(|c| c.get_mut(level)) {
            *weight = Ok(0.0);
        }
    }

    /// Log2 of the joint bayes factor. `active` masks out comparisons (EM
    /// deactivation). Term-frequency adjustments apply only when `with_tf`.
    pub fn match_weight(
        &self,
        vector: &ComparisonVector,
        model: &ModelState,
        active: Option<&[bool]>,
        with_tf: bool,
    ) -> Result<f64, LinkError> {
        if vector.levels.len() != self.levels.len() {
            return Err(LinkError::Configuration(format!(
                "comparison vector has {} levels, model has {} comparisons",
                vector.levels.len(),
                self.levels.len()
            )));
        }
        let mut weight = self.prior.clone()?;
        for (c, &level) in vector.levels.iter().enumerate() {
            if active.is_some_and(|mask| !mask[c]) {
                continue;
            }
            let Some(level_weight) = self.levels[c].get(level) else {
                return Err(LinkError::Configuration(format!(
                    "level {level} out of range for comparison '{}'",
                    model.comparisons[c].name
                )));
            };
            weight += level_weight.clone()?;
            if with_tf {
                if let Some(frequency) = vector.tf_frequencies.get(c).copied().flatten() {
                    let comparison_level = &model.comparisons[c].levels[level];
                    weight += tf_log2_adjustment(comparison_level, frequency).unwrap_or(0.0);
                }
            }
        }
        if weight.is_nan() {
            return Err(LinkError::DegenerateParameter(format!(
                "match weight for pair ({}, {}) is not a number",
                vector.pair.left, vector.pair.right
            )));
        }
        Ok(weight)
    }
}

pub fn score_vector(
    table: &WeightTable,
    vector: &ComparisonVector,
    model: &ModelState,
) -> Result<ScoredPair, LinkError> {
    let match_weight = table.match_weight(vector, model, None, true)?;
    Ok(ScoredPair {
        pair: vector.pair,
        levels: vector.levels.clone(),
        match_weight,
        match_probability: match_weight_to_prob(match_weight),
    })
}

/// Score every vector against the model, in input order.
pub fn score(vectors: &[ComparisonVector], model: &ModelState) -> Result<Vec<ScoredPair>, LinkError> {
    let table = WeightTable::new(model);
    vectors
        .par_iter()
        .map(|v| score_vector(&table, v, model))
        .collect()
}
