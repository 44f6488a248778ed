//! Model state: comparisons, levels and the global match prior.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::comparison::{Comparison, ComparisonLevel, LevelId};
use crate::error::LinkError;
use crate::model::LinkType;
use crate::predicate::{BlockingRule, PredicateCompiler};
use crate::scoring::prob_to_bayes_factor;
use crate::term_frequency::TermFrequencyTable;

pub const DEFAULT_MAX_ITERATIONS: usize = 25;
pub const DEFAULT_EM_CONVERGENCE: f64 = 0.001;
pub const DEFAULT_MAX_CANDIDATE_PAIRS: u64 = 50_000_000;

#[derive(Debug, Clone, Serialize)]
pub struct ModelState {
    pub dialect: String,
    pub link_type: LinkType,
    pub comparisons: Vec<Comparison>,
    pub probability_two_random_records_match: f64,
    pub blocking_rules_to_generate_predictions: Vec<BlockingRule>,
    pub max_iterations: usize,
    pub em_convergence: f64,
    pub max_candidate_pairs: u64,
    #[serde(skip)]
    pub tf_tables: Arc<BTreeMap<String, TermFrequencyTable>>,
}

impl ModelState {
    /// Validates the comparisons and compiles every level predicate with the
    /// given dialect, so an inexpressible predicate fails here.
    pub fn new<C: PredicateCompiler>(
        compiler: &C,
        link_type: LinkType,
        comparisons: Vec<Comparison>,
        probability_two_random_records_match: f64,
    ) -> Result<Self, LinkError> {
        if comparisons.is_empty() {
            return Err(LinkError::Configuration("at least one comparison is required".into()));
        }
        if !(probability_two_random_records_match > 0.0 && probability_two_random_records_match < 1.0)
        {
            return Err(LinkError::Configuration(format!(
                "probability_two_random_records_match {probability_two_random_records_match} outside (0, 1)"
            )));
        }
        let mut seen = HashSet::new();
        for comparison in &comparisons {
            if !seen.insert(comparison.name.as_str()) {
                return Err(LinkError::Configuration(format!(
                    "duplicate comparison name '{}'",
                    comparison.name
                )));
            }
            for level in &comparison.levels {
                compiler.compile(&level.predicate).map_err(|e| {
                    LinkError::Configuration(format!(
                        "comparison '{}', level '{}': {e}",
                        comparison.name, level.label
                    ))
                })?;
            }
        }

        Ok(Self {
            dialect: compiler.dialect().to_string(),
            link_type,
            comparisons,
            probability_two_random_records_match,
            blocking_rules_to_generate_predictions: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            em_convergence: DEFAULT_EM_CONVERGENCE,
            max_candidate_pairs: DEFAULT_MAX_CANDIDATE_PAIRS,
            tf_tables: Arc::new(BTreeMap::new()),
        })
    }

    pub fn with_blocking_rules<C: PredicateCompiler>(
        mut self,
        compiler: &C,
        rules: Vec<BlockingRule>,
    ) -> Result<Self, LinkError> {
        for rule in &rules {
            compiler.compile(&rule.predicate).map_err(|e| {
                LinkError::Configuration(format!("blocking rule '{rule}': {e}"))
            })?;
        }
        self.blocking_rules_to_generate_predictions = rules;
        Ok(self)
    }

    pub fn with_training_limits(mut self, max_iterations: usize, em_convergence: f64) -> Self {
        self.max_iterations = max_iterations;
        self.em_convergence = em_convergence;
        self
    }

    pub fn with_max_candidate_pairs(mut self, max_candidate_pairs: u64) -> Self {
        self.max_candidate_pairs = max_candidate_pairs;
        self
    }

    pub fn comparison(&self, name: &str) -> Option<&Comparison> {
        self.comparisons.iter().find(|c| c.name == name)
    }

    pub fn comparison_index(&self, name: &str) -> Option<usize> {
        self.comparisons.iter().position(|c| c.name == name)
    }

    pub fn level(&self, id: &LevelId) -> Result<&ComparisonLevel, LinkError> {
        self.comparison(&id.comparison)
            .and_then(|c| c.levels.get(id.level))
            .ok_or_else(|| LinkError::Configuration(format!("unknown comparison level {id}")))
    }

    pub fn level_mut(&mut self, id: &LevelId) -> Result<&mut ComparisonLevel, LinkError> {
        self.comparisons
            .iter_mut()
            .find(|c| c.name == id.comparison)
            .and_then(|c| c.levels.get_mut(id.level))
            .ok_or_else(|| LinkError::Configuration(format!("unknown comparison level {id}")))
    }

    pub fn prior_bayes_factor(&self) -> f64 {
        prob_to_bayes_factor(self.probability_two_random_records_match)
    }

    /// Columns carrying term-frequency adjustments on any level.
    pub fn tf_columns(&self) -> BTreeSet<String> {
        self.comparisons
            .iter()
            .flat_map(|c| c.levels.iter())
            .filter_map(|l| l.tf_adjustment_column.clone())
            .collect()
    }

    pub fn tf_table(&self, column: &str) -> Option<&TermFrequencyTable> {
        self.tf_tables.get(column)
    }

    /// Set each level's m/u to the median of its trained values.
    pub fn populate_m_u_from_trained_values(&mut self) {
        for comparison in &mut self.comparisons {
            comparison.populate_from_trained();
        }
    }

    /// Copy of the parameters with every trained-value accumulator emptied.
    pub fn training_copy(&self) -> Self {
        let mut copy = self.clone();
        for level in copy.comparisons.iter_mut().flat_map(|c| c.levels.iter_mut()) {
            level.trained_m.clear();
            level.trained_u.clear();
        }
        copy
    }

    /// Serialize parameters (not tf tables) to pretty JSON.
    pub fn to_json(&self) -> Result<String, LinkError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::Io(format!("JSON serialization error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::{else_level, exact_match_level, levenshtein_level, null_level};
    use crate::memory::MemoryBackend;
    use crate::predicate::Predicate;

    fn comparisons() -> Vec<Comparison> {
        vec![
            Comparison::new(
                "surname",
                vec![null_level("surname"), exact_match_level("surname"), levenshtein_level("surname", 1), else_level()],
            )
            .unwrap(),
            Comparison::new("city", vec![exact_match_level("city").with_tf_adjustments("city"), else_level()])
                .unwrap(),
        ]
    }

    #[test]
    fn build_and_lookup() {
        let state = ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comparisons(), 0.01).unwrap();
        assert_eq!(state.dialect, "memory");
        assert_eq!(state.comparison_index("city"), Some(1));
        assert!(state.level(&LevelId::new("surname", 2)).is_ok());
        assert!(state.level(&LevelId::new("surname", 9)).is_err());
        assert_eq!(state.tf_columns(), BTreeSet::from(["city".to_string()]));
        assert!((state.prior_bayes_factor() - 0.01 / 0.99).abs() < 1e-12);
    }

    #[test]
    fn reject_bad_prior() {
        let err = ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comparisons(), 1.0).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[test]
    fn reject_duplicate_names() {
        let mut comps = comparisons();
        comps.push(comps[0].clone());
        assert!(ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comps, 0.1).is_err());
    }

    #[test]
    fn reject_predicate_the_dialect_cannot_compile() {
        let comps = vec![Comparison::new(
            "x",
            vec![
                crate::comparison::ComparisonLevel::new(Predicate::Sql { sql: "l.x ~ r.x".into() }),
                else_level(),
            ],
        )
        .unwrap()];
        let err = ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comps, 0.1).unwrap_err();
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn training_copy_drops_history() {
        let mut state = ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comparisons(), 0.01).unwrap();
        let id = LevelId::new("surname", 1);
        state.level_mut(&id).unwrap().trained_m.push(crate::comparison::TrainedValue {
            value: 0.8,
            source: crate::comparison::TrainingSource::RandomSampling,
        });
        let copy = state.training_copy();
        assert!(!copy.level(&id).unwrap().m_is_trained());
        assert!(state.level(&id).unwrap().m_is_trained());
    }
}
