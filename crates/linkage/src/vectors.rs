use rayon::prelude::*;

use crate::backend::{fetch, Backend, PairEvaluation, QueryDescription, QueryResult};
use crate::error::LinkError;
use crate::model::{CandidatePair, ComparisonVector, Record};
use crate::predicate::Predicate;
use crate::state::ModelState;

/// Offsets of each comparison's non-else level predicates in the flat list
/// sent to the backend.
struct PredicateLayout {
    predicates: Vec<Predicate>,
    offsets: Vec<usize>,
    value_columns: Vec<String>,
}

impl PredicateLayout {
    fn new(model: &ModelState) -> Self {
        let mut predicates = Vec::new();
        let mut offsets = Vec::with_capacity(model.comparisons.len());
        for comparison in &model.comparisons {
            offsets.push(predicates.len());
            let last = comparison.else_level();
            predicates.extend(comparison.levels[..last].iter().map(|l| l.predicate.clone()));
        }
        Self { predicates, offsets, value_columns: model.tf_columns().into_iter().collect() }
    }

    fn vector(&self, model: &ModelState, evaluation: &PairEvaluation) -> ComparisonVector {
        let mut levels = Vec::with_capacity(model.comparisons.len());
        let mut tf_frequencies = Vec::with_capacity(model.comparisons.len());
        for (c, comparison) in model.comparisons.iter().enumerate() {
            let start = self.offsets[c];
            let end = start + comparison.else_level();
            let level = evaluation.truths[start..end]
                .iter()
                .position(|&t| t)
                .unwrap_or_else(|| comparison.else_level());
            levels.push(level);

            let frequency = comparison.levels[level]
                .tf_adjustment_column
                .as_deref()
                .and_then(|column| {
                    let table = model.tf_table(column)?;
                    let v = self.value_columns.iter().position(|c| c == column)?;
                    let (l, r) = &evaluation.values[v];
                    table.pair_frequency(l.as_deref(), r.as_deref())
                });
            tf_frequencies.push(frequency);
        }
        ComparisonVector { pair: evaluation.pair, levels, tf_frequencies }
    }
}

/// One comparison vector per pair, in input order: for each comparison, the
/// index of the first level whose predicate holds, else the final level.
pub fn evaluate_vectors<B: Backend>(
    backend: &B,
    records: &[Record],
    pairs: &[CandidatePair],
    model: &ModelState,
) -> Result<Vec<ComparisonVector>, LinkError> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    let layout = PredicateLayout::new(model);
    let query = QueryDescription::EvaluatePredicates {
        pairs,
        predicates: &layout.predicates,
        value_columns: &layout.value_columns,
    };
    let result = fetch(backend, &query, records)?;
    let QueryResult::Evaluations(evaluations) = result.as_ref() else {
        return Err(LinkError::Backend(format!(
            "predicate evaluation returned {}",
            result.kind()
        )));
    };
    if evaluations.len() != pairs.len() {
        return Err(LinkError::Backend(format!(
            "predicate evaluation returned {} rows for {} pairs",
            evaluations.len(),
            pairs.len()
        )));
    }
    if let Some(bad) = evaluations.iter().find(|e| {
        e.truths.len() != layout.predicates.len() || e.values.len() != layout.value_columns.len()
    }) {
        return Err(LinkError::Backend(format!(
            "malformed evaluation row for pair ({}, {})",
            bad.pair.left, bad.pair.right
        )));
    }

    Ok(evaluations.par_iter().map(|e| layout.vector(model, e)).collect())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::comparison::{else_level, exact_match_level, levenshtein_level, null_level, Comparison};
    use crate::memory::MemoryBackend;
    use crate::model::LinkType;
    use crate::term_frequency::TermFrequencyTable;

    fn model() -> ModelState {
        let comps = vec![
            Comparison::new(
                "surname",
                vec![
                    null_level("surname"),
                    exact_match_level("surname").with_tf_adjustments("surname"),
                    levenshtein_level("surname", 2),
                    else_level(),
                ],
            )
            .unwrap(),
            Comparison::new("city", vec![exact_match_level("city"), else_level()]).unwrap(),
        ];
        let mut m = ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comps, 0.01).unwrap();
        let tf = TermFrequencyTable::from_counts("surname", &[("smith".into(), 3), ("smyth".into(), 1)]);
        m.tf_tables = Arc::new(BTreeMap::from([("surname".to_string(), tf)]));
        m
    }

    fn records() -> Vec<Record> {
        vec![
            Record::new("1", "t").with("surname", "smith").with("city", "leeds"),
            Record::new("2", "t").with("surname", "smith").with("city", "york"),
            Record::new("3", "t").with("surname", "smyth").with("city", "leeds"),
            Record::new("4", "t").with("surname", "").with("city", "leeds"),
        ]
    }

    #[test]
    fn first_true_level_wins() {
        let pairs = vec![
            CandidatePair::new(0, 1, 0),
            CandidatePair::new(0, 2, 0),
            CandidatePair::new(0, 3, 0),
        ];
        let v = evaluate_vectors(&MemoryBackend::new(), &records(), &pairs, &model()).unwrap();
        assert_eq!(v[0].levels, vec![1, 1]);
        assert_eq!(v[1].levels, vec![2, 0]);
        // null surname beats every data level
        assert_eq!(v[2].levels, vec![0, 0]);
    }

    #[test]
    fn tf_frequency_only_on_adjusted_level() {
        let pairs = vec![CandidatePair::new(0, 1, 0), CandidatePair::new(0, 2, 0)];
        let v = evaluate_vectors(&MemoryBackend::new(), &records(), &pairs, &model()).unwrap();
        assert_eq!(v[0].tf_frequencies, vec![Some(0.75), None]);
        assert_eq!(v[1].tf_frequencies, vec![None, None]);
    }

    #[test]
    fn no_pairs_no_query() {
        let backend = MemoryBackend::new();
        assert!(evaluate_vectors(&backend, &records(), &[], &model()).unwrap().is_empty());
    }
}
