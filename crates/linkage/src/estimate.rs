//! Direct parameter estimates that need no EM.

use crate::backend::{fetch, Backend, QueryDescription, QueryResult};
use crate::blocking::generate_candidates;
use crate::comparison::LevelId;
use crate::error::LinkError;
use crate::model::{ComparisonVector, Record};
use crate::predicate::BlockingRule;
use crate::state::ModelState;
use crate::vectors::evaluate_vectors;

/// Fraction of non-null observations falling at each level, per comparison.
/// Levels nobody landed on are omitted.
fn level_frequencies(model: &ModelState, vectors: &[ComparisonVector]) -> Vec<(LevelId, f64)> {
    let mut out = Vec::new();
    for (c, comparison) in model.comparisons.iter().enumerate() {
        let mut counts = vec![0usize; comparison.levels.len()];
        for v in vectors {
            counts[v.levels[c]] += 1;
        }
        let data_levels = comparison.data_level_indices();
        let total: usize = data_levels.iter().map(|&l| counts[l]).sum();
        if total == 0 {
            continue;
        }
        for l in data_levels {
            if counts[l] > 0 {
                out.push((comparison.level_id(l), counts[l] as f64 / total as f64));
            }
        }
    }
    out
}

/// u-probabilities as level frequencies among uniformly sampled pairs, which
/// are overwhelmingly non-matches.
pub fn estimate_u_using_random_sampling<B: Backend>(
    backend: &B,
    records: &[Record],
    model: &ModelState,
    max_pairs: usize,
    seed: u64,
) -> Result<Vec<(LevelId, f64)>, LinkError> {
    let query = QueryDescription::SamplePairs { max_pairs, seed, link_type: model.link_type };
    let result = fetch(backend, &query, records)?;
    let QueryResult::Pairs(pairs) = result.as_ref() else {
        return Err(LinkError::Backend(format!("pair sample returned {}", result.kind())));
    };
    if pairs.is_empty() {
        return Err(LinkError::Configuration("random sampling produced no pairs".into()));
    }
    log::info!("estimating u from {} sampled pairs", pairs.len());
    let vectors = evaluate_vectors(backend, records, pairs, model)?;
    Ok(level_frequencies(model, &vectors))
}

/// m-probabilities as level frequencies among pairs that share a value in a
/// ground-truth cluster column.
pub fn estimate_m_from_label_column<B: Backend>(
    backend: &B,
    records: &[Record],
    model: &ModelState,
    label_column: &str,
) -> Result<Vec<(LevelId, f64)>, LinkError> {
    let rule = BlockingRule::on_columns(&[label_column]);
    let candidates = generate_candidates(
        backend,
        records,
        std::slice::from_ref(&rule),
        model.link_type,
        model.max_candidate_pairs,
    )?;
    if candidates.is_empty() {
        return Err(LinkError::Configuration(format!(
            "label column '{label_column}' links no pairs"
        )));
    }
    log::info!("estimating m from {} labelled pairs", candidates.len());
    let vectors = evaluate_vectors(backend, records, &candidates.pairs, model)?;
    Ok(level_frequencies(model, &vectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::{else_level, exact_match_level, null_level, Comparison};
    use crate::memory::MemoryBackend;
    use crate::model::LinkType;

    fn model() -> ModelState {
        let comps = vec![Comparison::new(
            "city",
            vec![null_level("city"), exact_match_level("city"), else_level()],
        )
        .unwrap()];
        ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comps, 0.01).unwrap()
    }

    fn records() -> Vec<Record> {
        let rows = [
            ("1", "leeds", "a"),
            ("2", "leeds", "a"),
            ("3", "york", "b"),
            ("4", "hull", "b"),
            ("5", "", "c"),
        ];
        rows.iter()
            .map(|(id, city, cluster)| Record::new(*id, "t").with("city", *city).with("cluster", *cluster))
            .collect()
    }

    #[test]
    fn u_from_every_pair_excludes_nulls() {
        let est = estimate_u_using_random_sampling(&MemoryBackend::new(), &records(), &model(), 100, 1).unwrap();
        // 10 pairs, 4 touch the null city; of the 6 left one matches
        assert_eq!(est.len(), 2);
        assert_eq!(est[0].0, LevelId::new("city", 1));
        assert!((est[0].1 - 1.0 / 6.0).abs() < 1e-12);
        assert!((est[1].1 - 5.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn m_from_clusters() {
        let est = estimate_m_from_label_column(&MemoryBackend::new(), &records(), &model(), "cluster").unwrap();
        // cluster a: leeds/leeds, cluster b: york/hull
        assert_eq!(est, vec![(LevelId::new("city", 1), 0.5), (LevelId::new("city", 2), 0.5)]);
    }
}
