use std::collections::BTreeMap;

use crate::model::{PredictionRow, PredictionSummary};
use crate::predicate::BlockingRule;

/// Compute summary statistics from scored predictions.
pub fn compute_summary(rows: &[PredictionRow], threshold: f64, rules: &[BlockingRule]) -> PredictionSummary {
    let mut pairs_by_rule: BTreeMap<String, usize> = BTreeMap::new();
    let mut above_threshold = 0;
    let mut total_probability = 0.0;

    for row in rows {
        let rule = rules
            .get(row.match_key)
            .map(ToString::to_string)
            .unwrap_or_else(|| BlockingRule::all().to_string());
        *pairs_by_rule.entry(rule).or_insert(0) += 1;
        if row.match_probability >= threshold {
            above_threshold += 1;
        }
        total_probability += row.match_probability;
    }

    PredictionSummary {
        total_pairs: rows.len(),
        threshold,
        above_threshold,
        mean_match_probability: if rows.is_empty() { 0.0 } else { total_probability / rows.len() as f64 },
        pairs_by_rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(match_key: usize, match_probability: f64) -> PredictionRow {
        PredictionRow {
            unique_id_l: "1".into(),
            unique_id_r: "2".into(),
            source_dataset_l: "t".into(),
            source_dataset_r: "t".into(),
            match_key,
            levels: vec![],
            match_weight: 0.0,
            match_probability,
        }
    }

    #[test]
    fn summary_counts() {
        let rules = vec![BlockingRule::parse("l.surname = r.surname"), BlockingRule::parse("l.city = r.city")];
        let rows = vec![row(0, 0.99), row(0, 0.2), row(1, 0.95), row(1, 0.01)];
        let summary = compute_summary(&rows, 0.9, &rules);
        assert_eq!(summary.total_pairs, 4);
        assert_eq!(summary.above_threshold, 2);
        assert_eq!(summary.pairs_by_rule["l.surname = r.surname"], 2);
        assert!((summary.mean_match_probability - 0.5375).abs() < 1e-12);
    }

    #[test]
    fn rules_serialize_in_sorted_order() {
        let rules = vec![BlockingRule::parse("l.surname = r.surname"), BlockingRule::parse("l.city = r.city")];
        let rows = vec![row(0, 0.99), row(1, 0.95)];
        let summary = compute_summary(&rows, 0.9, &rules);
        let keys: Vec<&str> = summary.pairs_by_rule.keys().map(String::as_str).collect();
        assert_eq!(keys, ["l.city = r.city", "l.surname = r.surname"]);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.find("l.city").unwrap() < json.find("l.surname").unwrap());
    }

    #[test]
    fn empty_predictions() {
        let summary = compute_summary(&[], 0.5, &[]);
        assert_eq!(summary.total_pairs, 0);
        assert_eq!(summary.mean_match_probability, 0.0);
    }
}
