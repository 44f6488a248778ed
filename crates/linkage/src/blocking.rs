use std::collections::HashSet;

use serde::Serialize;

use crate::backend::{fetch, Backend, QueryDescription, QueryResult};
use crate::error::LinkError;
use crate::model::{CandidatePair, LinkType, Record};
use crate::predicate::BlockingRule;

/// Pair counts for one blocking rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleCount {
    pub rule: String,
    /// Pairs satisfying the rule on its own.
    pub pairs: u64,
    /// Pairs first produced by this rule, after earlier rules.
    pub new_pairs: usize,
}

/// Deduplicated candidate pairs, in rule order then pair order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CandidateSet {
    pub pairs: Vec<CandidatePair>,
    pub per_rule: Vec<RuleCount>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

fn count_rule<B: Backend>(
    backend: &B,
    records: &[Record],
    rule: &BlockingRule,
    link_type: LinkType,
    limit: Option<u64>,
) -> Result<u64, LinkError> {
    let query = QueryDescription::CountPairs { rule: &rule.predicate, link_type, limit };
    match fetch(backend, &query, records)?.as_ref() {
        QueryResult::Count(n) => Ok(*n),
        other => Err(LinkError::Backend(format!(
            "pair count for rule '{rule}' returned {}",
            other.kind()
        ))),
    }
}

/// Selectivity of each rule without materializing any pair.
pub fn count_candidates<B: Backend>(
    backend: &B,
    records: &[Record],
    rules: &[BlockingRule],
    link_type: LinkType,
) -> Result<Vec<(String, u64)>, LinkError> {
    rules
        .iter()
        .map(|rule| Ok((rule.to_string(), count_rule(backend, records, rule, link_type, None)?)))
        .collect()
}

/// Pairs satisfying at least one rule, each pair once. A pair keeps the index
/// of the first rule that produced it as its `match_key`. Every rule is
/// counted before it is materialized and rejected above `ceiling`. An empty
/// rule list compares every admissible pair.
pub fn generate_candidates<B: Backend>(
    backend: &B,
    records: &[Record],
    rules: &[BlockingRule],
    link_type: LinkType,
    ceiling: u64,
) -> Result<CandidateSet, LinkError> {
    let all = [BlockingRule::all()];
    let rules = if rules.is_empty() { &all[..] } else { rules };

    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut set = CandidateSet::default();
    for (match_key, rule) in rules.iter().enumerate() {
        let pairs = count_rule(backend, records, rule, link_type, Some(ceiling))?;
        if pairs > ceiling {
            return Err(LinkError::BlockingExplosion { rule: rule.to_string(), pairs, ceiling });
        }

        let query = QueryDescription::BlockPairs { rule: &rule.predicate, link_type, match_key };
        let result = fetch(backend, &query, records)?;
        let QueryResult::Pairs(blocked) = result.as_ref() else {
            return Err(LinkError::Backend(format!(
                "blocking rule '{rule}' returned {}",
                result.kind()
            )));
        };

        let before = set.pairs.len();
        for pair in blocked {
            if pair.left != pair.right && seen.insert(pair.key()) {
                set.pairs.push(CandidatePair::new(pair.left, pair.right, match_key));
            }
        }
        let new_pairs = set.pairs.len() - before;
        log::debug!("blocking rule '{rule}': {pairs} pairs, {new_pairs} new");
        set.per_rule.push(RuleCount { rule: rule.to_string(), pairs, new_pairs });
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn records() -> Vec<Record> {
        let rows = [
            ("1", "smith", "john", "leeds"),
            ("2", "smith", "john", "york"),
            ("3", "smith", "jon", "leeds"),
            ("4", "jones", "mary", "leeds"),
            ("5", "jones", "mary", "hull"),
            ("6", "brown", "", "hull"),
        ];
        rows.iter()
            .map(|(id, s, f, c)| Record::new(*id, "people").with("surname", *s).with("first_name", *f).with("city", *c))
            .collect()
    }

    #[test]
    fn rules_are_deduplicated_with_first_match_key() {
        let backend = MemoryBackend::new();
        let rules = vec![
            BlockingRule::on_columns(&["surname"]),
            BlockingRule::on_columns(&["city"]),
        ];
        let set = generate_candidates(&backend, &records(), &rules, LinkType::DedupeOnly, 1000).unwrap();
        // surname: 3 + 1; city adds (0,3), (2,3), (4,5)
        assert_eq!(set.per_rule[0].new_pairs, 4);
        assert_eq!(set.per_rule[1].pairs, 4);
        assert_eq!(set.per_rule[1].new_pairs, 3);
        assert_eq!(set.len(), 7);
        let leeds_smiths = set.pairs.iter().find(|p| p.key() == (0, 2)).unwrap();
        assert_eq!(leeds_smiths.match_key, 0);
    }

    #[test]
    fn explosion_is_reported_before_materializing() {
        let backend = MemoryBackend::new();
        let err = generate_candidates(&backend, &records(), &[BlockingRule::all()], LinkType::DedupeOnly, 10)
            .unwrap_err();
        assert_eq!(
            err,
            LinkError::BlockingExplosion { rule: "1 = 1".into(), pairs: 15, ceiling: 10 }
        );
        assert_eq!(backend.live_results(), 0);
    }

    #[test]
    fn empty_rules_compare_everything() {
        let set = generate_candidates(&MemoryBackend::new(), &records(), &[], LinkType::DedupeOnly, 100).unwrap();
        assert_eq!(set.len(), 15);
    }

    #[test]
    fn counts_match_generated_pairs() {
        let backend = MemoryBackend::new();
        let rules = vec![BlockingRule::on_columns(&["surname", "first_name"])];
        let counts = count_candidates(&backend, &records(), &rules, LinkType::DedupeOnly).unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].1, 2);
    }
}
