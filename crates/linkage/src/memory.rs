//! In-process backend: evaluates predicates natively over the input records.
//!
//! Conjunctions of exact matches block through a hash join. Every other rule
//! falls back to a rayon-parallel nested loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use regex::Regex;

use crate::backend::{Backend, PairEvaluation, QueryDescription, QueryResult, TableHandle};
use crate::error::LinkError;
use crate::model::{CandidatePair, LinkType, Record};
use crate::predicate::{DateUnit, Predicate, PredicateCompiler};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Rows per parallel batch when counting with a limit.
const COUNT_BLOCK_ROWS: usize = 256;

// ---------------------------------------------------------------------------
// Compiled predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Always,
    Null(String),
    Exact(String),
    Levenshtein(String, usize),
    JaroWinkler(String, f64),
    Jaccard(String, f64),
    ArrayIntersect(String, usize),
    DistanceInKm { lat: String, long: String, max_km: f64 },
    ColumnsReversed(String, String),
    DateDiff(String, i64, DateUnit),
    RegexExtract(String, Regex),
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    pub fn eval(&self, l: &Record, r: &Record) -> bool {
        match self {
            Self::Always => true,
            Self::Null(c) => l.get(c).is_null() || r.get(c).is_null(),
            Self::Exact(c) => match (l.get(c).as_text(), r.get(c).as_text()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            Self::Levenshtein(c, k) => match (l.get(c).as_text(), r.get(c).as_text()) {
                (Some(a), Some(b)) => strsim::levenshtein(&a, &b) <= *k,
                _ => false,
            },
            Self::JaroWinkler(c, t) => match (l.get(c).as_text(), r.get(c).as_text()) {
                (Some(a), Some(b)) => strsim::jaro_winkler(&a, &b) >= *t,
                _ => false,
            },
            Self::Jaccard(c, t) => match (l.get(c).as_text(), r.get(c).as_text()) {
                (Some(a), Some(b)) => jaccard(&a, &b) >= *t,
                _ => false,
            },
            Self::ArrayIntersect(c, n) => match (l.get(c).as_list(), r.get(c).as_list()) {
                (Some(a), Some(b)) => {
                    let a: HashSet<&str> = a.into_iter().collect();
                    let b: HashSet<&str> = b.into_iter().collect();
                    a.intersection(&b).count() >= *n
                }
                _ => false,
            },
            Self::DistanceInKm { lat, long, max_km } => {
                let coords = (
                    l.get(lat).as_f64(),
                    l.get(long).as_f64(),
                    r.get(lat).as_f64(),
                    r.get(long).as_f64(),
                );
                match coords {
                    (Some(lat1), Some(lon1), Some(lat2), Some(lon2)) => {
                        haversine_km(lat1, lon1, lat2, lon2) <= *max_km
                    }
                    _ => false,
                }
            }
            Self::ColumnsReversed(c1, c2) => {
                let pairs = [(l.get(c1), r.get(c2)), (l.get(c2), r.get(c1))];
                pairs.iter().all(|(a, b)| match (a.as_text(), b.as_text()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                })
            }
            Self::DateDiff(c, max, unit) => match (l.get(c).as_date(), r.get(c).as_date()) {
                (Some(a), Some(b)) => {
                    let diff = match unit {
                        DateUnit::Day => (b - a).num_days(),
                        DateUnit::Month => {
                            (b.year() as i64 * 12 + b.month() as i64)
                                - (a.year() as i64 * 12 + a.month() as i64)
                        }
                        DateUnit::Year => b.year() as i64 - a.year() as i64,
                    };
                    diff.abs() <= *max
                }
                _ => false,
            },
            Self::RegexExtract(c, re) => match (l.get(c).as_text(), r.get(c).as_text()) {
                (Some(a), Some(b)) => match (re.find(&a), re.find(&b)) {
                    (Some(x), Some(y)) => x.as_str() == y.as_str(),
                    _ => false,
                },
                _ => false,
            },
            Self::And(ps) => ps.iter().all(|p| p.eval(l, r)),
            Self::Or(ps) => ps.iter().any(|p| p.eval(l, r)),
            Self::Not(p) => !p.eval(l, r),
        }
    }
}

/// Jaccard similarity of the two strings' character sets.
fn jaccard(a: &str, b: &str) -> f64 {
    let a: HashSet<char> = a.chars().collect();
    let b: HashSet<char> = b.chars().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

fn check_unit_interval(what: &str, value: f64) -> Result<(), LinkError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LinkError::Configuration(format!("{what} threshold {value} outside [0, 1]")))
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryBackend {
    next_id: AtomicU64,
    results: Mutex<HashMap<u64, Arc<QueryResult>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of results currently held.
    pub fn live_results(&self) -> usize {
        self.results.lock().len()
    }

    fn store(&self, name: &str, result: QueryResult) -> TableHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rows = result.len();
        self.results.lock().insert(id, Arc::new(result));
        TableHandle { id, name: format!("{name}_{id}"), rows }
    }

    /// Pairs satisfying `rule`. Past `limit` the nested loop stops early and
    /// returns a partial count that is already above it.
    fn count_pairs(
        &self,
        rule: &Predicate,
        link_type: LinkType,
        limit: Option<u64>,
        records: &[Record],
    ) -> Result<u64, LinkError> {
        if rule.is_else() {
            let everyone: Vec<usize> = (0..records.len()).collect();
            return Ok(admissible_pairs_in_group(&everyone, records, link_type));
        }
        if let Some(columns) = rule.equi_join_columns() {
            let mut total = 0u64;
            for group in key_groups(records, &columns).values() {
                total += admissible_pairs_in_group(group, records, link_type);
            }
            return Ok(total);
        }
        let compiled = self.compile(rule)?;
        let n = records.len();
        let row_count = |i: usize| -> u64 {
            (i + 1..n)
                .filter(|&j| link_type.admits(&records[i], &records[j]) && compiled.eval(&records[i], &records[j]))
                .count() as u64
        };
        let mut total = 0u64;
        let mut start = 0;
        while start < n {
            let end = (start + COUNT_BLOCK_ROWS).min(n);
            total += (start..end).into_par_iter().map(row_count).sum::<u64>();
            if limit.is_some_and(|l| total > l) {
                break;
            }
            start = end;
        }
        Ok(total)
    }

    fn block_pairs(
        &self,
        rule: &Predicate,
        link_type: LinkType,
        match_key: usize,
        records: &[Record],
    ) -> Result<Vec<CandidatePair>, LinkError> {
        let mut pairs: Vec<CandidatePair> = if let Some(columns) = rule.equi_join_columns() {
            let groups = key_groups(records, &columns);
            groups
                .into_par_iter()
                .flat_map_iter(|(_, group)| {
                    let mut out = Vec::new();
                    for (a, &i) in group.iter().enumerate() {
                        for &j in &group[a + 1..] {
                            if link_type.admits(&records[i], &records[j]) {
                                out.push(CandidatePair::new(i, j, match_key));
                            }
                        }
                    }
                    out
                })
                .collect()
        } else {
            let compiled = self.compile(rule)?;
            let n = records.len();
            (0..n)
                .into_par_iter()
                .flat_map_iter(|i| {
                    let compiled = &compiled;
                    (i + 1..n)
                        .filter(move |&j| {
                            link_type.admits(&records[i], &records[j])
                                && compiled.eval(&records[i], &records[j])
                        })
                        .map(move |j| CandidatePair::new(i, j, match_key))
                })
                .collect()
        };
        pairs.sort_unstable_by_key(CandidatePair::key);
        Ok(pairs)
    }

    fn evaluate(
        &self,
        pairs: &[CandidatePair],
        predicates: &[Predicate],
        value_columns: &[String],
        records: &[Record],
    ) -> Result<Vec<PairEvaluation>, LinkError> {
        let compiled = predicates
            .iter()
            .map(|p| self.compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let n = records.len();
        if let Some(bad) = pairs.iter().find(|p| p.right >= n) {
            return Err(LinkError::Backend(format!(
                "pair ({}, {}) out of range for {n} records",
                bad.left, bad.right
            )));
        }
        Ok(pairs
            .par_iter()
            .map(|pair| {
                let (l, r) = (&records[pair.left], &records[pair.right]);
                PairEvaluation {
                    pair: *pair,
                    truths: compiled.iter().map(|c| c.eval(l, r)).collect(),
                    values: value_columns
                        .iter()
                        .map(|c| {
                            (
                                l.get(c).as_text().map(|v| v.into_owned()),
                                r.get(c).as_text().map(|v| v.into_owned()),
                            )
                        })
                        .collect(),
                }
            })
            .collect())
    }

    fn term_frequencies(column: &str, records: &[Record]) -> Vec<(String, u64)> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in records {
            if let Some(v) = record.get(column).as_text() {
                *counts.entry(v.into_owned()).or_insert(0) += 1;
            }
        }
        let mut out: Vec<(String, u64)> = counts.into_iter().collect();
        out.sort();
        out
    }

    fn sample_pairs(max_pairs: usize, seed: u64, link_type: LinkType, records: &[Record]) -> Vec<CandidatePair> {
        let n = records.len();
        if n < 2 || max_pairs == 0 {
            return Vec::new();
        }
        let total = n as u64 * (n as u64 - 1) / 2;
        if total <= max_pairs as u64 {
            let mut all = Vec::new();
            for i in 0..n {
                for j in i + 1..n {
                    if link_type.admits(&records[i], &records[j]) {
                        all.push(CandidatePair::new(i, j, 0));
                    }
                }
            }
            return all;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(max_pairs);
        let max_attempts = max_pairs.saturating_mul(20);
        let mut attempts = 0;
        while out.len() < max_pairs && attempts < max_attempts {
            attempts += 1;
            let i = rng.gen_range(0..n);
            let j = rng.gen_range(0..n);
            if i == j || !link_type.admits(&records[i], &records[j]) {
                continue;
            }
            let pair = CandidatePair::new(i, j, 0);
            if seen.insert(pair.key()) {
                out.push(pair);
            }
        }
        out
    }
}

/// Record indices grouped by the tuple of their join-column values. Rows with
/// a null in any join column never join.
fn key_groups(records: &[Record], columns: &[String]) -> HashMap<Vec<String>, Vec<usize>> {
    let mut groups: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    'rows: for (i, record) in records.iter().enumerate() {
        let mut key = Vec::with_capacity(columns.len());
        for c in columns {
            match record.get(c).as_text() {
                Some(v) => key.push(v.into_owned()),
                None => continue 'rows,
            }
        }
        groups.entry(key).or_default().push(i);
    }
    groups
}

fn admissible_pairs_in_group(group: &[usize], records: &[Record], link_type: LinkType) -> u64 {
    let n = group.len() as u64;
    let all = n * n.saturating_sub(1) / 2;
    match link_type {
        LinkType::DedupeOnly | LinkType::LinkAndDedupe => all,
        LinkType::LinkOnly => {
            let mut per_source: HashMap<&str, u64> = HashMap::new();
            for &i in group {
                *per_source.entry(records[i].source_dataset.as_str()).or_insert(0) += 1;
            }
            let within: u64 = per_source.values().map(|k| k * k.saturating_sub(1) / 2).sum();
            all - within
        }
    }
}

impl PredicateCompiler for MemoryBackend {
    type Compiled = CompiledPredicate;

    fn dialect(&self) -> &'static str {
        "memory"
    }

    fn compile(&self, predicate: &Predicate) -> Result<CompiledPredicate, LinkError> {
        Ok(match predicate {
            Predicate::Else => CompiledPredicate::Always,
            Predicate::Null { column } => CompiledPredicate::Null(column.clone()),
            Predicate::ExactMatch { column } => CompiledPredicate::Exact(column.clone()),
            Predicate::Levenshtein { column, max_distance } => {
                CompiledPredicate::Levenshtein(column.clone(), *max_distance)
            }
            Predicate::JaroWinkler { column, min_similarity } => {
                check_unit_interval("jaro_winkler", *min_similarity)?;
                CompiledPredicate::JaroWinkler(column.clone(), *min_similarity)
            }
            Predicate::Jaccard { column, min_similarity } => {
                check_unit_interval("jaccard", *min_similarity)?;
                CompiledPredicate::Jaccard(column.clone(), *min_similarity)
            }
            Predicate::ArrayIntersect { column, min_size } => {
                CompiledPredicate::ArrayIntersect(column.clone(), *min_size)
            }
            Predicate::DistanceInKm { lat_column, long_column, max_km } => {
                if !(*max_km >= 0.0) {
                    return Err(LinkError::Configuration(format!(
                        "distance threshold {max_km}km must be non-negative"
                    )));
                }
                CompiledPredicate::DistanceInKm {
                    lat: lat_column.clone(),
                    long: long_column.clone(),
                    max_km: *max_km,
                }
            }
            Predicate::ColumnsReversed { column_1, column_2 } => {
                CompiledPredicate::ColumnsReversed(column_1.clone(), column_2.clone())
            }
            Predicate::DateDiff { column, max_difference, unit } => {
                CompiledPredicate::DateDiff(column.clone(), *max_difference, *unit)
            }
            Predicate::RegexExtractMatch { column, pattern } => {
                let re = Regex::new(pattern).map_err(|e| {
                    LinkError::Configuration(format!("invalid pattern '{pattern}': {e}"))
                })?;
                CompiledPredicate::RegexExtract(column.clone(), re)
            }
            Predicate::And { predicates } => CompiledPredicate::And(
                predicates.iter().map(|p| self.compile(p)).collect::<Result<_, _>>()?,
            ),
            Predicate::Or { predicates } => CompiledPredicate::Or(
                predicates.iter().map(|p| self.compile(p)).collect::<Result<_, _>>()?,
            ),
            Predicate::Not { predicate } => CompiledPredicate::Not(Box::new(self.compile(predicate)?)),
            Predicate::Sql { sql } => {
                return Err(LinkError::Configuration(format!(
                    "SQL text is not supported by the {} dialect: {sql}",
                    self.dialect()
                )))
            }
        })
    }
}

impl Backend for MemoryBackend {
    fn execute(&self, query: &QueryDescription<'_>, records: &[Record]) -> Result<TableHandle, LinkError> {
        let result = match *query {
            QueryDescription::CountPairs { rule, link_type, limit } => {
                QueryResult::Count(self.count_pairs(rule, link_type, limit, records)?)
            }
            QueryDescription::BlockPairs { rule, link_type, match_key } => {
                QueryResult::Pairs(self.block_pairs(rule, link_type, match_key, records)?)
            }
            QueryDescription::EvaluatePredicates { pairs, predicates, value_columns } => {
                QueryResult::Evaluations(self.evaluate(pairs, predicates, value_columns, records)?)
            }
            QueryDescription::TermFrequencies { column } => {
                QueryResult::Frequencies(Self::term_frequencies(column, records))
            }
            QueryDescription::SamplePairs { max_pairs, seed, link_type } => {
                QueryResult::Pairs(Self::sample_pairs(max_pairs, seed, link_type, records))
            }
        };
        Ok(self.store(query.name(), result))
    }

    fn materialize(&self, handle: &TableHandle) -> Result<Arc<QueryResult>, LinkError> {
        self.results
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| LinkError::Backend(format!("unknown table handle '{}'", handle.name)))
    }

    fn release(&self, handle: &TableHandle) {
        self.results.lock().remove(&handle.id);
    }
}
