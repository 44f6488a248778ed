//! The execution backend contract.
//!
//! A backend receives abstract query descriptions over the concatenated input
//! records, materializes them, and hands results back by handle. Dialect
//! translation of predicates is entirely its business.

use std::sync::Arc;

use crate::error::LinkError;
use crate::model::{CandidatePair, LinkType, Record};
use crate::predicate::{Predicate, PredicateCompiler};

/// Reference to a materialized result held by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub id: u64,
    pub name: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum QueryDescription<'a> {
    /// Number of pairs satisfying a rule, without materializing them. With a
    /// `limit`, counting may stop once the total exceeds it.
    CountPairs { rule: &'a Predicate, link_type: LinkType, limit: Option<u64> },
    /// Pairs satisfying a rule. `match_key` is stamped onto every pair.
    BlockPairs { rule: &'a Predicate, link_type: LinkType, match_key: usize },
    /// Truth of each predicate for each pair, plus the raw values of `value_columns`.
    EvaluatePredicates {
        pairs: &'a [CandidatePair],
        predicates: &'a [Predicate],
        value_columns: &'a [String],
    },
    /// Count of each non-null value of a column.
    TermFrequencies { column: &'a str },
    /// Uniformly sampled distinct pairs.
    SamplePairs { max_pairs: usize, seed: u64, link_type: LinkType },
}

impl QueryDescription<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CountPairs { .. } => "__link__count_pairs",
            Self::BlockPairs { .. } => "__link__blocked",
            Self::EvaluatePredicates { .. } => "__link__predicate_matrix",
            Self::TermFrequencies { .. } => "__link__tf",
            Self::SamplePairs { .. } => "__link__sampled_pairs",
        }
    }
}

/// One row of an `EvaluatePredicates` result.
#[derive(Debug, Clone, PartialEq)]
pub struct PairEvaluation {
    pub pair: CandidatePair,
    pub truths: Vec<bool>,
    pub values: Vec<(Option<String>, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Count(u64),
    Pairs(Vec<CandidatePair>),
    Evaluations(Vec<PairEvaluation>),
    Frequencies(Vec<(String, u64)>),
}

impl QueryResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Pairs(_) => "pairs",
            Self::Evaluations(_) => "evaluations",
            Self::Frequencies(_) => "frequencies",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Count(_) => 1,
            Self::Pairs(p) => p.len(),
            Self::Evaluations(e) => e.len(),
            Self::Frequencies(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Backend: PredicateCompiler + Send + Sync {
    fn execute(&self, query: &QueryDescription<'_>, records: &[Record]) -> Result<TableHandle, LinkError>;

    fn materialize(&self, handle: &TableHandle) -> Result<Arc<QueryResult>, LinkError>;

    /// Drop a materialized result. Unknown handles are ignored.
    fn release(&self, handle: &TableHandle);
}

/// Execute, materialize and release in one step.
pub fn fetch<B: Backend>(
    backend: &B,
    query: &QueryDescription<'_>,
    records: &[Record],
) -> Result<Arc<QueryResult>, LinkError> {
    let handle = backend.execute(query, records)?;
    let result = backend.materialize(&handle);
    backend.release(&handle);
    result
}
