use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A single cell value. Empty CSV cells load as `Null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDate),
    List(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Textual form used by string predicates and term-frequency lookups.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(Cow::Borrowed(s.as_str())),
            Self::Number(n) => Some(Cow::Owned(n.to_string())),
            Self::Date(d) => Some(Cow::Owned(d.format("%Y-%m-%d").to_string())),
            Self::List(items) => Some(Cow::Owned(items.join("|"))),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    /// List items. Text values are split on `|`.
    pub fn as_list(&self) -> Option<Vec<&str>> {
        match self {
            Self::List(items) => Some(items.iter().map(String::as_str).collect()),
            Self::Text(s) => Some(
                s.split('|')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::Null
        } else {
            Self::Text(s.to_string())
        }
    }
}

static NULL: Value = Value::Null;

/// One input row. `source_dataset` is the name of the table it came from.
#[derive(Debug, Clone)]
pub struct Record {
    pub unique_id: String,
    pub source_dataset: String,
    pub fields: HashMap<String, Value>,
}

impl Record {
    pub fn new(unique_id: impl Into<String>, source_dataset: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            source_dataset: source_dataset.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(column.to_string(), value.into());
        self
    }

    /// Missing columns read as null.
    pub fn get(&self, column: &str) -> &Value {
        self.fields.get(column).unwrap_or(&NULL)
    }
}

/// A named input table.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub records: Vec<Record>,
}

impl Table {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self { name: name.into(), records }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    DedupeOnly,
    LinkOnly,
    LinkAndDedupe,
}

impl Default for LinkType {
    fn default() -> Self {
        Self::DedupeOnly
    }
}

impl LinkType {
    /// Whether two distinct records may form a candidate pair.
    pub fn admits(&self, left: &Record, right: &Record) -> bool {
        match self {
            Self::DedupeOnly | Self::LinkAndDedupe => true,
            Self::LinkOnly => left.source_dataset != right.source_dataset,
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DedupeOnly => write!(f, "dedupe_only"),
            Self::LinkOnly => write!(f, "link_only"),
            Self::LinkAndDedupe => write!(f, "link_and_dedupe"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pairs + vectors
// ---------------------------------------------------------------------------

/// Unordered pair of record indices into the concatenated input, `left < right`.
///
/// `match_key` is the index of the first blocking rule that produced the pair.
/// It is not part of the pair's identity.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CandidatePair {
    pub left: usize,
    pub right: usize,
    pub match_key: usize,
}

impl CandidatePair {
    pub fn new(a: usize, b: usize, match_key: usize) -> Self {
        let (left, right) = if a <= b { (a, b) } else { (b, a) };
        Self { left, right, match_key }
    }

    pub fn key(&self) -> (usize, usize) {
        (self.left, self.right)
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CandidatePair {}

impl std::hash::Hash for CandidatePair {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Level index per comparison, in model order, plus the pair's relative term
/// frequency for comparisons whose matched level is tf-adjusted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonVector {
    pub pair: CandidatePair,
    pub levels: Vec<usize>,
    pub tf_frequencies: Vec<Option<f64>>,
}

impl ComparisonVector {
    pub fn new(pair: CandidatePair, levels: Vec<usize>) -> Self {
        let tf_frequencies = vec![None; levels.len()];
        Self { pair, levels, tf_frequencies }
    }
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ScoredPair {
    pub pair: CandidatePair,
    pub levels: Vec<usize>,
    pub match_weight: f64,
    pub match_probability: f64,
}

/// A scored pair resolved back to record identifiers.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRow {
    pub unique_id_l: String,
    pub unique_id_r: String,
    pub source_dataset_l: String,
    pub source_dataset_r: String,
    pub match_key: usize,
    pub levels: Vec<usize>,
    pub match_weight: f64,
    pub match_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionSummary {
    pub total_pairs: usize,
    pub threshold: f64,
    pub above_threshold: usize,
    pub mean_match_probability: f64,
    pub pairs_by_rule: BTreeMap<String, usize>,
}
