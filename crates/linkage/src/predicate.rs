//! Abstract pair predicates.
//!
//! The engine never builds backend query text. Levels and blocking rules carry a
//! [`Predicate`] and a backend turns it into whatever it executes through its
//! [`PredicateCompiler`] implementation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateUnit {
    Day,
    Month,
    Year,
}

impl fmt::Display for DateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Month => write!(f, "month"),
            Self::Year => write!(f, "year"),
        }
    }
}

/// A boolean condition over the left (`l`) and right (`r`) record of a pair.
///
/// Data-dependent predicates are false when either side is null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Else,
    Null {
        column: String,
    },
    ExactMatch {
        column: String,
    },
    Levenshtein {
        column: String,
        max_distance: usize,
    },
    JaroWinkler {
        column: String,
        min_similarity: f64,
    },
    Jaccard {
        column: String,
        min_similarity: f64,
    },
    ArrayIntersect {
        column: String,
        min_size: usize,
    },
    DistanceInKm {
        lat_column: String,
        long_column: String,
        max_km: f64,
    },
    ColumnsReversed {
        column_1: String,
        column_2: String,
    },
    DateDiff {
        column: String,
        max_difference: i64,
        unit: DateUnit,
    },
    RegexExtractMatch {
        column: String,
        pattern: String,
    },
    And {
        predicates: Vec<Predicate>,
    },
    Or {
        predicates: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
    /// Backend-specific text, opaque to the engine.
    Sql {
        sql: String,
    },
}

impl Predicate {
    pub fn exact(column: &str) -> Self {
        Self::ExactMatch { column: column.to_string() }
    }

    pub fn null(column: &str) -> Self {
        Self::Null { column: column.to_string() }
    }

    /// True for the dedicated null level (`Null`, or an `Or` of `Null`s).
    pub fn is_null_check(&self) -> bool {
        match self {
            Self::Null { .. } => true,
            Self::Or { predicates } => {
                !predicates.is_empty() && predicates.iter().all(Predicate::is_null_check)
            }
            _ => false,
        }
    }

    pub fn is_else(&self) -> bool {
        matches!(self, Self::Else)
    }

    /// Input columns referenced on either side.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Else | Self::Sql { .. } => {}
            Self::Null { column }
            | Self::ExactMatch { column }
            | Self::Levenshtein { column, .. }
            | Self::JaroWinkler { column, .. }
            | Self::Jaccard { column, .. }
            | Self::ArrayIntersect { column, .. }
            | Self::DateDiff { column, .. }
            | Self::RegexExtractMatch { column, .. } => {
                out.insert(column.clone());
            }
            Self::DistanceInKm { lat_column, long_column, .. } => {
                out.insert(lat_column.clone());
                out.insert(long_column.clone());
            }
            Self::ColumnsReversed { column_1, column_2 } => {
                out.insert(column_1.clone());
                out.insert(column_2.clone());
            }
            Self::And { predicates } | Self::Or { predicates } => {
                for p in predicates {
                    p.collect_columns(out);
                }
            }
            Self::Not { predicate } => predicate.collect_columns(out),
        }
    }

    /// Columns whose equality this predicate implies, i.e. exact matches reachable
    /// through conjunctions only.
    pub fn implied_equalities(&self) -> BTreeSet<String> {
        match self {
            Self::ExactMatch { column } => BTreeSet::from([column.clone()]),
            Self::And { predicates } => predicates
                .iter()
                .flat_map(Predicate::implied_equalities)
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Columns of a pure conjunction of exact matches, usable as a hash-join key.
    pub fn equi_join_columns(&self) -> Option<Vec<String>> {
        match self {
            Self::ExactMatch { column } => Some(vec![column.clone()]),
            Self::And { predicates } if !predicates.is_empty() => {
                let mut cols = Vec::new();
                for p in predicates {
                    cols.extend(p.equi_join_columns()?);
                }
                Some(cols)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Else => write!(f, "ELSE"),
            Self::Null { column } => write!(f, "l.{column} IS NULL OR r.{column} IS NULL"),
            Self::ExactMatch { column } => write!(f, "l.{column} = r.{column}"),
            Self::Levenshtein { column, max_distance } => {
                write!(f, "levenshtein(l.{column}, r.{column}) <= {max_distance}")
            }
            Self::JaroWinkler { column, min_similarity } => {
                write!(f, "jaro_winkler(l.{column}, r.{column}) >= {min_similarity}")
            }
            Self::Jaccard { column, min_similarity } => {
                write!(f, "jaccard(l.{column}, r.{column}) >= {min_similarity}")
            }
            Self::ArrayIntersect { column, min_size } => {
                write!(f, "size(array_intersect(l.{column}, r.{column})) >= {min_size}")
            }
            Self::DistanceInKm { lat_column, long_column, max_km } => write!(
                f,
                "km_distance(l.{lat_column}, l.{long_column}, r.{lat_column}, r.{long_column}) <= {max_km}"
            ),
            Self::ColumnsReversed { column_1, column_2 } => write!(
                f,
                "l.{column_1} = r.{column_2} AND l.{column_2} = r.{column_1}"
            ),
            Self::DateDiff { column, max_difference, unit } => write!(
                f,
                "abs(date_diff('{unit}', l.{column}, r.{column})) <= {max_difference}"
            ),
            Self::RegexExtractMatch { column, pattern } => write!(
                f,
                "regexp_extract(l.{column}, '{pattern}') = regexp_extract(r.{column}, '{pattern}')"
            ),
            Self::And { predicates } => write_joined(f, predicates, " AND "),
            Self::Or { predicates } => write_joined(f, predicates, " OR "),
            Self::Not { predicate } => write!(f, "NOT ({predicate})"),
            Self::Sql { sql } => write!(f, "{sql}"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, predicates: &[Predicate], sep: &str) -> fmt::Result {
    for (i, p) in predicates.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "({p})")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compiler capability
// ---------------------------------------------------------------------------

/// Turns an abstract predicate into a backend's executable form.
///
/// Implemented once per backend dialect, independent of comparison shape.
pub trait PredicateCompiler {
    type Compiled;

    fn dialect(&self) -> &'static str;

    fn compile(&self, predicate: &Predicate) -> Result<Self::Compiled, LinkError>;
}

// ---------------------------------------------------------------------------
// Blocking rules
// ---------------------------------------------------------------------------

/// A predicate restricting which record pairs are ever compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BlockingRule {
    pub label: String,
    pub predicate: Predicate,
}

impl BlockingRule {
    pub fn new(predicate: Predicate) -> Self {
        Self { label: predicate.to_string(), predicate }
    }

    /// Every pair. Only sensible on small inputs.
    pub fn all() -> Self {
        Self { label: "1 = 1".into(), predicate: Predicate::Else }
    }

    pub fn on_columns(columns: &[&str]) -> Self {
        let preds: Vec<Predicate> = columns.iter().map(|c| Predicate::exact(c)).collect();
        match preds.len() {
            0 => Self::all(),
            1 => Self::new(preds.into_iter().next().unwrap_or(Predicate::Else)),
            _ => Self::new(Predicate::And { predicates: preds }),
        }
    }

    /// Parses `l.a = r.a and l.b = r.b`. Anything else becomes an opaque `Sql` rule.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.replace(' ', "") == "1=1" {
            return Self::all();
        }
        match parse_equalities(trimmed) {
            Some(columns) => {
                let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
                let mut rule = Self::on_columns(&cols);
                rule.label = trimmed.to_string();
                rule
            }
            None => Self {
                label: trimmed.to_string(),
                predicate: Predicate::Sql { sql: trimmed.to_string() },
            },
        }
    }
}

fn parse_equalities(text: &str) -> Option<Vec<String>> {
    let lower = text.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut rest = 0;
    while let Some(pos) = lower[rest..].find(" and ") {
        parts.push(&text[rest..rest + pos]);
        rest += pos + " and ".len();
    }
    parts.push(&text[rest..]);

    let mut columns = Vec::new();
    for part in parts {
        let (lhs, rhs) = part.split_once('=')?;
        let left = lhs.trim().strip_prefix("l.")?;
        let right = rhs.trim().strip_prefix("r.")?;
        if left != right || !is_identifier(left) {
            return None;
        }
        columns.push(left.to_string());
    }
    Some(columns)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl From<String> for BlockingRule {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}

impl From<BlockingRule> for String {
    fn from(rule: BlockingRule) -> Self {
        rule.label
    }
}

impl fmt::Display for BlockingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
