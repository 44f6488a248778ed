use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::predicate::{DateUnit, Predicate};
use crate::reconcile::median;

// ---------------------------------------------------------------------------
// Identifiers + training provenance
// ---------------------------------------------------------------------------

/// Addresses one level: comparison name plus the level's position in that comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LevelId {
    pub comparison: String,
    pub level: usize,
}

impl LevelId {
    pub fn new(comparison: &str, level: usize) -> Self {
        Self { comparison: comparison.to_string(), level }
    }
}

impl std::fmt::Display for LevelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.comparison, self.level)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingSource {
    Em { session: usize, blocking_rule: String },
    RandomSampling,
    LabelColumn { column: String },
}

impl TrainingSource {
    pub fn session(&self) -> Option<usize> {
        match self {
            Self::Em { session, .. } => Some(*session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainedValue {
    pub value: f64,
    pub source: TrainingSource,
}

fn median_of(values: &[TrainedValue], skip_session: Option<usize>) -> Option<f64> {
    let picked: Vec<f64> = values
        .iter()
        .filter(|t| skip_session.is_none() || t.source.session() != skip_session)
        .map(|t| t.value)
        .collect();
    median(&picked)
}

// ---------------------------------------------------------------------------
// Comparison level
// ---------------------------------------------------------------------------

/// One ordered, mutually exclusive condition within a comparison.
///
/// The null level carries no m/u. Every other level has both once its
/// comparison has been constructed.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonLevel {
    pub label: String,
    pub predicate: Predicate,
    pub m_probability: Option<f64>,
    pub u_probability: Option<f64>,
    pub tf_adjustment_column: Option<String>,
    pub tf_adjustment_weight: f64,
    pub tf_minimum_u_value: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trained_m: Vec<TrainedValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trained_u: Vec<TrainedValue>,
}

impl ComparisonLevel {
    pub fn new(predicate: Predicate) -> Self {
        let label = match &predicate {
            Predicate::Else => "All other comparisons".to_string(),
            p if p.is_null_check() => "Null".to_string(),
            p => p.to_string(),
        };
        Self {
            label,
            predicate,
            m_probability: None,
            u_probability: None,
            tf_adjustment_column: None,
            tf_adjustment_weight: 1.0,
            tf_minimum_u_value: 0.0,
            trained_m: Vec::new(),
            trained_u: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_m(mut self, m: f64) -> Self {
        self.m_probability = Some(m);
        self
    }

    pub fn with_u(mut self, u: f64) -> Self {
        self.u_probability = Some(u);
        self
    }

    pub fn with_tf_adjustments(mut self, column: &str) -> Self {
        self.tf_adjustment_column = Some(column.to_string());
        self
    }

    pub fn is_null_level(&self) -> bool {
        self.predicate.is_null_check()
    }

    pub fn is_else_level(&self) -> bool {
        self.predicate.is_else()
    }

    pub fn m_is_trained(&self) -> bool {
        !self.trained_m.is_empty()
    }

    pub fn u_is_trained(&self) -> bool {
        !self.trained_u.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        self.m_is_trained() && self.u_is_trained()
    }

    pub fn trained_m_median(&self) -> Option<f64> {
        median_of(&self.trained_m, None)
    }

    pub fn trained_u_median(&self) -> Option<f64> {
        median_of(&self.trained_u, None)
    }

    /// Trained bayes factor from every source except the given EM session.
    pub fn trained_bayes_factor_excluding(&self, session: usize) -> Option<f64> {
        let m = median_of(&self.trained_m, Some(session))?;
        let u = median_of(&self.trained_u, Some(session))?;
        (u > 0.0).then(|| m / u)
    }

    /// m / u of this level. The null level is neutral.
    pub fn bayes_factor(&self) -> Result<f64, LinkError> {
        if self.is_null_level() {
            return Ok(1.0);
        }
        let (m, u) = match (self.m_probability, self.u_probability) {
            (Some(m), Some(u)) => (m, u),
            _ => {
                return Err(LinkError::DegenerateParameter(format!(
                    "level '{}' has no m/u probability",
                    self.label
                )))
            }
        };
        if u == 0.0 {
            return Err(LinkError::DegenerateParameter(format!(
                "level '{}' has u_probability 0",
                self.label
            )));
        }
        let bf = m / u;
        if !bf.is_finite() || bf <= 0.0 {
            return Err(LinkError::DegenerateParameter(format!(
                "level '{}' has bayes factor {bf}",
                self.label
            )));
        }
        Ok(bf)
    }

    /// Replace m/u with the median of trained values, where any exist.
    pub fn populate_from_trained(&mut self) {
        if let Some(m) = self.trained_m_median() {
            self.m_probability = Some(m);
        }
        if let Some(u) = self.trained_u_median() {
            self.u_probability = Some(u);
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// An ordered list of levels, most specific first, ending in an else level.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub name: String,
    pub levels: Vec<ComparisonLevel>,
}

impl Comparison {
    /// Validates level order and fills default m/u for levels without one.
    pub fn new(name: impl Into<String>, levels: Vec<ComparisonLevel>) -> Result<Self, LinkError> {
        let name = name.into();
        let Some(last) = levels.last() else {
            return Err(LinkError::Configuration(format!("comparison '{name}' has no levels")));
        };
        if !last.is_else_level() {
            return Err(LinkError::Configuration(format!(
                "comparison '{name}': last level must be an else level"
            )));
        }
        for (i, level) in levels.iter().enumerate() {
            if level.is_else_level() && i + 1 != levels.len() {
                return Err(LinkError::Configuration(format!(
                    "comparison '{name}': else level at position {i} is not last"
                )));
            }
            if level.is_null_level() && i != 0 {
                return Err(LinkError::Configuration(format!(
                    "comparison '{name}': null level must come first, found at position {i}"
                )));
            }
            for (what, p) in [("m", level.m_probability), ("u", level.u_probability)] {
                if let Some(p) = p {
                    if !(p > 0.0 && p < 1.0) {
                        return Err(LinkError::Configuration(format!(
                            "comparison '{name}', level '{}': {what}_probability {p} outside (0, 1)",
                            level.label
                        )));
                    }
                }
            }
        }

        let mut comparison = Self { name, levels };
        if comparison.data_level_indices().len() < 2 {
            return Err(LinkError::Configuration(format!(
                "comparison '{}' needs at least one level before the else level",
                comparison.name
            )));
        }
        comparison.fill_default_probabilities();
        Ok(comparison)
    }

    /// Linearly decreasing m and increasing u over the non-null levels, normalised.
    fn fill_default_probabilities(&mut self) {
        let indices = self.data_level_indices();
        let k = indices.len() as f64;
        let total = k * (k + 1.0) / 2.0;
        for (rank, &i) in indices.iter().enumerate() {
            let level = &mut self.levels[i];
            let rank = rank as f64;
            if level.m_probability.is_none() {
                level.m_probability = Some((k - rank) / total);
            }
            if level.u_probability.is_none() {
                level.u_probability = Some((rank + 1.0) / total);
            }
        }
    }

    /// Indices of every level except the null level.
    pub fn data_level_indices(&self) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_null_level())
            .map(|(i, _)| i)
            .collect()
    }

    /// The first non-null level.
    pub fn most_specific_level(&self) -> usize {
        self.data_level_indices().first().copied().unwrap_or(0)
    }

    pub fn else_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn null_level(&self) -> Option<usize> {
        self.levels.iter().position(ComparisonLevel::is_null_level)
    }

    pub fn input_columns(&self) -> BTreeSet<String> {
        self.levels.iter().flat_map(|l| l.predicate.columns()).collect()
    }

    pub fn level_id(&self, level: usize) -> LevelId {
        LevelId::new(&self.name, level)
    }

    pub fn populate_from_trained(&mut self) {
        for level in &mut self.levels {
            level.populate_from_trained();
        }
    }
}

// ---------------------------------------------------------------------------
// Level library
// ---------------------------------------------------------------------------

pub fn null_level(column: &str) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::null(column))
}

pub fn else_level() -> ComparisonLevel {
    ComparisonLevel::new(Predicate::Else)
}

pub fn exact_match_level(column: &str) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::exact(column)).with_label(format!("Exact match {column}"))
}

pub fn levenshtein_level(column: &str, max_distance: usize) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::Levenshtein { column: column.to_string(), max_distance })
        .with_label(format!("Levenshtein {column} <= {max_distance}"))
}

pub fn jaro_winkler_level(column: &str, min_similarity: f64) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::JaroWinkler { column: column.to_string(), min_similarity })
        .with_label(format!("Jaro-Winkler {column} >= {min_similarity}"))
}

pub fn jaccard_level(column: &str, min_similarity: f64) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::Jaccard { column: column.to_string(), min_similarity })
        .with_label(format!("Jaccard {column} >= {min_similarity}"))
}

pub fn array_intersect_level(column: &str, min_size: usize) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::ArrayIntersect { column: column.to_string(), min_size })
        .with_label(format!("Array intersect {column} size >= {min_size}"))
}

pub fn distance_in_km_level(lat_column: &str, long_column: &str, max_km: f64) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::DistanceInKm {
        lat_column: lat_column.to_string(),
        long_column: long_column.to_string(),
        max_km,
    })
    .with_label(format!("Distance <= {max_km}km"))
}

pub fn columns_reversed_level(column_1: &str, column_2: &str) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::ColumnsReversed {
        column_1: column_1.to_string(),
        column_2: column_2.to_string(),
    })
    .with_label(format!("{column_1} and {column_2} reversed"))
}

pub fn datediff_level(column: &str, max_difference: i64, unit: DateUnit) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::DateDiff { column: column.to_string(), max_difference, unit })
        .with_label(format!("{column} within {max_difference} {unit}(s)"))
}

pub fn regex_extract_level(column: &str, pattern: &str) -> ComparisonLevel {
    ComparisonLevel::new(Predicate::RegexExtractMatch {
        column: column.to_string(),
        pattern: pattern.to_string(),
    })
    .with_label(format!("Exact match {column} on '{pattern}'"))
}
