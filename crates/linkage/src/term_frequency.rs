use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::backend::{fetch, Backend, QueryDescription, QueryResult};
use crate::error::LinkError;
use crate::model::Record;

/// Relative frequency of each non-null value of one column.
#[derive(Debug, Clone, Serialize)]
pub struct TermFrequencyTable {
    pub column: String,
    frequencies: HashMap<String, f64>,
}

impl TermFrequencyTable {
    pub fn from_counts(column: &str, counts: &[(String, u64)]) -> Self {
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        let frequencies = counts
            .iter()
            .filter(|_| total > 0)
            .map(|(value, n)| (value.clone(), *n as f64 / total as f64))
            .collect();
        Self { column: column.to_string(), frequencies }
    }

    /// Caller-supplied frequencies, e.g. from a larger reference population.
    pub fn from_frequencies(column: &str, frequencies: HashMap<String, f64>) -> Self {
        Self { column: column.to_string(), frequencies }
    }

    pub fn frequency(&self, value: &str) -> Option<f64> {
        self.frequencies.get(value).copied()
    }

    /// The greater of the two sides' frequencies.
    pub fn pair_frequency(&self, left: Option<&str>, right: Option<&str>) -> Option<f64> {
        let l = left.and_then(|v| self.frequency(v));
        let r = right.and_then(|v| self.frequency(v));
        match (l, r) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }
}

/// Compute a table for each column through the backend.
pub fn compute_tf_tables<B: Backend>(
    backend: &B,
    records: &[Record],
    columns: &BTreeSet<String>,
) -> Result<BTreeMap<String, TermFrequencyTable>, LinkError> {
    let mut tables = BTreeMap::new();
    for column in columns {
        let result = fetch(backend, &QueryDescription::TermFrequencies { column }, records)?;
        let QueryResult::Frequencies(counts) = result.as_ref() else {
            return Err(LinkError::Backend(format!(
                "term frequencies for '{column}' returned {}",
                result.kind()
            )));
        };
        log::debug!("term frequencies for '{column}': {} distinct values", counts.len());
        tables.insert(column.clone(), TermFrequencyTable::from_counts(column, counts));
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn frequencies_normalise() {
        let t = TermFrequencyTable::from_counts(
            "surname",
            &[("smith".into(), 3), ("jones".into(), 1)],
        );
        assert_eq!(t.frequency("smith"), Some(0.75));
        assert_eq!(t.frequency("brown"), None);
        assert_eq!(t.pair_frequency(Some("jones"), Some("smith")), Some(0.75));
        assert_eq!(t.pair_frequency(None, Some("jones")), Some(0.25));
    }

    #[test]
    fn computed_through_backend() {
        let records = vec![
            Record::new("1", "t").with("city", "leeds"),
            Record::new("2", "t").with("city", "leeds"),
            Record::new("3", "t").with("city", "york"),
            Record::new("4", "t").with("city", ""),
        ];
        let tables = compute_tf_tables(
            &MemoryBackend::new(),
            &records,
            &BTreeSet::from(["city".to_string()]),
        )
        .unwrap();
        let city = &tables["city"];
        assert_eq!(city.len(), 2);
        assert!((city.frequency("leeds").unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }
}
