//! Ready-made comparisons for common column shapes.

use crate::comparison::{
    datediff_level, distance_in_km_level, else_level, exact_match_level, jaro_winkler_level,
    levenshtein_level, null_level, regex_extract_level, Comparison, ComparisonLevel,
};
use crate::error::LinkError;
use crate::predicate::{DateUnit, Predicate};

const POSTCODE_SECTOR: &str = r"^[A-Za-z]{1,2}[0-9][A-Za-z0-9]? [0-9]";
const POSTCODE_DISTRICT: &str = r"^[A-Za-z]{1,2}[0-9][A-Za-z0-9]?";
const POSTCODE_AREA: &str = r"^[A-Za-z]{1,2}";

fn exact(column: &str, term_frequency_adjustments: bool) -> ComparisonLevel {
    let level = exact_match_level(column);
    if term_frequency_adjustments {
        level.with_tf_adjustments(column)
    } else {
        level
    }
}

pub fn exact_match(column: &str, term_frequency_adjustments: bool) -> Result<Comparison, LinkError> {
    Comparison::new(
        column,
        vec![null_level(column), exact(column, term_frequency_adjustments), else_level()],
    )
}

pub fn levenshtein_at_thresholds(
    column: &str,
    thresholds: &[usize],
    term_frequency_adjustments: bool,
) -> Result<Comparison, LinkError> {
    let mut levels = vec![null_level(column), exact(column, term_frequency_adjustments)];
    levels.extend(thresholds.iter().map(|&t| levenshtein_level(column, t)));
    levels.push(else_level());
    Comparison::new(column, levels)
}

pub fn jaro_winkler_at_thresholds(
    column: &str,
    thresholds: &[f64],
    term_frequency_adjustments: bool,
) -> Result<Comparison, LinkError> {
    let mut levels = vec![null_level(column), exact(column, term_frequency_adjustments)];
    levels.extend(thresholds.iter().map(|&t| jaro_winkler_level(column, t)));
    levels.push(else_level());
    Comparison::new(column, levels)
}

/// Null, exact, Jaro-Winkler >= 0.95, >= 0.88, else.
pub fn name_comparison(column: &str, term_frequency_adjustments: bool) -> Result<Comparison, LinkError> {
    jaro_winkler_at_thresholds(column, &[0.95, 0.88], term_frequency_adjustments)
}

/// Null, exact, one typo, within a month, a year, ten years, else.
pub fn date_comparison(column: &str) -> Result<Comparison, LinkError> {
    Comparison::new(
        column,
        vec![
            null_level(column),
            exact_match_level(column),
            levenshtein_level(column, 1),
            datediff_level(column, 1, DateUnit::Month),
            datediff_level(column, 1, DateUnit::Year),
            datediff_level(column, 10, DateUnit::Year),
            else_level(),
        ],
    )
}

/// UK-style postcodes: full, sector, district, area, else.
pub fn postcode_comparison(column: &str) -> Result<Comparison, LinkError> {
    Comparison::new(
        column,
        vec![
            null_level(column),
            exact_match_level(column),
            regex_extract_level(column, POSTCODE_SECTOR).with_label("Postcode sector match"),
            regex_extract_level(column, POSTCODE_DISTRICT).with_label("Postcode district match"),
            regex_extract_level(column, POSTCODE_AREA).with_label("Postcode area match"),
            else_level(),
        ],
    )
}

pub fn distance_in_km_at_thresholds(
    lat_column: &str,
    long_column: &str,
    thresholds_km: &[f64],
) -> Result<Comparison, LinkError> {
    let mut levels = vec![ComparisonLevel::new(Predicate::Or {
        predicates: vec![
            Predicate::null(lat_column),
            Predicate::null(long_column),
        ],
    })];
    levels.extend(
        thresholds_km
            .iter()
            .map(|&km| distance_in_km_level(lat_column, long_column, km)),
    );
    levels.push(else_level());
    Comparison::new(format!("{lat_column}_{long_column}"), levels)
}
