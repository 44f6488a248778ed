use std::path::Path;

use serde::Deserialize;

use crate::comparison::{Comparison, ComparisonLevel, LevelId};
use crate::em::EmOptions;
use crate::error::LinkError;
use crate::model::LinkType;
use crate::predicate::{BlockingRule, Predicate, PredicateCompiler};
use crate::state::{ModelState, DEFAULT_EM_CONVERGENCE, DEFAULT_MAX_CANDIDATE_PAIRS, DEFAULT_MAX_ITERATIONS};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LinkerConfig {
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default = "default_unique_id_column")]
    pub unique_id_column: String,
    #[serde(default)]
    pub source_dataset_column: Option<String>,
    pub probability_two_random_records_match: f64,
    #[serde(default)]
    pub blocking_rules_to_generate_predictions: Vec<BlockingRule>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_em_convergence")]
    pub em_convergence: f64,
    #[serde(default = "default_max_candidate_pairs")]
    pub max_candidate_pairs: u64,
    pub comparisons: Vec<ComparisonConfig>,
    #[serde(default)]
    pub u_training: Option<UTrainingConfig>,
    #[serde(default)]
    pub m_training: Option<MTrainingConfig>,
    #[serde(default)]
    pub training: Vec<TrainingConfig>,
}

fn default_unique_id_column() -> String {
    "unique_id".into()
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

fn default_em_convergence() -> f64 {
    DEFAULT_EM_CONVERGENCE
}

fn default_max_candidate_pairs() -> u64 {
    DEFAULT_MAX_CANDIDATE_PAIRS
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ComparisonConfig {
    pub name: String,
    pub levels: Vec<LevelConfig>,
}

/// One level. The predicate's fields sit beside the level's own, selected by
/// `kind`.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    #[serde(flatten)]
    pub predicate: Predicate,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub m_probability: Option<f64>,
    #[serde(default)]
    pub u_probability: Option<f64>,
    #[serde(default)]
    pub tf_adjustment_column: Option<String>,
    #[serde(default)]
    pub tf_adjustment_weight: Option<f64>,
    #[serde(default)]
    pub tf_minimum_u_value: Option<f64>,
}

impl LevelConfig {
    fn build(&self) -> ComparisonLevel {
        let mut level = ComparisonLevel::new(self.predicate.clone());
        if let Some(label) = &self.label {
            level.label = label.clone();
        }
        level.m_probability = self.m_probability;
        level.u_probability = self.u_probability;
        level.tf_adjustment_column = self.tf_adjustment_column.clone();
        if let Some(w) = self.tf_adjustment_weight {
            level.tf_adjustment_weight = w;
        }
        if let Some(floor) = self.tf_minimum_u_value {
            level.tf_minimum_u_value = floor;
        }
        level
    }
}

// ---------------------------------------------------------------------------
// Training sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UTrainingConfig {
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_max_pairs() -> usize {
    1_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MTrainingConfig {
    pub label_column: String,
}

/// One EM session, run in file order.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub blocking_rule: BlockingRule,
    #[serde(default)]
    pub fix_u_probabilities: bool,
    #[serde(default)]
    pub fix_m_probabilities: bool,
    #[serde(default)]
    pub fix_proportion_of_matches: bool,
    #[serde(default)]
    pub comparisons_to_deactivate: Option<Vec<String>>,
    #[serde(default)]
    pub comparison_levels_to_reverse: Option<Vec<LevelId>>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub convergence_threshold: Option<f64>,
}

impl TrainingConfig {
    pub fn options(&self) -> EmOptions {
        EmOptions {
            fix_u_probabilities: self.fix_u_probabilities,
            fix_m_probabilities: self.fix_m_probabilities,
            fix_proportion_of_matches: self.fix_proportion_of_matches,
            comparisons_to_deactivate: self
                .comparisons_to_deactivate
                .as_ref()
                .map(|names| names.iter().cloned().collect()),
            comparison_levels_to_reverse: self
                .comparison_levels_to_reverse
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
            max_iterations: self.max_iterations,
            convergence_threshold: self.convergence_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl LinkerConfig {
    pub fn from_toml(input: &str) -> Result<Self, LinkError> {
        let config: LinkerConfig =
            toml::from_str(input).map_err(|e| LinkError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, LinkError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&input)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.unique_id_column.is_empty() {
            return Err(LinkError::Configuration("unique_id_column must not be empty".into()));
        }
        if self.max_iterations == 0 {
            return Err(LinkError::Configuration("max_iterations must be at least 1".into()));
        }
        if !(self.em_convergence > 0.0) {
            return Err(LinkError::Configuration(format!(
                "em_convergence must be positive, got {}",
                self.em_convergence
            )));
        }
        for session in &self.training {
            if let Some(t) = session.convergence_threshold {
                if !(t > 0.0) {
                    return Err(LinkError::Configuration(format!(
                        "training on '{}': convergence_threshold must be positive, got {t}",
                        session.blocking_rule
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build and compile the Model State with the given dialect.
    pub fn build_model<C: PredicateCompiler>(&self, compiler: &C) -> Result<ModelState, LinkError> {
        let comparisons = self
            .comparisons
            .iter()
            .map(|c| Comparison::new(c.name.clone(), c.levels.iter().map(LevelConfig::build).collect()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ModelState::new(compiler, self.link_type, comparisons, self.probability_two_random_records_match)?
            .with_blocking_rules(compiler, self.blocking_rules_to_generate_predictions.clone())?
            .with_training_limits(self.max_iterations, self.em_convergence)
            .with_max_candidate_pairs(self.max_candidate_pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    const SETTINGS: &str = r#"
link_type = "dedupe_only"
probability_two_random_records_match = 0.01
blocking_rules_to_generate_predictions = ["l.surname = r.surname", "l.dob = r.dob"]
max_iterations = 10

[[comparisons]]
name = "first_name"

[[comparisons.levels]]
kind = "null"
column = "first_name"

[[comparisons.levels]]
kind = "exact_match"
column = "first_name"
tf_adjustment_column = "first_name"
m_probability = 0.9
u_probability = 0.01

[[comparisons.levels]]
kind = "jaro_winkler"
column = "first_name"
min_similarity = 0.88

[[comparisons.levels]]
kind = "else"

[[comparisons]]
name = "dob"

[[comparisons.levels]]
kind = "exact_match"
column = "dob"

[[comparisons.levels]]
kind = "else"

[u_training]
max_pairs = 5000
seed = 7

[[training]]
blocking_rule = "l.dob = r.dob"

[[training]]
blocking_rule = "l.first_name = r.first_name"
fix_u_probabilities = true
max_iterations = 5
"#;

    #[test]
    fn parse_and_build() {
        let config = LinkerConfig::from_toml(SETTINGS).unwrap();
        assert_eq!(config.unique_id_column, "unique_id");
        assert_eq!(config.em_convergence, DEFAULT_EM_CONVERGENCE);
        assert_eq!(config.training.len(), 2);
        assert!(config.training[1].options().fix_u_probabilities);
        assert_eq!(config.training[1].options().max_iterations, Some(5));
        assert_eq!(config.u_training.as_ref().unwrap().max_pairs, 5000);

        let model = config.build_model(&MemoryBackend::new()).unwrap();
        assert_eq!(model.max_iterations, 10);
        assert_eq!(model.blocking_rules_to_generate_predictions.len(), 2);
        let first = &model.comparisons[0];
        assert_eq!(first.levels.len(), 4);
        assert_eq!(first.levels[1].m_probability, Some(0.9));
        assert_eq!(first.levels[1].tf_adjustment_column.as_deref(), Some("first_name"));
        assert!(first.levels[2].m_probability.is_some());
    }

    #[test]
    fn parse_error_is_config_parse() {
        let err = LinkerConfig::from_toml("comparisons = 3").unwrap_err();
        assert!(matches!(err, LinkError::ConfigParse(_)));
    }

    #[test]
    fn bad_comparison_fails_at_build() {
        let input = r#"
probability_two_random_records_match = 0.01

[[comparisons]]
name = "x"

[[comparisons.levels]]
kind = "exact_match"
column = "x"
"#;
        let config = LinkerConfig::from_toml(input).unwrap();
        let err = config.build_model(&MemoryBackend::new()).unwrap_err();
        assert!(err.to_string().contains("else"));
    }

    #[test]
    fn zero_iterations_rejected() {
        let input = SETTINGS.replace("max_iterations = 10", "max_iterations = 0");
        assert!(matches!(LinkerConfig::from_toml(&input), Err(LinkError::Configuration(_))));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, SETTINGS).unwrap();
        assert!(LinkerConfig::from_file(&path).is_ok());
    }
}
