//! Expectation-maximisation over the pairs of one blocking rule.
//!
//! A session trains a private copy of the model. Nothing reaches the owning
//! model until [`EmTrainingSession::fold_into`] is called on a finished session.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::backend::Backend;
use crate::blocking::generate_candidates;
use crate::comparison::{LevelId, TrainedValue, TrainingSource};
use crate::error::LinkError;
use crate::model::{ComparisonVector, Record};
use crate::predicate::BlockingRule;
use crate::scoring::{match_weight_to_prob, WeightTable};
use crate::state::ModelState;
use crate::vectors::evaluate_vectors;

// ---------------------------------------------------------------------------
// Options + cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmOptions {
    pub fix_u_probabilities: bool,
    pub fix_m_probabilities: bool,
    pub fix_proportion_of_matches: bool,
    /// `None` deactivates every comparison whose columns the rule covers.
    pub comparisons_to_deactivate: Option<BTreeSet<String>>,
    /// `None` reverses the most specific level of each deactivated comparison.
    pub comparison_levels_to_reverse: Option<BTreeSet<LevelId>>,
    /// `None` uses the model's `max_iterations`.
    pub max_iterations: Option<usize>,
    /// `None` uses the model's `em_convergence`.
    pub convergence_threshold: Option<f64>,
}

impl EmOptions {
    pub fn fix_u(mut self) -> Self {
        self.fix_u_probabilities = true;
        self
    }

    pub fn fix_m(mut self) -> Self {
        self.fix_m_probabilities = true;
        self
    }

    pub fn fix_proportion(mut self) -> Self {
        self.fix_proportion_of_matches = true;
        self
    }

    pub fn deactivate<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.comparisons_to_deactivate = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn reverse<I: IntoIterator<Item = LevelId>>(mut self, levels: I) -> Self {
        self.comparison_levels_to_reverse = Some(levels.into_iter().collect());
        self
    }

    pub fn with_limits(mut self, max_iterations: usize, convergence_threshold: f64) -> Self {
        self.max_iterations = Some(max_iterations);
        self.convergence_threshold = Some(convergence_threshold);
        self
    }
}

/// Shared flag checked at the top of every E-step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Session bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Initialized,
    Iterating,
    Converged,
    MaxIterationsReached,
    Cancelled,
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Converged | Self::MaxIterationsReached)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingWarning {
    NonConvergence { iterations: usize, last_delta: f64, threshold: f64 },
}

impl std::fmt::Display for TrainingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonConvergence { iterations, last_delta, threshold } => write!(
                f,
                "EM did not converge after {iterations} iterations (last change {last_delta:.6}, threshold {threshold})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub max_delta: f64,
    pub probability_two_random_records_match: f64,
}

/// What the owning linker keeps of a finished session for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: usize,
    pub blocking_rule: String,
    pub state: SessionState,
    pub pairs: usize,
    pub iterations: usize,
    /// Prior estimated on the blocked pairs, conditional on the rule.
    pub probability_two_random_records_match: f64,
    pub fix_proportion_of_matches: bool,
    pub deactivated: BTreeSet<String>,
    pub levels_to_reverse: BTreeSet<LevelId>,
    pub warnings: Vec<TrainingWarning>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EmTrainingSession {
    id: usize,
    blocking_rule: BlockingRule,
    options: EmOptions,
    model: ModelState,
    state: SessionState,
    deactivated: BTreeSet<String>,
    levels_to_reverse: BTreeSet<LevelId>,
    active: Vec<bool>,
    max_iterations: usize,
    convergence_threshold: f64,
    vectors: Vec<ComparisonVector>,
    history: Vec<IterationRecord>,
    warnings: Vec<TrainingWarning>,
}

impl EmTrainingSession {
    /// Snapshot `model` with its trained-value history dropped.
    pub fn new(id: usize, model: &ModelState, blocking_rule: BlockingRule, options: EmOptions) -> Self {
        let max_iterations = options.max_iterations.unwrap_or(model.max_iterations);
        let convergence_threshold = options.convergence_threshold.unwrap_or(model.em_convergence);
        Self {
            id,
            blocking_rule,
            options,
            model: model.training_copy(),
            state: SessionState::Created,
            deactivated: BTreeSet::new(),
            levels_to_reverse: BTreeSet::new(),
            active: Vec::new(),
            max_iterations,
            convergence_threshold,
            vectors: Vec::new(),
            history: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn expect_state(&self, expected: SessionState, action: &str) -> Result<(), LinkError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LinkError::Configuration(format!(
                "session {} cannot {action} in state {:?}",
                self.id, self.state
            )))
        }
    }

    /// Resolve deactivated comparisons and the levels to reverse.
    pub fn initialize(&mut self) -> Result<(), LinkError> {
        self.expect_state(SessionState::Created, "initialize")?;

        let deactivated = match &self.options.comparisons_to_deactivate {
            Some(names) => {
                for name in names {
                    if self.model.comparison(name).is_none() {
                        return Err(LinkError::Configuration(format!(
                            "cannot deactivate unknown comparison '{name}'"
                        )));
                    }
                }
                names.clone()
            }
            None => {
                let rule_columns = self.blocking_rule.predicate.columns();
                self.model
                    .comparisons
                    .iter()
                    .filter(|c| {
                        let cols = c.input_columns();
                        !cols.is_empty() && cols.is_subset(&rule_columns)
                    })
                    .map(|c| c.name.clone())
                    .collect()
            }
        };

        let levels_to_reverse = match &self.options.comparison_levels_to_reverse {
            Some(ids) => {
                for id in ids {
                    let level = self.model.level(id)?;
                    if level.is_null_level() {
                        return Err(LinkError::Configuration(format!(
                            "cannot reverse null level {id}"
                        )));
                    }
                }
                ids.clone()
            }
            None => self
                .model
                .comparisons
                .iter()
                .filter(|c| deactivated.contains(&c.name))
                .map(|c| c.level_id(c.most_specific_level()))
                .collect(),
        };

        self.active = self.model.comparisons.iter().map(|c| !deactivated.contains(&c.name)).collect();
        if !self.active.iter().any(|&a| a) {
            return Err(LinkError::Configuration(format!(
                "blocking rule '{}' deactivates every comparison, nothing left to train",
                self.blocking_rule
            )));
        }

        self.deactivated = deactivated;
        self.levels_to_reverse = levels_to_reverse;
        self.state = SessionState::Initialized;
        log::info!(
            "EM session {} on '{}': deactivated {:?}, reversing {:?}",
            self.id,
            self.blocking_rule,
            self.deactivated,
            self.levels_to_reverse.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Block on the session's rule and fix the training vectors.
    pub fn prepare<B: Backend>(&mut self, backend: &B, records: &[Record]) -> Result<(), LinkError> {
        self.expect_state(SessionState::Initialized, "prepare")?;
        let candidates = generate_candidates(
            backend,
            records,
            std::slice::from_ref(&self.blocking_rule),
            self.model.link_type,
            self.model.max_candidate_pairs,
        )?;
        let vectors = evaluate_vectors(backend, records, &candidates.pairs, &self.model)?;
        self.with_vectors(vectors)
    }

    /// Use precomputed training vectors in place of blocking.
    pub fn with_vectors(&mut self, vectors: Vec<ComparisonVector>) -> Result<(), LinkError> {
        self.expect_state(SessionState::Initialized, "load vectors")?;
        if vectors.is_empty() {
            return Err(LinkError::Configuration(format!(
                "blocking rule '{}' produced no training pairs",
                self.blocking_rule
            )));
        }
        let n = self.model.comparisons.len();
        if let Some(bad) = vectors.iter().find(|v| v.levels.len() != n) {
            return Err(LinkError::Configuration(format!(
                "training vector has {} levels, model has {n} comparisons",
                bad.levels.len()
            )));
        }
        log::debug!("EM session {}: {} training pairs", self.id, vectors.len());
        self.vectors = vectors;
        self.state = SessionState::Iterating;
        Ok(())
    }

    fn is_fixed(&self, id: &LevelId) -> bool {
        self.levels_to_reverse.contains(id)
    }

    /// One E-step plus M-step. Returns the largest absolute parameter change.
    pub fn iterate(&mut self, cancel: &CancelToken) -> Result<f64, LinkError> {
        self.expect_state(SessionState::Iterating, "iterate")?;
        if cancel.is_cancelled() {
            self.state = SessionState::Cancelled;
            log::info!("EM session {} cancelled after {} iterations", self.id, self.history.len());
            return Err(LinkError::Cancelled);
        }

        // E-step. Reversed levels of active comparisons carry no evidence here:
        // every training pair sits on them by construction.
        let mut table = WeightTable::new(&self.model);
        for id in &self.levels_to_reverse {
            if let Some(c) = self.model.comparison_index(&id.comparison) {
                if self.active[c] {
                    table.neutralize(c, id.level);
                }
            }
        }
        let model = &self.model;
        let active = self.active.as_slice();
        let probabilities: Vec<f64> = self
            .vectors
            .par_iter()
            .map(|v| table.match_weight(v, model, Some(active), false).map(match_weight_to_prob))
            .collect::<Result<_, _>>()?;

        // M-step
        let mut max_delta = 0.0f64;
        for c in 0..self.model.comparisons.len() {
            if !self.active[c] {
                continue;
            }
            let levels = self.model.comparisons[c].levels.len();
            let mut m_weight = vec![0.0; levels];
            let mut u_weight = vec![0.0; levels];
            for (v, &p) in self.vectors.iter().zip(&probabilities) {
                let level = v.levels[c];
                m_weight[level] += p;
                u_weight[level] += 1.0 - p;
            }
            let comparison = &self.model.comparisons[c];
            let name = comparison.name.clone();
            let free_levels: Vec<usize> = comparison
                .data_level_indices()
                .into_iter()
                .filter(|&l| !self.is_fixed(&LevelId::new(&name, l)))
                .collect();
            let m_total: f64 = free_levels.iter().map(|&l| m_weight[l]).sum();
            let u_total: f64 = free_levels.iter().map(|&l| u_weight[l]).sum();

            for l in free_levels {
                let level = &mut self.model.comparisons[c].levels[l];
                if !self.options.fix_m_probabilities && m_weight[l] > 0.0 && m_total > 0.0 {
                    let m = m_weight[l] / m_total;
                    max_delta = max_delta.max((m - level.m_probability.unwrap_or(m)).abs());
                    level.m_probability = Some(m);
                }
                if !self.options.fix_u_probabilities && u_weight[l] > 0.0 && u_total > 0.0 {
                    let u = u_weight[l] / u_total;
                    max_delta = max_delta.max((u - level.u_probability.unwrap_or(u)).abs());
                    level.u_probability = Some(u);
                }
            }
        }

        if !self.options.fix_proportion_of_matches {
            let lambda = probabilities.iter().sum::<f64>() / probabilities.len() as f64;
            if lambda > 0.0 && lambda < 1.0 {
                let previous = self.model.probability_two_random_records_match;
                max_delta = max_delta.max((lambda - previous).abs());
                self.model.probability_two_random_records_match = lambda;
            }
        }

        let record = IterationRecord {
            iteration: self.history.len() + 1,
            max_delta,
            probability_two_random_records_match: self.model.probability_two_random_records_match,
        };
        log::debug!(
            "EM session {} iteration {}: max change {:.6}, prior {:.6}",
            self.id,
            record.iteration,
            record.max_delta,
            record.probability_two_random_records_match
        );
        self.history.push(record);
        Ok(max_delta)
    }

    /// Iterate to convergence or the iteration ceiling, then record the trained
    /// values on the session's copy.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<(), LinkError> {
        self.expect_state(SessionState::Iterating, "run")?;
        let mut last_delta = f64::INFINITY;
        while self.history.len() < self.max_iterations {
            last_delta = self.iterate(cancel)?;
            if last_delta < self.convergence_threshold {
                self.state = SessionState::Converged;
                break;
            }
        }
        if self.state == SessionState::Iterating {
            self.state = SessionState::MaxIterationsReached;
            let warning = TrainingWarning::NonConvergence {
                iterations: self.history.len(),
                last_delta,
                threshold: self.convergence_threshold,
            };
            log::warn!("EM session {} on '{}': {warning}", self.id, self.blocking_rule);
            self.warnings.push(warning);
        } else {
            log::info!(
                "EM session {} converged after {} iterations",
                self.id,
                self.history.len()
            );
        }
        self.record_trained_values();
        Ok(())
    }

    fn record_trained_values(&mut self) {
        let source = TrainingSource::Em {
            session: self.id,
            blocking_rule: self.blocking_rule.to_string(),
        };
        for (c, comparison) in self.model.comparisons.iter_mut().enumerate() {
            if !self.active[c] {
                continue;
            }
            let name = comparison.name.clone();
            for (l, level) in comparison.levels.iter_mut().enumerate() {
                if level.is_null_level() || self.levels_to_reverse.contains(&LevelId::new(&name, l)) {
                    continue;
                }
                if !self.options.fix_m_probabilities {
                    if let Some(m) = level.m_probability {
                        level.trained_m.push(TrainedValue { value: m, source: source.clone() });
                    }
                }
                if !self.options.fix_u_probabilities {
                    if let Some(u) = level.u_probability {
                        level.trained_u.push(TrainedValue { value: u, source: source.clone() });
                    }
                }
            }
        }
    }

    /// Append this session's trained values to `target`'s accumulators.
    pub fn fold_into(&self, target: &mut ModelState) -> Result<(), LinkError> {
        if !self.state.is_finished() {
            return Err(LinkError::Configuration(format!(
                "session {} has not finished training ({:?})",
                self.id, self.state
            )));
        }
        for comparison in &self.model.comparisons {
            for (l, level) in comparison.levels.iter().enumerate() {
                if level.trained_m.is_empty() && level.trained_u.is_empty() {
                    continue;
                }
                let into = target.level_mut(&comparison.level_id(l))?;
                into.trained_m.extend(level.trained_m.iter().cloned());
                into.trained_u.extend(level.trained_u.iter().cloned());
            }
        }
        Ok(())
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id,
            blocking_rule: self.blocking_rule.to_string(),
            state: self.state,
            pairs: self.vectors.len(),
            iterations: self.history.len(),
            probability_two_random_records_match: self.model.probability_two_random_records_match,
            fix_proportion_of_matches: self.options.fix_proportion_of_matches,
            deactivated: self.deactivated.clone(),
            levels_to_reverse: self.levels_to_reverse.clone(),
            warnings: self.warnings.clone(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn blocking_rule(&self) -> &BlockingRule {
        &self.blocking_rule
    }

    /// The session's trained copy of the model.
    pub fn model(&self) -> &ModelState {
        &self.model
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn warnings(&self) -> &[TrainingWarning] {
        &self.warnings
    }

    pub fn deactivated(&self) -> &BTreeSet<String> {
        &self.deactivated
    }

    pub fn levels_to_reverse(&self) -> &BTreeSet<LevelId> {
        &self.levels_to_reverse
    }

    pub fn vectors(&self) -> &[ComparisonVector] {
        &self.vectors
    }
}
