//! The owning linking session.
//!
//! Holds the input records, the backend and the current Model State behind a
//! lock. Readers take an `Arc` snapshot; training folds results back by
//! replacing the snapshot wholesale under the lock, so a concurrent prediction
//! sees either the old or the new model, never a mix.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::blocking::{self, CandidateSet};
use crate::comparison::{LevelId, TrainedValue, TrainingSource};
use crate::em::{CancelToken, EmOptions, EmTrainingSession, SessionRecord};
use crate::error::LinkError;
use crate::estimate;
use crate::model::{CandidatePair, ComparisonVector, LinkType, PredictionRow, Record, ScoredPair, Table};
use crate::predicate::BlockingRule;
use crate::reconcile::{self, Reconciliation};
use crate::scoring;
use crate::state::ModelState;
use crate::term_frequency::compute_tf_tables;
use crate::vectors;

#[derive(Debug)]
struct LinkerState {
    model: Arc<ModelState>,
    sessions: Vec<SessionRecord>,
}

pub struct Linker<B: Backend> {
    backend: Arc<B>,
    records: Arc<Vec<Record>>,
    state: Mutex<LinkerState>,
    next_session: AtomicUsize,
}

impl<B: Backend> Linker<B> {
    /// Concatenates the tables and computes term-frequency tables for every
    /// adjusted column the model does not already carry one for.
    pub fn new(backend: B, model: ModelState, tables: Vec<Table>) -> Result<Self, LinkError> {
        match (model.link_type, tables.len()) {
            (_, 0) => return Err(LinkError::Configuration("no input tables".into())),
            (LinkType::DedupeOnly, n) if n != 1 => {
                return Err(LinkError::Configuration(format!(
                    "dedupe_only takes exactly one table, got {n}"
                )))
            }
            (LinkType::LinkOnly, 1) => {
                return Err(LinkError::Configuration("link_only needs at least two tables".into()))
            }
            _ => {}
        }

        let mut names = HashSet::new();
        for table in &tables {
            if !names.insert(table.name.as_str()) {
                return Err(LinkError::Configuration(format!("duplicate table name '{}'", table.name)));
            }
        }

        let columns: Vec<String> = model
            .comparisons
            .iter()
            .flat_map(|c| c.input_columns())
            .chain(model.tf_columns())
            .collect();
        for table in &tables {
            let Some(first) = table.records.first() else {
                continue;
            };
            if let Some(column) = columns.iter().find(|c| !first.fields.contains_key(*c)) {
                return Err(LinkError::MissingColumn {
                    table: table.name.clone(),
                    column: column.clone(),
                });
            }
        }

        let mut records = Vec::new();
        for table in tables {
            for mut record in table.records {
                if record.source_dataset.is_empty() {
                    record.source_dataset = table.name.clone();
                }
                records.push(record);
            }
        }

        let backend = Arc::new(backend);
        let mut model = model;
        let missing: std::collections::BTreeSet<String> = model
            .tf_columns()
            .into_iter()
            .filter(|c| model.tf_table(c).is_none())
            .collect();
        if !missing.is_empty() {
            let mut tf: BTreeMap<_, _> = model.tf_tables.as_ref().clone();
            tf.extend(compute_tf_tables(backend.as_ref(), &records, &missing)?);
            model.tf_tables = Arc::new(tf);
        }

        log::info!(
            "linker ready: {} records, {} comparisons, {} dialect",
            records.len(),
            model.comparisons.len(),
            model.dialect
        );
        Ok(Self {
            backend,
            records: Arc::new(records),
            state: Mutex::new(LinkerState { model: Arc::new(model), sessions: Vec::new() }),
            next_session: AtomicUsize::new(0),
        })
    }

    /// Consistent snapshot of the current model.
    pub fn model(&self) -> Arc<ModelState> {
        Arc::clone(&self.state.lock().model)
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().sessions.clone()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Apply `f` to a copy of the current model and install the result.
    fn update<T>(&self, f: impl FnOnce(&mut LinkerState, &mut ModelState) -> Result<T, LinkError>) -> Result<T, LinkError> {
        let mut state = self.state.lock();
        let mut model = state.model.as_ref().clone();
        let out = f(&mut state, &mut model)?;
        state.model = Arc::new(model);
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Blocking, vectors, scoring
    // ---------------------------------------------------------------------

    /// Pair count of each prediction blocking rule.
    pub fn count_candidates(&self) -> Result<Vec<(String, u64)>, LinkError> {
        let model = self.model();
        blocking::count_candidates(
            self.backend.as_ref(),
            &self.records,
            &model.blocking_rules_to_generate_predictions,
            model.link_type,
        )
    }

    pub fn generate_candidates(&self, rules: &[BlockingRule]) -> Result<CandidateSet, LinkError> {
        let model = self.model();
        blocking::generate_candidates(
            self.backend.as_ref(),
            &self.records,
            rules,
            model.link_type,
            model.max_candidate_pairs,
        )
    }

    /// Pairs of the prediction blocking rules, unscored.
    pub fn deterministic_link(&self) -> Result<CandidateSet, LinkError> {
        let rules = self.model().blocking_rules_to_generate_predictions.clone();
        self.generate_candidates(&rules)
    }

    pub fn evaluate_vectors(&self, pairs: &[CandidatePair]) -> Result<Vec<ComparisonVector>, LinkError> {
        vectors::evaluate_vectors(self.backend.as_ref(), &self.records, pairs, &self.model())
    }

    pub fn score(&self, vectors: &[ComparisonVector]) -> Result<Vec<ScoredPair>, LinkError> {
        scoring::score(vectors, &self.model())
    }

    /// Block, compare and score with one model snapshot throughout.
    pub fn predict(&self) -> Result<Vec<PredictionRow>, LinkError> {
        let model = self.model();
        let candidates = blocking::generate_candidates(
            self.backend.as_ref(),
            &self.records,
            &model.blocking_rules_to_generate_predictions,
            model.link_type,
            model.max_candidate_pairs,
        )?;
        let vectors = vectors::evaluate_vectors(self.backend.as_ref(), &self.records, &candidates.pairs, &model)?;
        let scored = scoring::score(&vectors, &model)?;
        log::info!("scored {} candidate pairs", scored.len());
        Ok(scored.into_iter().map(|s| self.prediction_row(s)).collect())
    }

    fn prediction_row(&self, scored: ScoredPair) -> PredictionRow {
        let l = &self.records[scored.pair.left];
        let r = &self.records[scored.pair.right];
        PredictionRow {
            unique_id_l: l.unique_id.clone(),
            unique_id_r: r.unique_id.clone(),
            source_dataset_l: l.source_dataset.clone(),
            source_dataset_r: r.source_dataset.clone(),
            match_key: scored.pair.match_key,
            levels: scored.levels,
            match_weight: scored.match_weight,
            match_probability: scored.match_probability,
        }
    }

    // ---------------------------------------------------------------------
    // Training
    // ---------------------------------------------------------------------

    pub fn train(&self, blocking_rule: BlockingRule, options: EmOptions) -> Result<EmTrainingSession, LinkError> {
        self.train_with_cancel(blocking_rule, options, &CancelToken::new())
    }

    /// EM on one blocking rule. The session trains against a snapshot; only a
    /// finished session is folded back, followed by repopulating m/u from the
    /// trained medians and reconciling the prior over the whole history.
    pub fn train_with_cancel(
        &self,
        blocking_rule: BlockingRule,
        options: EmOptions,
        cancel: &CancelToken,
    ) -> Result<EmTrainingSession, LinkError> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.model();
        let mut session = EmTrainingSession::new(id, &snapshot, blocking_rule, options);
        session.initialize()?;
        session.prepare(self.backend.as_ref(), &self.records)?;
        session.run(cancel)?;

        self.update(|state, model| {
            session.fold_into(model)?;
            model.populate_m_u_from_trained_values();
            state.sessions.push(session.record());
            let reconciled = reconcile::reconcile(model, &state.sessions)?;
            model.probability_two_random_records_match = reconciled.probability_two_random_records_match;
            Ok(())
        })?;
        Ok(session)
    }

    /// EM for m only, with u held at its current values.
    pub fn train_m_using_expectation_maximisation(
        &self,
        blocking_rule: BlockingRule,
    ) -> Result<EmTrainingSession, LinkError> {
        self.train(blocking_rule, EmOptions::default().fix_u())
    }

    pub fn estimate_u_using_random_sampling(&self, max_pairs: usize, seed: u64) -> Result<(), LinkError> {
        let snapshot = self.model();
        let estimates = estimate::estimate_u_using_random_sampling(
            self.backend.as_ref(),
            &self.records,
            &snapshot,
            max_pairs,
            seed,
        )?;
        self.apply_estimates(&estimates, TrainingSource::RandomSampling, false)
    }

    pub fn estimate_m_from_label_column(&self, label_column: &str) -> Result<(), LinkError> {
        let snapshot = self.model();
        let estimates = estimate::estimate_m_from_label_column(
            self.backend.as_ref(),
            &self.records,
            &snapshot,
            label_column,
        )?;
        let source = TrainingSource::LabelColumn { column: label_column.to_string() };
        self.apply_estimates(&estimates, source, true)
    }

    fn apply_estimates(
        &self,
        estimates: &[(LevelId, f64)],
        source: TrainingSource,
        is_m: bool,
    ) -> Result<(), LinkError> {
        self.update(|_, model| {
            for (id, value) in estimates {
                let level = model.level_mut(id)?;
                let trained = TrainedValue { value: *value, source: source.clone() };
                if is_m {
                    level.trained_m.push(trained);
                } else {
                    level.trained_u.push(trained);
                }
            }
            model.populate_m_u_from_trained_values();
            Ok(())
        })
    }

    /// Recompute the global prior from every recorded session and write it
    /// into the model.
    pub fn reconcile(&self) -> Result<Reconciliation, LinkError> {
        self.update(|state, model| {
            let reconciled = reconcile::reconcile(model, &state.sessions)?;
            model.probability_two_random_records_match = reconciled.probability_two_random_records_match;
            Ok(reconciled)
        })
    }
}
