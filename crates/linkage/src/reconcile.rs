//! Global match prior from the history of EM sessions.
//!
//! Each session's prior is conditional on its blocking rule. Dividing out the
//! bayes factors of the levels the rule implies recovers an unconditional
//! estimate; the reconciled prior is the median across sessions. Recomputed
//! from the full history every time, so session order never matters.

use serde::Serialize;

use crate::em::SessionRecord;
use crate::error::LinkError;
use crate::scoring::{bayes_factor_to_prob, prob_to_bayes_factor};
use crate::state::ModelState;

/// Median of the values, `None` when empty. NaNs sort last.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorEstimate {
    pub session: usize,
    pub blocking_rule: String,
    pub conditional: f64,
    pub reversed: f64,
    /// False when some reversed level had no estimate from another source.
    pub fully_trained: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub estimates: Vec<PriorEstimate>,
    pub probability_two_random_records_match: f64,
    pub fully_trained: bool,
}

pub fn reverse_session(model: &ModelState, session: &SessionRecord) -> Result<PriorEstimate, LinkError> {
    let mut bf = prob_to_bayes_factor(session.probability_two_random_records_match);
    let mut fully_trained = true;
    for id in &session.levels_to_reverse {
        let level = model.level(id)?;
        let level_bf = match level.trained_bayes_factor_excluding(session.id) {
            Some(trained) => trained,
            None => {
                fully_trained = false;
                level.bayes_factor()?
            }
        };
        bf /= level_bf;
    }
    let reversed = bayes_factor_to_prob(bf);
    if !reversed.is_finite() {
        return Err(LinkError::DegenerateParameter(format!(
            "reversing session {} gives prior {reversed}",
            session.id
        )));
    }
    Ok(PriorEstimate {
        session: session.id,
        blocking_rule: session.blocking_rule.clone(),
        conditional: session.probability_two_random_records_match,
        reversed,
        fully_trained,
    })
}

/// Sessions that fixed the proportion of matches contribute nothing. With no
/// contributing session the model's prior stands.
pub fn reconcile(model: &ModelState, sessions: &[SessionRecord]) -> Result<Reconciliation, LinkError> {
    let estimates = sessions
        .iter()
        .filter(|s| !s.fix_proportion_of_matches && s.state.is_finished())
        .map(|s| reverse_session(model, s))
        .collect::<Result<Vec<_>, _>>()?;

    let reversed: Vec<f64> = estimates.iter().map(|e| e.reversed).collect();
    let probability_two_random_records_match =
        median(&reversed).unwrap_or(model.probability_two_random_records_match);
    let fully_trained = estimates.iter().all(|e| e.fully_trained);
    if !fully_trained {
        log::warn!(
            "probability_two_random_records_match is not fully trained: some blocked levels have no estimate from another session"
        );
    }
    Ok(Reconciliation { estimates, probability_two_random_records_match, fully_trained })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::comparison::{else_level, exact_match_level, Comparison, LevelId, TrainedValue, TrainingSource};
    use crate::em::SessionState;
    use crate::memory::MemoryBackend;
    use crate::model::LinkType;

    fn model() -> ModelState {
        let comps = vec![
            Comparison::new("a", vec![exact_match_level("a").with_m(0.9).with_u(0.1), else_level()]).unwrap(),
            Comparison::new("b", vec![exact_match_level("b").with_m(0.8).with_u(0.05), else_level()]).unwrap(),
        ];
        ModelState::new(&MemoryBackend::new(), LinkType::DedupeOnly, comps, 0.01).unwrap()
    }

    fn session(id: usize, prior: f64, reverse: &str) -> SessionRecord {
        SessionRecord {
            id,
            blocking_rule: format!("l.{reverse} = r.{reverse}"),
            state: SessionState::Converged,
            pairs: 100,
            iterations: 5,
            probability_two_random_records_match: prior,
            fix_proportion_of_matches: false,
            deactivated: BTreeSet::from([reverse.to_string()]),
            levels_to_reverse: BTreeSet::from([LevelId::new(reverse, 0)]),
            warnings: Vec::new(),
        }
    }

    fn em_value(value: f64, session: usize) -> TrainedValue {
        TrainedValue { value, source: TrainingSource::Em { session, blocking_rule: "x".into() } }
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }

    #[test]
    fn untrained_level_uses_configured_value() {
        let m = model();
        // conditional odds 1:1, level a bayes factor 9 -> odds 1:9
        let r = reconcile(&m, &[session(0, 0.5, "a")]).unwrap();
        assert!((r.probability_two_random_records_match - 0.1).abs() < 1e-12);
        assert!(!r.fully_trained);
    }

    #[test]
    fn trained_level_from_other_session_is_used() {
        let mut m = model();
        let level = m.level_mut(&LevelId::new("a", 0)).unwrap();
        level.trained_m.push(em_value(0.6, 1));
        level.trained_u.push(em_value(0.2, 1));
        // own-session values must be ignored
        level.trained_m.push(em_value(0.99, 0));
        level.trained_u.push(em_value(0.01, 0));
        let r = reconcile(&m, &[session(0, 0.75, "a")]).unwrap();
        // odds 3 / bf 3 = 1
        assert!((r.probability_two_random_records_match - 0.5).abs() < 1e-12);
        assert!(r.fully_trained);
    }

    #[test]
    fn median_across_sessions_is_order_independent() {
        let m = model();
        let sessions = vec![session(0, 0.5, "a"), session(1, 0.8, "b"), session(2, 0.2, "a")];
        let forward = reconcile(&m, &sessions).unwrap();
        let mut backward = sessions.clone();
        backward.reverse();
        let backward = reconcile(&m, &backward).unwrap();
        assert_eq!(
            forward.probability_two_random_records_match,
            backward.probability_two_random_records_match
        );
        assert_eq!(forward.estimates.len(), 3);
    }

    #[test]
    fn fixed_proportion_sessions_are_skipped() {
        let m = model();
        let mut s = session(0, 0.5, "a");
        s.fix_proportion_of_matches = true;
        let r = reconcile(&m, &[s]).unwrap();
        assert!(r.estimates.is_empty());
        assert_eq!(r.probability_two_random_records_match, 0.01);
    }
}
