//! `linkwise validate | count | run`: settings-driven linkage.

use std::path::{Path, PathBuf};

use serde::Serialize;

use linkwise_linkage::load::load_csv_file;
use linkwise_linkage::model::PredictionSummary;
use linkwise_linkage::summary::compute_summary;
use linkwise_linkage::{
    Linker, LinkerConfig, MemoryBackend, ModelState, PredictionRow, Reconciliation, SessionRecord,
};

use crate::exit_codes::EXIT_LINK_IO;
use crate::CliError;

#[derive(Serialize)]
struct RunOutput<'a> {
    model: &'a ModelState,
    sessions: &'a [SessionRecord],
    reconciliation: &'a Reconciliation,
    summary: &'a PredictionSummary,
    predictions: &'a [PredictionRow],
}

fn io_err(msg: impl Into<String>) -> CliError {
    CliError { code: EXIT_LINK_IO, message: msg.into(), hint: None }
}

fn load_config(settings: &Path) -> Result<LinkerConfig, CliError> {
    if !settings.exists() {
        return Err(CliError::args(format!("settings file not found: {}", settings.display()))
            .with_hint("pass the path to a .settings.toml file"));
    }
    Ok(LinkerConfig::from_file(settings)?)
}

fn build_linker(config: &LinkerConfig, csv: &[PathBuf]) -> Result<Linker<MemoryBackend>, CliError> {
    let backend = MemoryBackend::new();
    let model = config.build_model(&backend)?;
    let tables = csv
        .iter()
        .map(|path| load_csv_file(path, &config.unique_id_column, config.source_dataset_column.as_deref()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Linker::new(backend, model, tables)?)
}

pub fn cmd_validate(settings: PathBuf) -> Result<(), CliError> {
    let config = load_config(&settings)?;
    let model = config.build_model(&MemoryBackend::new())?;
    let levels: usize = model.comparisons.iter().map(|c| c.levels.len()).sum();
    eprintln!(
        "{}: {} comparisons, {} levels, {} prediction rules, {} training sessions",
        settings.display(),
        model.comparisons.len(),
        levels,
        model.blocking_rules_to_generate_predictions.len(),
        config.training.len(),
    );
    Ok(())
}

pub fn cmd_count(settings: PathBuf, csv: Vec<PathBuf>) -> Result<(), CliError> {
    let config = load_config(&settings)?;
    let linker = build_linker(&config, &csv)?;
    let counts = linker.count_candidates()?;

    let width = counts.iter().map(|(rule, _)| rule.len()).max().unwrap_or(0);
    for (rule, pairs) in &counts {
        println!("{rule:<width$}  {pairs}");
    }
    let total: u64 = counts.iter().map(|(_, pairs)| pairs).sum();
    eprintln!("{} rules, {} pairs before deduplication", counts.len(), total);
    Ok(())
}

pub fn cmd_run(
    settings: PathBuf,
    csv: Vec<PathBuf>,
    json_output: bool,
    output_file: Option<PathBuf>,
    threshold: f64,
) -> Result<(), CliError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(CliError::args(format!("--threshold must be within [0, 1], got {threshold}")));
    }
    let config = load_config(&settings)?;
    let linker = build_linker(&config, &csv)?;

    if let Some(u) = &config.u_training {
        linker.estimate_u_using_random_sampling(u.max_pairs, u.seed)?;
    }
    if let Some(m) = &config.m_training {
        linker.estimate_m_from_label_column(&m.label_column)?;
    }
    for training in &config.training {
        let session = linker.train(training.blocking_rule.clone(), training.options())?;
        eprintln!(
            "session {} on '{}': {:?} after {} iterations ({} pairs)",
            session.id(),
            session.blocking_rule(),
            session.state(),
            session.history().len(),
            session.vectors().len(),
        );
        for warning in session.warnings() {
            eprintln!("  warning: {warning}");
        }
    }
    let reconciliation = linker.reconcile()?;
    if !reconciliation.fully_trained {
        log::warn!("prior reconciled from partially trained sessions");
    }

    let predictions = linker.predict()?;
    let model = linker.model();
    let sessions = linker.sessions();
    let summary = compute_summary(&predictions, threshold, &model.blocking_rules_to_generate_predictions);

    let out = RunOutput {
        model: model.as_ref(),
        sessions: &sessions,
        reconciliation: &reconciliation,
        summary: &summary,
        predictions: &predictions,
    };
    let json_str = serde_json::to_string_pretty(&out)
        .map_err(|e| io_err(format!("JSON serialization error: {e}")))?;

    if let Some(ref path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| io_err(format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    }

    // Human summary to stderr
    eprintln!(
        "{} candidate pairs, {} at or above {}, mean match probability {:.4}",
        summary.total_pairs, summary.above_threshold, summary.threshold, summary.mean_match_probability,
    );
    eprintln!(
        "prior: {:.6} ({} session estimates{})",
        reconciliation.probability_two_random_records_match,
        reconciliation.estimates.len(),
        if reconciliation.fully_trained { "" } else { ", not fully trained" },
    );
    Ok(())
}
