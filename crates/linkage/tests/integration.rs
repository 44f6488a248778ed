use std::collections::HashSet;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use linkwise_linkage::comparison::{else_level, exact_match_level};
use linkwise_linkage::config::LinkerConfig;
use linkwise_linkage::library;
use linkwise_linkage::load::load_csv_file;
use linkwise_linkage::summary::compute_summary;
use linkwise_linkage::{
    BlockingRule, Comparison, EmOptions, LevelId, LinkError, LinkType, Linker, MemoryBackend, ModelState,
    Record, Table,
};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture_linker(settings: &str, files: &[&str]) -> (LinkerConfig, Linker<MemoryBackend>) {
    let dir = fixtures_dir();
    let config = LinkerConfig::from_file(&dir.join(settings)).unwrap();
    let backend = MemoryBackend::new();
    let model = config.build_model(&backend).unwrap();
    let tables = files
        .iter()
        .map(|f| load_csv_file(&dir.join(f), &config.unique_id_column, None).unwrap())
        .collect();
    let linker = Linker::new(backend, model, tables).unwrap();
    (config, linker)
}

// -------------------------------------------------------------------------
// Fixture pipeline
// -------------------------------------------------------------------------

#[test]
fn people_pipeline_end_to_end() {
    let (config, linker) = fixture_linker("people.settings.toml", &["people.csv"]);

    let counts = linker.count_candidates().unwrap();
    assert_eq!(counts[0].1, 16);
    assert_eq!(counts[1].1, 9);

    let u = config.u_training.as_ref().unwrap();
    linker.estimate_u_using_random_sampling(u.max_pairs, u.seed).unwrap();
    for training in &config.training {
        let session = linker.train(training.blocking_rule.clone(), training.options()).unwrap();
        assert!(session.state().is_finished());
    }
    assert_eq!(linker.sessions().len(), 2);

    let model = linker.model();
    assert!(model.probability_two_random_records_match > 0.0);
    assert!(model.probability_two_random_records_match < 1.0);
    assert!(model.comparisons.iter().all(|c| c.levels[1].u_is_trained()));

    let rows = linker.predict().unwrap();
    assert_eq!(rows.len(), 18);
    let prob = |l: &str, r: &str| {
        rows.iter()
            .find(|p| p.unique_id_l == l && p.unique_id_r == r)
            .map(|p| p.match_probability)
            .unwrap()
    };
    assert!(prob("1", "2") > prob("1", "16"));
    assert!(prob("14", "15") > prob("3", "16"));

    let summary = compute_summary(&rows, 0.5, &model.blocking_rules_to_generate_predictions);
    assert_eq!(summary.total_pairs, 18);
    assert_eq!(summary.pairs_by_rule["l.dob = r.dob"], 2);

    let json = model.to_json().unwrap();
    assert!(json.contains("\"trained_m\""));
}

#[test]
fn link_only_pairs_cross_tables() {
    let backend = MemoryBackend::new();
    let comparisons = vec![
        library::jaro_winkler_at_thresholds("name", &[0.9], false).unwrap(),
        library::postcode_comparison("postcode").unwrap(),
    ];
    let model = ModelState::new(&backend, LinkType::LinkOnly, comparisons, 0.05)
        .unwrap()
        .with_blocking_rules(&backend, vec![BlockingRule::all()])
        .unwrap();
    let dir = fixtures_dir();
    let tables = vec![
        load_csv_file(&dir.join("customers_a.csv"), "unique_id", None).unwrap(),
        load_csv_file(&dir.join("customers_b.csv"), "unique_id", None).unwrap(),
    ];
    let linker = Linker::new(backend, model, tables).unwrap();
    let rows = linker.predict().unwrap();
    assert_eq!(rows.len(), 16);
    assert!(rows.iter().all(|r| r.source_dataset_l != r.source_dataset_r));

    let delta = rows.iter().find(|r| r.unique_id_l == "a4" && r.unique_id_r == "b4").unwrap();
    assert_eq!(delta.levels, vec![1, 1]);
    let blue_sky = rows.iter().find(|r| r.unique_id_l == "a2" && r.unique_id_r == "b2").unwrap();
    // YO1 7HH vs YO1 7HJ share the sector
    assert_eq!(blue_sky.levels[1], 2);
    assert!(delta.match_probability > blue_sky.match_probability);
}

#[test]
fn unreadable_settings_is_io_error() {
    let err = LinkerConfig::from_file(&fixtures_dir().join("missing.toml")).unwrap_err();
    assert!(matches!(err, LinkError::Io(_)));
}

// -------------------------------------------------------------------------
// Scenarios
// -------------------------------------------------------------------------

#[test]
fn identical_records_score_above_prior() {
    let backend = MemoryBackend::new();
    let comparisons = vec![
        library::name_comparison("first_name", false).unwrap(),
        library::exact_match("surname", false).unwrap(),
        library::date_comparison("dob").unwrap(),
    ];
    let prior = 0.001;
    let model = ModelState::new(&backend, LinkType::DedupeOnly, comparisons, prior).unwrap();
    let person = |id: &str| {
        Record::new(id, "t").with("first_name", "ada").with("surname", "lovelace").with("dob", "1815-12-10")
    };
    let linker = Linker::new(backend, model, vec![Table::new("t", vec![person("1"), person("2")])]).unwrap();
    let rows = linker.predict().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].levels, vec![1, 1, 1]);
    assert!(rows[0].match_probability > prior);
}

const SURNAMES: usize = 200;

fn thousand_records_with_five_duplicates() -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(11);
    let mut records: Vec<Record> = (0..995)
        .map(|i| {
            Record::new(i.to_string(), "people")
                .with("surname", format!("s{}", rng.gen_range(0..SURNAMES)).as_str())
                .with("first_name", format!("f{}", rng.gen_range(0..500)).as_str())
        })
        .collect();
    for (k, source) in [3usize, 100, 250, 600, 900].iter().enumerate() {
        let mut dup = records[*source].clone();
        dup.unique_id = format!("dup{k}");
        records.push(dup);
    }
    records
}

#[test]
fn surname_blocking_on_a_thousand_records() {
    let records = thousand_records_with_five_duplicates();
    let brute: usize = (0..records.len())
        .map(|i| {
            (i + 1..records.len())
                .filter(|&j| records[i].get("surname") == records[j].get("surname"))
                .count()
        })
        .sum();

    let backend = MemoryBackend::new();
    let model = ModelState::new(
        &backend,
        LinkType::DedupeOnly,
        vec![library::exact_match("first_name", false).unwrap()],
        0.01,
    )
    .unwrap();
    let linker = Linker::new(backend, model, vec![Table::new("people", records)]).unwrap();
    let set = linker.generate_candidates(&[BlockingRule::parse("l.surname = r.surname")]).unwrap();
    assert_eq!(set.len(), brute);

    let keys: HashSet<(usize, usize)> = set.pairs.iter().map(|p| p.key()).collect();
    for (k, source) in [3usize, 100, 250, 600, 900].iter().enumerate() {
        assert!(keys.contains(&(*source, 995 + k)));
    }
}

#[test]
fn explosion_ceiling_is_enforced_through_the_linker() {
    let backend = MemoryBackend::new();
    let model = ModelState::new(
        &backend,
        LinkType::DedupeOnly,
        vec![library::exact_match("first_name", false).unwrap()],
        0.01,
    )
    .unwrap()
    .with_max_candidate_pairs(1000);
    let linker = Linker::new(backend, model, vec![Table::new("people", thousand_records_with_five_duplicates())])
        .unwrap();
    let err = linker.generate_candidates(&[BlockingRule::all()]).unwrap_err();
    assert!(matches!(err, LinkError::BlockingExplosion { pairs: 499_500, ceiling: 1000, .. }));
}

// -------------------------------------------------------------------------
// Reversal
// -------------------------------------------------------------------------

const COLUMNS: [(&str, usize); 4] = [("surname", 30), ("first_name", 40), ("city", 10), ("dob", 5000)];

struct Synthetic {
    records: Vec<Record>,
    entity: Vec<usize>,
}

fn synthetic_population() -> Synthetic {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut records = Vec::new();
    let mut entity = Vec::new();
    for e in 0..300 {
        let values: Vec<usize> = COLUMNS.iter().map(|(_, pool)| rng.gen_range(0..*pool)).collect();
        let copies = if e < 100 { 2 } else { 1 };
        for copy in 0..copies {
            let mut record = Record::new(format!("{e}-{copy}"), "people");
            for (c, (name, pool)) in COLUMNS.iter().enumerate() {
                let v = if copy > 0 && rng.gen::<f64>() < 0.1 { rng.gen_range(0..*pool) } else { values[c] };
                record = record.with(name, format!("{name}{v}").as_str());
            }
            records.push(record);
            entity.push(e);
        }
    }
    Synthetic { records, entity }
}

/// Empirical m/u of exact agreement per column, and the true prior.
fn ground_truth(data: &Synthetic) -> (Vec<(f64, f64)>, f64) {
    let n = data.records.len();
    let mut matches = 0usize;
    let mut non_matches = 0usize;
    let mut agree_m = [0usize; 4];
    let mut agree_u = [0usize; 4];
    for i in 0..n {
        for j in i + 1..n {
            let is_match = data.entity[i] == data.entity[j];
            if is_match {
                matches += 1;
            } else {
                non_matches += 1;
            }
            for (c, (name, _)) in COLUMNS.iter().enumerate() {
                if data.records[i].get(name) == data.records[j].get(name) {
                    if is_match {
                        agree_m[c] += 1;
                    } else {
                        agree_u[c] += 1;
                    }
                }
            }
        }
    }
    let clamp = |p: f64| p.clamp(1e-6, 1.0 - 1e-6);
    let mu = (0..4)
        .map(|c| {
            (
                clamp(agree_m[c] as f64 / matches as f64),
                clamp(agree_u[c] as f64 / non_matches as f64),
            )
        })
        .collect();
    (mu, matches as f64 / (matches + non_matches) as f64)
}

fn ground_truth_linker(data: &Synthetic, mu: &[(f64, f64)]) -> Linker<MemoryBackend> {
    let backend = MemoryBackend::new();
    let comparisons = COLUMNS
        .iter()
        .zip(mu)
        .map(|((name, _), (m, u))| {
            Comparison::new(
                *name,
                vec![
                    exact_match_level(name).with_m(*m).with_u(*u),
                    else_level().with_m(1.0 - m).with_u(1.0 - u),
                ],
            )
            .unwrap()
        })
        .collect();
    let model = ModelState::new(&backend, LinkType::DedupeOnly, comparisons, 0.01).unwrap();
    Linker::new(backend, model, vec![Table::new("people", data.records.clone())]).unwrap()
}

#[test]
fn reversed_prior_matches_direct_estimate() {
    let data = synthetic_population();
    let (mu, true_prior) = ground_truth(&data);
    let options = || EmOptions::default().fix_m().fix_u().with_limits(200, 1e-10);

    let blocked = ground_truth_linker(&data, &mu);
    let session = blocked.train(BlockingRule::parse("l.surname = r.surname"), options()).unwrap();
    assert!(session.state().is_finished());
    assert_eq!(session.deactivated().len(), 1);
    // conditioning on the rule inflates the prior
    assert!(session.model().probability_two_random_records_match > 5.0 * true_prior);
    let reversed = blocked.model().probability_two_random_records_match;

    let direct = ground_truth_linker(&data, &mu);
    direct.train(BlockingRule::all(), options()).unwrap();
    let direct = direct.model().probability_two_random_records_match;

    let tolerance = 0.25 * true_prior;
    assert!((direct - true_prior).abs() < tolerance, "direct {direct} vs {true_prior}");
    assert!((reversed - true_prior).abs() < tolerance, "reversed {reversed} vs {true_prior}");
}

#[test]
fn explicit_reversal_on_an_active_comparison_matches_direct_estimate() {
    let data = synthetic_population();
    let (mu, true_prior) = ground_truth(&data);
    let options = EmOptions::default()
        .fix_m()
        .fix_u()
        .with_limits(200, 1e-10)
        .deactivate(Vec::<String>::new())
        .reverse([LevelId::new("surname", 0)]);

    let linker = ground_truth_linker(&data, &mu);
    let session = linker.train(BlockingRule::parse("l.surname = r.surname"), options).unwrap();
    assert!(session.state().is_finished());
    assert!(session.deactivated().is_empty());
    assert_eq!(session.levels_to_reverse().len(), 1);

    let reversed = linker.model().probability_two_random_records_match;
    let tolerance = 0.25 * true_prior;
    assert!((reversed - true_prior).abs() < tolerance, "reversed {reversed} vs {true_prior}");
}

#[test]
fn concurrent_sessions_fold_back_serially() {
    let data = synthetic_population();
    let (mu, _) = ground_truth(&data);
    let linker = ground_truth_linker(&data, &mu);
    let rules = ["l.surname = r.surname", "l.city = r.city", "l.first_name = r.first_name"];

    std::thread::scope(|scope| {
        for rule in rules {
            let linker = &linker;
            scope.spawn(move || {
                linker
                    .train(BlockingRule::parse(rule), EmOptions::default().with_limits(10, 1e-6))
                    .unwrap();
            });
        }
        scope.spawn(|| {
            let rows = linker.predict().unwrap();
            assert!(rows.iter().all(|r| r.match_probability.is_finite()));
        });
    });

    let sessions = linker.sessions();
    assert_eq!(sessions.len(), 3);
    let ids: HashSet<usize> = sessions.iter().map(|s| s.id).collect();
    assert_eq!(ids.len(), 3);

    // each session trained dob, so dob carries one value per session
    let model = linker.model();
    let dob = model.comparison("dob").unwrap();
    assert_eq!(dob.levels[0].trained_m.len(), 3);

    let reconciled = linker.reconcile().unwrap();
    assert_eq!(reconciled.estimates.len(), 3);
    assert!(reconciled.fully_trained);
}
