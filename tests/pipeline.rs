//! End-to-end pipeline test on a synthetic survey extract: raw CSV in,
//! scored cohort, descriptive tables, association models and figures out.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};
use std::path::Path;

use resin::cohort::{build_cohort, read_scored_cohort, write_scored_cohort};
use resin::config::RunConfig;
use resin::estimator::{AnalysisKind, ModelStatus, PredictorKind, estimate_associations};
use resin::figures::{render_prevalence_bars_svg, render_violin_svg};
use resin::report::{flatten_associations, read_association_table, write_association_table};
use resin::schema::load_raw_cohort;
use resin::tabulate::{baseline_table, cohort_design, outcome_prevalence};

const HEADER: &str = "seqn,mec_weight,psu,strata,age,sex,race_eth,hscrp,albumin,almi,bmi,\
                      diabetes,hypertension,current_smoker,cvd_history,srh_fair_poor,\
                      mobility_difficulty,depression,followup_years,mort_all,mort_cv";

struct SyntheticExtract {
    csv: String,
    /// Rows expected to survive every eligibility rule.
    expected_eligible: usize,
    expected_crp_excluded: usize,
    expected_underage: usize,
    expected_missing_component: usize,
}

/// Builds a raw extract where a latent "resilience" variable drives both the
/// score components and the binary outcomes, so higher scores should come
/// out protective. A handful of rows violate each eligibility rule.
fn synthetic_extract(n: usize, seed: u64) -> SyntheticExtract {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let uniform = Uniform::new(0.0, 1.0);

    let mut lines = vec![HEADER.to_string()];
    let mut expected_eligible = 0;
    let mut expected_crp_excluded = 0;
    let mut expected_underage = 0;
    let mut expected_missing_component = 0;

    for i in 0..n {
        let latent: f64 = normal.sample(&mut rng);
        let sex = 1 + i % 2;
        let age = 25.0 + 40.0 * uniform.sample(&mut rng);
        let hscrp = (0.3 - 0.4 * latent + 0.3 * normal.sample(&mut rng)).exp().min(9.5);
        let albumin = 4.2 + 0.2 * latent + 0.1 * normal.sample(&mut rng);
        let almi_base = if sex == 1 { 7.8 } else { 6.3 };
        let almi = almi_base + 0.6 * latent + 0.2 * normal.sample(&mut rng);

        let p_srh = 1.0 / (1.0 + (1.2 + 0.5 * latent).exp());
        let srh = (uniform.sample(&mut rng) < p_srh) as u8;
        let p_mob = 1.0 / (1.0 + (1.6 + 0.5 * latent).exp());
        let mobility = (uniform.sample(&mut rng) < p_mob) as u8;
        let p_dep = 1.0 / (1.0 + (1.9 + 0.4 * latent).exp());
        let depression = (uniform.sample(&mut rng) < p_dep) as u8;
        // Keep deaths rare so the event gate triggers.
        let mort_all = (i % 200 == 0) as u8;
        let mort_cv = (i % 400 == 0) as u8;

        // Deterministic rule violations sprinkled through the extract.
        let (age, hscrp_cell, albumin_cell) = match i % 97 {
            0 => {
                expected_underage += 1;
                (18.0, format!("{hscrp}"), format!("{albumin}"))
            }
            1 => {
                expected_crp_excluded += 1;
                (age, "12.5".to_string(), format!("{albumin}"))
            }
            2 => {
                expected_missing_component += 1;
                (age, format!("{hscrp}"), String::new())
            }
            _ => {
                expected_eligible += 1;
                (age, format!("{hscrp}"), format!("{albumin}"))
            }
        };

        let weight = 5_000.0 + 20_000.0 * uniform.sample(&mut rng);
        lines.push(format!(
            "{seqn},{weight},{psu},{strata},{age},{sex},{race},{hscrp_cell},{albumin_cell},{almi},{bmi},{dia},{htn},{smk},{cvd},{srh},{mobility},{depression},{fu},{mort_all},{mort_cv}",
            seqn = 100_000 + i,
            psu = 1 + i % 2,
            strata = 1 + (i / 2) % 15,
            race = [1, 2, 3, 4, 6][i % 5],
            bmi = 22.0 + 8.0 * uniform.sample(&mut rng),
            dia = (i % 9 == 0) as u8,
            htn = (i % 4 == 0) as u8,
            smk = (i % 6 == 0) as u8,
            cvd = (i % 13 == 0) as u8,
            fu = 1.0 + 8.0 * uniform.sample(&mut rng),
        ));
    }

    SyntheticExtract {
        csv: lines.join("\n") + "\n",
        expected_eligible,
        expected_crp_excluded,
        expected_underage,
        expected_missing_component,
    }
}

fn write_extract(dir: &Path, extract: &SyntheticExtract) -> std::path::PathBuf {
    let path = dir.join("raw.csv");
    std::fs::write(&path, &extract.csv).unwrap();
    path
}

#[test]
fn full_pipeline_on_synthetic_extract() {
    let dir = tempfile::tempdir().unwrap();
    let extract = synthetic_extract(3000, 42);
    let input = write_extract(dir.path(), &extract);
    let config = RunConfig::default();

    // Stage 1: load and score.
    let raw = load_raw_cohort(&input).unwrap();
    assert_eq!(raw.n_rows(), 3000);
    let (cohort, params, tally) = build_cohort(&raw, &config).unwrap();
    assert_eq!(tally.below_min_age, extract.expected_underage);
    assert_eq!(tally.crp_above_bound, extract.expected_crp_excluded);
    assert_eq!(tally.missing_component, extract.expected_missing_component);
    assert_eq!(tally.eligible, extract.expected_eligible);
    assert_eq!(cohort.n_rows(), extract.expected_eligible);
    assert!(cohort.hscrp.iter().all(|&c| c <= config.crp_bound));
    assert_eq!(params.quartile_cuts.len(), 3);
    assert_eq!(cohort.stratum_count(), 4);

    // Quartiles are near-balanced on continuous scores.
    for stratum in 0..4 {
        let count = cohort.stratum_rows(stratum).len();
        let quarter = cohort.n_rows() / 4;
        assert!(count.abs_diff(quarter) <= 1, "stratum {stratum}: {count}");
    }

    // Stage 2: on-disk intermediate round-trips exactly.
    let scored_path = dir.path().join("cohort_scored.csv");
    write_scored_cohort(&cohort, &scored_path).unwrap();
    let reread = read_scored_cohort(&scored_path).unwrap();
    let rewritten = dir.path().join("cohort_scored_2.csv");
    write_scored_cohort(&reread, &rewritten).unwrap();
    assert_eq!(
        std::fs::read(&scored_path).unwrap(),
        std::fs::read(&rewritten).unwrap()
    );

    // Stage 3: descriptive tables.
    let design = cohort_design(&reread);
    let baseline = baseline_table(&reread, &design);
    assert_eq!(*baseline.unweighted_n.last().unwrap(), cohort.n_rows());
    let prevalence = outcome_prevalence(&reread, &design);
    assert!(prevalence.iter().all(|c| c.estimate.estimate.is_finite()));

    // The lowest-resilience quartile should carry the highest prevalence of
    // fair/poor self-rated health.
    let srh: Vec<f64> = prevalence
        .iter()
        .filter(|c| c.outcome == "fair_poor_health")
        .map(|c| c.estimate.estimate)
        .collect();
    assert!(srh[0] > srh[3], "Q1 {} vs Q4 {}", srh[0], srh[3]);

    // Stage 4: associations. The headline model is the demographically
    // adjusted one; the fully adjusted model rides along as sensitivity.
    let results = estimate_associations(&reread, &config).unwrap();
    let srh_fit = |analysis: AnalysisKind| {
        results
            .iter()
            .find(|r| {
                r.outcome == "fair_poor_health"
                    && r.predictor == PredictorKind::ContinuousScore
                    && r.analysis == analysis
            })
            .unwrap()
    };
    match &srh_fit(AnalysisKind::Primary).status {
        ModelStatus::Fitted { effects, covariates, fell_back } => {
            assert_eq!(covariates, "primary");
            assert!(!fell_back);
            assert!(effects[0].estimate < 1.0, "OR {}", effects[0].estimate);
            assert!(effects[0].ci_upper < 1.0, "CI should exclude the null");
        }
        other => panic!("expected a fit, got {other:?}"),
    }
    match &srh_fit(AnalysisKind::Sensitivity).status {
        ModelStatus::Fitted { effects, covariates, .. } => {
            assert_eq!(covariates, "full");
            assert!(effects[0].estimate < 1.0, "OR {}", effects[0].estimate);
        }
        other => panic!("expected a sensitivity fit, got {other:?}"),
    }
    for result in results.iter().filter(|r| r.outcome == "cv_mortality") {
        assert!(matches!(result.status, ModelStatus::InsufficientPower { .. }));
    }

    // Stage 5: report artifacts.
    let rows = flatten_associations(&results);
    let table_path = dir.path().join("associations.csv");
    write_association_table(&rows, &table_path).unwrap();
    assert_eq!(read_association_table(&table_path).unwrap(), rows);

    let labels: Vec<String> = (1..=4).map(|q| format!("Q{q}")).collect();
    let bars = render_prevalence_bars_svg(&prevalence, &labels, "Prevalence", &config.figure);
    assert!(bars.starts_with("<svg"));
    let groups: Vec<(String, Vec<f64>)> = (0..4)
        .map(|s| {
            let values = reread.stratum_rows(s).iter().map(|&i| reread.score[i]).collect();
            (labels[s].clone(), values)
        })
        .collect();
    let violins = render_violin_svg(&groups, "Score distribution", &config.figure);
    assert_eq!(violins.matches("<polygon").count(), 4);
}

#[test]
fn rebuilding_from_the_same_extract_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let extract = synthetic_extract(800, 7);
    let input = write_extract(dir.path(), &extract);
    let config = RunConfig::default();

    let raw = load_raw_cohort(&input).unwrap();
    let (first, params_a, _) = build_cohort(&raw, &config).unwrap();
    let (second, params_b, _) = build_cohort(&raw, &config).unwrap();
    assert_eq!(params_a, params_b);
    for (a, b) in first.score.iter().zip(second.score.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn missing_weight_rows_are_excluded_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut extract = synthetic_extract(400, 9);
    // Blank out the weight on the first data row that would otherwise be
    // eligible (line 4 of the file is i=3, which passes every rule).
    let mut lines: Vec<String> = extract.csv.lines().map(String::from).collect();
    let row = lines[4].clone();
    let mut cells: Vec<&str> = row.split(',').collect();
    cells[1] = "";
    lines[4] = cells.join(",");
    extract.csv = lines.join("\n") + "\n";
    let input = write_extract(dir.path(), &extract);

    let raw = load_raw_cohort(&input).unwrap();
    let (cohort, _, tally) = build_cohort(&raw, &RunConfig::default()).unwrap();
    assert_eq!(tally.missing_weight, 1);
    assert_eq!(cohort.n_rows(), extract.expected_eligible - 1);
    assert!(cohort.weight.iter().all(|w| w.is_finite()));
}
