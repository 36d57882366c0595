//! # Cohort Construction and Composite Score
//!
//! The builder owns everything about the analytic cohort: the eligibility
//! predicate, the frozen standardization parameters, the composite score and
//! the stratum labels. Later stages read its output and never write it back.
//!
//! The composite score for one participant is
//!
//! ```text
//! score = (-z_logCRP) + z_albumin + z_ALMI(sex)
//! ```
//!
//! where hs-CRP is log-transformed before standardization (its distribution
//! is strongly right-skewed) and the lean-mass index is standardized within
//! sex. Means and standard deviations are computed once over the eligible
//! cohort, frozen, and persisted; scores are never re-centered afterwards,
//! so a re-run from the same input reproduces them bit for bit.

use crate::config::RunConfig;
use crate::quartiles::{QuantileCuts, QuartileError};
use crate::schema::RawCohort;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("no rows satisfy the eligibility predicate (started from {total})")]
    EmptyEligible { total: usize },
    #[error("the {component} component has zero variance over the eligible cohort; it cannot be standardized")]
    ZeroVariance { component: &'static str },
    #[error(transparent)]
    Quartile(#[from] QuartileError),
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("scored cohort file is missing column '{0}'")]
    MissingColumn(String),
    #[error("row {row} of column '{column}' in the scored cohort file is not numeric")]
    ParseValue { column: String, row: usize },
    #[error("could not serialize frozen parameters: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("could not parse frozen parameters: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// A frozen mean / standard deviation pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MeanSd {
    pub mean: f64,
    pub sd: f64,
}

/// Everything data-dependent that must be held fixed for reproduction:
/// pooled standardization of log-CRP and albumin, sex-specific
/// standardization of the lean-mass index, and the quantile cut points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrozenParams {
    pub log_crp: MeanSd,
    pub albumin: MeanSd,
    pub almi_male: MeanSd,
    pub almi_female: MeanSd,
    pub quartile_cuts: Vec<f64>,
    pub crp_bound: f64,
    pub min_age: f64,
}

impl FrozenParams {
    pub fn save(&self, path: &Path) -> Result<(), CohortError> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| CohortError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, CohortError> {
        let text = std::fs::read_to_string(path).map_err(|source| CohortError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

/// Counts of rows removed by each eligibility rule, in the order the rules
/// are applied. A row is tallied once, under the first rule it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExclusionTally {
    pub total: usize,
    pub missing_age: usize,
    pub below_min_age: usize,
    pub missing_component: usize,
    pub crp_above_bound: usize,
    pub missing_weight: usize,
    pub eligible: usize,
}

/// The eligible, scored, stratified cohort. Column arrays are parallel; the
/// quartile column is zero-based (0 = lowest resilience).
#[derive(Debug, Clone)]
pub struct ScoredCohort {
    pub seqn: Array1<f64>,
    pub weight: Array1<f64>,
    pub psu: Array1<f64>,
    pub strata: Array1<f64>,
    pub age: Array1<f64>,
    pub sex: Array1<f64>,
    pub race_eth: Array1<f64>,
    pub bmi: Array1<f64>,
    pub diabetes: Array1<f64>,
    pub hypertension: Array1<f64>,
    pub current_smoker: Array1<f64>,
    pub cvd_history: Array1<f64>,
    pub srh_fair_poor: Array1<f64>,
    pub mobility_difficulty: Array1<f64>,
    pub depression: Array1<f64>,
    pub followup_years: Array1<f64>,
    pub mort_all: Array1<f64>,
    pub mort_cv: Array1<f64>,
    pub hscrp: Array1<f64>,
    pub albumin: Array1<f64>,
    pub almi: Array1<f64>,
    pub z_crp_inv: Array1<f64>,
    pub z_albumin: Array1<f64>,
    pub z_almi: Array1<f64>,
    pub score: Array1<f64>,
    pub quartile: Vec<usize>,
    /// Sensitivity flag carried from the original protocol: albumin below
    /// 3.5 g/dL.
    pub flag_albumin_low: Array1<f64>,
}

impl ScoredCohort {
    pub fn n_rows(&self) -> usize {
        self.score.len()
    }

    pub fn stratum_count(&self) -> usize {
        self.quartile.iter().copied().max().map_or(0, |m| m + 1)
    }

    /// Row indices belonging to one stratum.
    pub fn stratum_rows(&self, stratum: usize) -> Vec<usize> {
        self.quartile
            .iter()
            .enumerate()
            .filter(|&(_, &q)| q == stratum)
            .map(|(i, _)| i)
            .collect()
    }
}

fn mean_sd(values: impl Iterator<Item = f64> + Clone) -> MeanSd {
    let mut n = 0usize;
    let mut sum = 0.0;
    for v in values.clone() {
        n += 1;
        sum += v;
    }
    if n < 2 {
        return MeanSd {
            mean: f64::NAN,
            sd: f64::NAN,
        };
    }
    let mean = sum / n as f64;
    let ss: f64 = values.map(|v| (v - mean) * (v - mean)).sum();
    MeanSd {
        mean,
        sd: (ss / (n - 1) as f64).sqrt(),
    }
}

/// Composite score for one participant under frozen parameters.
///
/// The raw inputs are required to be present; rows with missing components
/// never reach this point, so a NaN here is an invariant violation rather
/// than a recoverable condition.
pub fn compute_score(hscrp: f64, albumin: f64, almi: f64, sex: f64, params: &FrozenParams) -> f64 {
    debug_assert!(
        hscrp.is_finite() && albumin.is_finite() && almi.is_finite(),
        "score components must be filtered for completeness upstream"
    );
    let almi_params = if sex == 2.0 {
        &params.almi_female
    } else {
        &params.almi_male
    };
    let z_crp = (hscrp.ln() - params.log_crp.mean) / params.log_crp.sd;
    let z_albumin = (albumin - params.albumin.mean) / params.albumin.sd;
    let z_almi = (almi - almi_params.mean) / almi_params.sd;
    -z_crp + z_albumin + z_almi
}

fn subset(values: &Array1<f64>, rows: &[usize]) -> Array1<f64> {
    Array1::from_iter(rows.iter().map(|&i| values[i]))
}

/// Applies the eligibility predicate, freezes standardization parameters,
/// computes the composite score and assigns strata.
pub fn build_cohort(
    raw: &RawCohort,
    config: &RunConfig,
) -> Result<(ScoredCohort, FrozenParams, ExclusionTally), CohortError> {
    let n = raw.n_rows();
    let mut tally = ExclusionTally {
        total: n,
        ..Default::default()
    };

    let mut kept = Vec::with_capacity(n);
    for i in 0..n {
        if raw.age[i].is_nan() {
            tally.missing_age += 1;
            continue;
        }
        if raw.age[i] < config.min_age {
            tally.below_min_age += 1;
            continue;
        }
        let components_present = !raw.hscrp[i].is_nan()
            && !raw.albumin[i].is_nan()
            && !raw.almi[i].is_nan()
            && !raw.sex[i].is_nan();
        if !components_present {
            tally.missing_component += 1;
            continue;
        }
        if raw.hscrp[i] > config.crp_bound {
            tally.crp_above_bound += 1;
            continue;
        }
        if raw.mec_weight[i].is_nan() {
            tally.missing_weight += 1;
            continue;
        }
        kept.push(i);
    }
    tally.eligible = kept.len();

    log::info!(
        "Eligibility: {} of {} rows retained (missing age: {}, age < {}: {}, missing component: {}, hs-CRP > {}: {}, missing weight: {}).",
        tally.eligible,
        tally.total,
        tally.missing_age,
        config.min_age,
        tally.below_min_age,
        tally.missing_component,
        config.crp_bound,
        tally.crp_above_bound,
        tally.missing_weight
    );

    if kept.is_empty() {
        return Err(CohortError::EmptyEligible { total: n });
    }

    // Freeze standardization parameters over the eligible cohort.
    let log_crp = mean_sd(kept.iter().map(|&i| raw.hscrp[i].ln()));
    let albumin = mean_sd(kept.iter().map(|&i| raw.albumin[i]));
    let almi_male = mean_sd(
        kept.iter()
            .filter(|&&i| raw.sex[i] == 1.0)
            .map(|&i| raw.almi[i]),
    );
    let almi_female = mean_sd(
        kept.iter()
            .filter(|&&i| raw.sex[i] == 2.0)
            .map(|&i| raw.almi[i]),
    );

    if !(log_crp.sd > 0.0) {
        return Err(CohortError::ZeroVariance { component: "log hs-CRP" });
    }
    if !(albumin.sd > 0.0) {
        return Err(CohortError::ZeroVariance { component: "albumin" });
    }
    let has_male = kept.iter().any(|&i| raw.sex[i] == 1.0);
    let has_female = kept.iter().any(|&i| raw.sex[i] == 2.0);
    if has_male && !(almi_male.sd > 0.0) {
        return Err(CohortError::ZeroVariance { component: "male lean-mass index" });
    }
    if has_female && !(almi_female.sd > 0.0) {
        return Err(CohortError::ZeroVariance { component: "female lean-mass index" });
    }

    let mut params = FrozenParams {
        log_crp,
        albumin,
        almi_male,
        almi_female,
        quartile_cuts: Vec::new(),
        crp_bound: config.crp_bound,
        min_age: config.min_age,
    };

    let score = Array1::from_iter(kept.iter().map(|&i| {
        compute_score(raw.hscrp[i], raw.albumin[i], raw.almi[i], raw.sex[i], &params)
    }));

    let cuts = QuantileCuts::compute(score.view(), config.quartile_count)?;
    params.quartile_cuts = cuts.boundaries().to_vec();
    let quartile: Vec<usize> = score.iter().map(|&s| cuts.assign(s)).collect();

    let z_crp_inv = Array1::from_iter(
        kept.iter()
            .map(|&i| -(raw.hscrp[i].ln() - params.log_crp.mean) / params.log_crp.sd),
    );
    let z_albumin = Array1::from_iter(
        kept.iter()
            .map(|&i| (raw.albumin[i] - params.albumin.mean) / params.albumin.sd),
    );
    let z_almi = Array1::from_iter(kept.iter().map(|&i| {
        let p = if raw.sex[i] == 2.0 {
            &params.almi_female
        } else {
            &params.almi_male
        };
        (raw.almi[i] - p.mean) / p.sd
    }));
    let flag_albumin_low =
        Array1::from_iter(kept.iter().map(|&i| if raw.albumin[i] < 3.5 { 1.0 } else { 0.0 }));

    let cohort = ScoredCohort {
        seqn: subset(&raw.seqn, &kept),
        weight: subset(&raw.mec_weight, &kept),
        psu: subset(&raw.psu, &kept),
        strata: subset(&raw.strata, &kept),
        age: subset(&raw.age, &kept),
        sex: subset(&raw.sex, &kept),
        race_eth: subset(&raw.race_eth, &kept),
        bmi: subset(&raw.bmi, &kept),
        diabetes: subset(&raw.diabetes, &kept),
        hypertension: subset(&raw.hypertension, &kept),
        current_smoker: subset(&raw.current_smoker, &kept),
        cvd_history: subset(&raw.cvd_history, &kept),
        srh_fair_poor: subset(&raw.srh_fair_poor, &kept),
        mobility_difficulty: subset(&raw.mobility_difficulty, &kept),
        depression: subset(&raw.depression, &kept),
        followup_years: subset(&raw.followup_years, &kept),
        mort_all: subset(&raw.mort_all, &kept),
        mort_cv: subset(&raw.mort_cv, &kept),
        hscrp: subset(&raw.hscrp, &kept),
        albumin: subset(&raw.albumin, &kept),
        almi: subset(&raw.almi, &kept),
        z_crp_inv,
        z_albumin,
        z_almi,
        score,
        quartile,
        flag_albumin_low,
    };

    log::info!(
        "Scored cohort ready: {} rows, cut points {:?}.",
        cohort.n_rows(),
        params.quartile_cuts
    );
    Ok((cohort, params, tally))
}

// Column order of the scored-cohort CSV. Kept in one place so the writer
// and reader cannot drift apart.
const SCORED_COLUMNS: &[&str] = &[
    "seqn",
    "mec_weight",
    "psu",
    "strata",
    "age",
    "sex",
    "race_eth",
    "bmi",
    "diabetes",
    "hypertension",
    "current_smoker",
    "cvd_history",
    "srh_fair_poor",
    "mobility_difficulty",
    "depression",
    "followup_years",
    "mort_all",
    "mort_cv",
    "hscrp",
    "albumin",
    "almi",
    "z_crp_inv",
    "z_albumin",
    "z_almi",
    "iri",
    "quartile",
    "flag_albumin_low",
];

fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        // Shortest representation that round-trips exactly.
        format!("{value}")
    }
}

/// Writes the scored cohort as the pipeline's on-disk intermediate.
pub fn write_scored_cohort(cohort: &ScoredCohort, path: &Path) -> Result<(), CohortError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(SCORED_COLUMNS)?;
    for i in 0..cohort.n_rows() {
        let cells = [
            format_cell(cohort.seqn[i]),
            format_cell(cohort.weight[i]),
            format_cell(cohort.psu[i]),
            format_cell(cohort.strata[i]),
            format_cell(cohort.age[i]),
            format_cell(cohort.sex[i]),
            format_cell(cohort.race_eth[i]),
            format_cell(cohort.bmi[i]),
            format_cell(cohort.diabetes[i]),
            format_cell(cohort.hypertension[i]),
            format_cell(cohort.current_smoker[i]),
            format_cell(cohort.cvd_history[i]),
            format_cell(cohort.srh_fair_poor[i]),
            format_cell(cohort.mobility_difficulty[i]),
            format_cell(cohort.depression[i]),
            format_cell(cohort.followup_years[i]),
            format_cell(cohort.mort_all[i]),
            format_cell(cohort.mort_cv[i]),
            format_cell(cohort.hscrp[i]),
            format_cell(cohort.albumin[i]),
            format_cell(cohort.almi[i]),
            format_cell(cohort.z_crp_inv[i]),
            format_cell(cohort.z_albumin[i]),
            format_cell(cohort.z_almi[i]),
            format_cell(cohort.score[i]),
            (cohort.quartile[i] + 1).to_string(),
            format_cell(cohort.flag_albumin_low[i]),
        ];
        writer.write_record(&cells)?;
    }
    writer.flush().map_err(|source| CohortError::Io {
        path: path.display().to_string(),
        source,
    })?;
    log::info!("Wrote scored cohort ({} rows) to '{}'.", cohort.n_rows(), path.display());
    Ok(())
}

/// Reads a scored cohort written by [`write_scored_cohort`].
pub fn read_scored_cohort(path: &Path) -> Result<ScoredCohort, CohortError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let index_of = |name: &str| -> Result<usize, CohortError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| CohortError::MissingColumn(name.to_string()))
    };
    let indices: Vec<usize> = SCORED_COLUMNS
        .iter()
        .map(|name| index_of(name))
        .collect::<Result<_, _>>()?;

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); SCORED_COLUMNS.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (slot, &idx) in indices.iter().enumerate() {
            let cell = record.get(idx).unwrap_or("");
            let value = if cell.is_empty() {
                f64::NAN
            } else {
                cell.parse::<f64>().map_err(|_| CohortError::ParseValue {
                    column: SCORED_COLUMNS[slot].to_string(),
                    row,
                })?
            };
            columns[slot].push(value);
        }
    }

    let mut iter = columns.into_iter();
    let mut next = || Array1::from_vec(iter.next().expect("column count fixed"));
    let seqn = next();
    let weight = next();
    let psu = next();
    let strata = next();
    let age = next();
    let sex = next();
    let race_eth = next();
    let bmi = next();
    let diabetes = next();
    let hypertension = next();
    let current_smoker = next();
    let cvd_history = next();
    let srh_fair_poor = next();
    let mobility_difficulty = next();
    let depression = next();
    let followup_years = next();
    let mort_all = next();
    let mort_cv = next();
    let hscrp = next();
    let albumin = next();
    let almi = next();
    let z_crp_inv = next();
    let z_albumin = next();
    let z_almi = next();
    let score = next();
    let quartile_raw = next();
    let flag_albumin_low = next();

    let quartile = quartile_raw
        .iter()
        .map(|&q| (q as usize).saturating_sub(1))
        .collect();

    Ok(ScoredCohort {
        seqn,
        weight,
        psu,
        strata,
        age,
        sex,
        race_eth,
        bmi,
        diabetes,
        hypertension,
        current_smoker,
        cvd_history,
        srh_fair_poor,
        mobility_difficulty,
        depression,
        followup_years,
        mort_all,
        mort_cv,
        hscrp,
        albumin,
        almi,
        z_crp_inv,
        z_albumin,
        z_almi,
        score,
        quartile,
        flag_albumin_low,
    })
}
