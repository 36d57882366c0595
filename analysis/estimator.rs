//! # Association Estimation
//!
//! Orchestrates every (outcome, model-specification) fit: survey-weighted
//! logistic regression for the binary outcomes and survey-weighted Cox
//! regression for the mortality outcomes, each with the composite score
//! entered continuously and as a quartile factor against the
//! highest-resilience reference stratum.
//!
//! Two policies from the analysis protocol live here and nowhere else:
//!
//! - **Minimum-event gate.** An outcome with fewer events than the
//!   configured threshold is reported as `InsufficientPower`, never fitted;
//!   an unstable estimate with an absurd confidence interval is worse than
//!   an honest refusal.
//! - **Covariate fallback ladder.** Adjustment sets are tried in the
//!   configured order; a non-identifiable fit (singular information,
//!   divergence, non-convergence) drops to the next candidate and the
//!   substitution is recorded on the result. Degradation is reported, not
//!   silent.
//!
//! Each (outcome, predictor) cell is fitted twice: a primary analysis
//! adjusted for age, sex and race/ethnicity, and a fully-adjusted
//! sensitivity analysis. Both carry their own fallback ladder and both
//! appear in the emitted table.

use crate::cohort::ScoredCohort;
use crate::config::{ConfigError, CovariateSet, RunConfig};
use crate::cox::fit_survey_cox;
use crate::design::SurveyDesign;
use crate::logistic::{FitError, fit_survey_logistic};
use crate::stats::wald_summary;
use itertools::Itertools;
use ndarray::{Array1, Array2};

const MAX_ITERATIONS: usize = 100;
const TOLERANCE: f64 = 1e-8;

/// The binary and time-to-event outcomes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    FairPoorHealth,
    MobilityDifficulty,
    Depression,
    AllCauseMortality,
    CvMortality,
}

pub const OUTCOMES: &[Outcome] = &[
    Outcome::FairPoorHealth,
    Outcome::MobilityDifficulty,
    Outcome::Depression,
    Outcome::AllCauseMortality,
    Outcome::CvMortality,
];

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::FairPoorHealth => "fair_poor_health",
            Outcome::MobilityDifficulty => "mobility_difficulty",
            Outcome::Depression => "depression",
            Outcome::AllCauseMortality => "all_cause_mortality",
            Outcome::CvMortality => "cv_mortality",
        }
    }

    pub fn is_survival(&self) -> bool {
        matches!(self, Outcome::AllCauseMortality | Outcome::CvMortality)
    }

    pub fn indicator<'a>(&self, cohort: &'a ScoredCohort) -> &'a Array1<f64> {
        match self {
            Outcome::FairPoorHealth => &cohort.srh_fair_poor,
            Outcome::MobilityDifficulty => &cohort.mobility_difficulty,
            Outcome::Depression => &cohort.depression,
            Outcome::AllCauseMortality => &cohort.mort_all,
            Outcome::CvMortality => &cohort.mort_cv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Logistic,
    Cox,
}

impl ModelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::Cox => "cox",
        }
    }

    /// Name of the exponentiated effect this model reports.
    pub fn effect_name(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "OR",
            ModelKind::Cox => "HR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorKind {
    /// One coefficient per 1-unit increase in the composite score.
    ContinuousScore,
    /// Indicator per stratum against the highest-resilience reference.
    QuartileFactor,
}

impl PredictorKind {
    pub fn label(&self) -> &'static str {
        match self {
            PredictorKind::ContinuousScore => "continuous",
            PredictorKind::QuartileFactor => "quartile",
        }
    }
}

/// Which of the two reported adjustment strategies produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    /// Headline model, adjusted for the demographic set.
    Primary,
    /// Fully-adjusted model reported alongside the primary one.
    Sensitivity,
}

impl AnalysisKind {
    pub fn label(&self) -> &'static str {
        match self {
            AnalysisKind::Primary => "primary",
            AnalysisKind::Sensitivity => "sensitivity",
        }
    }
}

/// One exponentiated coefficient with its interval and test.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectEstimate {
    /// "per_unit" for the continuous predictor, else the stratum label.
    pub term: String,
    pub estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelStatus {
    Fitted {
        effects: Vec<EffectEstimate>,
        /// Name of the covariate set that identified the model.
        covariates: String,
        /// True when a richer candidate had to be abandoned.
        fell_back: bool,
    },
    InsufficientPower {
        events: usize,
        required: usize,
    },
    Unestimable {
        reason: String,
    },
}

/// Final, read-only record for one (outcome, model-specification) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationResult {
    pub outcome: &'static str,
    pub model: ModelKind,
    pub predictor: PredictorKind,
    pub analysis: AnalysisKind,
    pub n_used: usize,
    pub events: usize,
    pub status: ModelStatus,
}

/// Rows where the outcome (and follow-up time, for survival models) is
/// observed.
fn outcome_rows(cohort: &ScoredCohort, outcome: Outcome) -> Vec<usize> {
    let indicator = outcome.indicator(cohort);
    (0..cohort.n_rows())
        .filter(|&i| {
            !indicator[i].is_nan()
                && (!outcome.is_survival() || !cohort.followup_years[i].is_nan())
        })
        .collect()
}

fn covariate_value(cohort: &ScoredCohort, field: &str, row: usize) -> f64 {
    match field {
        "age" => cohort.age[row],
        "sex" => {
            if cohort.sex[row].is_nan() {
                f64::NAN
            } else {
                (cohort.sex[row] == 2.0) as u8 as f64
            }
        }
        "race_eth" => cohort.race_eth[row],
        "bmi" => cohort.bmi[row],
        "diabetes" => cohort.diabetes[row],
        "hypertension" => cohort.hypertension[row],
        "smoking" => cohort.current_smoker[row],
        other => unreachable!("covariate '{other}' rejected by validation in estimate_associations"),
    }
}

/// Sorted non-reference race/ethnicity codes observed among `rows`; the
/// most frequent code is the reference and gets no indicator column.
fn race_dummies(cohort: &ScoredCohort, rows: &[usize]) -> Vec<f64> {
    let mut counts = std::collections::BTreeMap::<i64, usize>::new();
    for &i in rows {
        *counts.entry(cohort.race_eth[i] as i64).or_default() += 1;
    }
    let reference = counts
        .iter()
        .max_by_key(|&(_, &count)| count)
        .map(|(&code, _)| code)
        .unwrap_or(0);
    counts
        .keys()
        .filter(|&&code| code != reference)
        .map(|&code| code as f64)
        .collect()
}

struct DesignMatrix {
    x: Array2<f64>,
    rows: Vec<usize>,
    /// Column index and display term of each predictor coefficient.
    predictor_terms: Vec<(usize, String)>,
}

/// Builds the model matrix over complete cases for one candidate set.
fn build_design(
    cohort: &ScoredCohort,
    candidate_rows: &[usize],
    predictor: PredictorKind,
    covariates: &CovariateSet,
    with_intercept: bool,
) -> Option<DesignMatrix> {
    let rows: Vec<usize> = candidate_rows
        .iter()
        .copied()
        .filter(|&i| {
            covariates
                .fields
                .iter()
                .all(|field| !covariate_value(cohort, field, i).is_nan())
        })
        .collect();
    if rows.is_empty() {
        return None;
    }

    let stratum_count = cohort.stratum_count();
    let reference = stratum_count.saturating_sub(1);
    let race_codes = if covariates.fields.iter().any(|f| f == "race_eth") {
        race_dummies(cohort, &rows)
    } else {
        Vec::new()
    };

    let mut columns: Vec<Array1<f64>> = Vec::new();
    let mut predictor_terms = Vec::new();
    if with_intercept {
        columns.push(Array1::from_elem(rows.len(), 1.0));
    }
    match predictor {
        PredictorKind::ContinuousScore => {
            predictor_terms.push((columns.len(), "per_unit".to_string()));
            columns.push(Array1::from_iter(rows.iter().map(|&i| cohort.score[i])));
        }
        PredictorKind::QuartileFactor => {
            for stratum in 0..stratum_count {
                if stratum == reference {
                    continue;
                }
                predictor_terms.push((columns.len(), format!("Q{}", stratum + 1)));
                columns.push(Array1::from_iter(
                    rows.iter()
                        .map(|&i| (cohort.quartile[i] == stratum) as u8 as f64),
                ));
            }
        }
    }
    for field in &covariates.fields {
        if field == "race_eth" {
            for &code in &race_codes {
                columns.push(Array1::from_iter(
                    rows.iter()
                        .map(|&i| (cohort.race_eth[i] == code) as u8 as f64),
                ));
            }
        } else {
            columns.push(Array1::from_iter(
                rows.iter().map(|&i| covariate_value(cohort, field, i)),
            ));
        }
    }

    let mut x = Array2::zeros((rows.len(), columns.len()));
    for (j, column) in columns.iter().enumerate() {
        x.column_mut(j).assign(column);
    }
    Some(DesignMatrix {
        x,
        rows,
        predictor_terms,
    })
}

fn subset_design(cohort: &ScoredCohort, rows: &[usize]) -> SurveyDesign {
    let weights = Array1::from_iter(rows.iter().map(|&i| cohort.weight[i]));
    let strata = Array1::from_iter(rows.iter().map(|&i| cohort.strata[i]));
    let psu = Array1::from_iter(rows.iter().map(|&i| cohort.psu[i]));
    SurveyDesign::new(weights, strata.view(), psu.view())
}

fn effects_from_fit(
    beta: &Array1<f64>,
    covariance: &Array2<f64>,
    predictor_terms: &[(usize, String)],
    alpha: f64,
) -> Vec<EffectEstimate> {
    predictor_terms
        .iter()
        .map(|(j, term)| {
            let se = covariance[[*j, *j]].sqrt();
            let wald = wald_summary(beta[*j], se, alpha);
            EffectEstimate {
                term: term.clone(),
                estimate: beta[*j].exp(),
                ci_lower: wald.lower.exp(),
                ci_upper: wald.upper.exp(),
                p_value: wald.p_value,
            }
        })
        .collect()
}

fn attempt_fit(
    cohort: &ScoredCohort,
    outcome: Outcome,
    predictor: PredictorKind,
    candidate_rows: &[usize],
    covariates: &CovariateSet,
    alpha: f64,
) -> Result<(Vec<EffectEstimate>, usize), FitError> {
    let model = if outcome.is_survival() {
        ModelKind::Cox
    } else {
        ModelKind::Logistic
    };
    let with_intercept = matches!(model, ModelKind::Logistic);
    let Some(design_matrix) = build_design(cohort, candidate_rows, predictor, covariates, with_intercept)
    else {
        return Err(FitError::NoCompleteCases);
    };
    let DesignMatrix {
        x,
        rows,
        predictor_terms,
    } = design_matrix;
    let survey = subset_design(cohort, &rows);
    let indicator = Array1::from_iter(rows.iter().map(|&i| outcome.indicator(cohort)[i]));

    let (beta, covariance) = match model {
        ModelKind::Logistic => {
            let fit = fit_survey_logistic(&x, indicator.view(), &survey, MAX_ITERATIONS, TOLERANCE)?;
            (fit.beta, fit.covariance)
        }
        ModelKind::Cox => {
            let time = Array1::from_iter(rows.iter().map(|&i| cohort.followup_years[i]));
            let fit = fit_survey_cox(
                &x,
                time.view(),
                indicator.view(),
                &survey,
                MAX_ITERATIONS,
                TOLERANCE,
            )?;
            (fit.beta, fit.covariance)
        }
    };
    Ok((
        effects_from_fit(&beta, &covariance, &predictor_terms, alpha),
        rows.len(),
    ))
}

/// Runs the full model grid over outcomes, predictor forms and the two
/// adjustment strategies. The configuration is re-validated here so a
/// programmatically built `RunConfig` cannot smuggle an unknown covariate
/// past the encoder.
pub fn estimate_associations(
    cohort: &ScoredCohort,
    config: &RunConfig,
) -> Result<Vec<AssociationResult>, ConfigError> {
    config.validate()?;
    let analyses: [(AnalysisKind, &[CovariateSet]); 2] = [
        (AnalysisKind::Primary, &config.ladder),
        (AnalysisKind::Sensitivity, &config.sensitivity_ladder),
    ];
    let mut results = Vec::new();
    for &outcome in OUTCOMES {
        let model = if outcome.is_survival() {
            ModelKind::Cox
        } else {
            ModelKind::Logistic
        };
        let candidate_rows = outcome_rows(cohort, outcome);
        let indicator = outcome.indicator(cohort);
        let events = candidate_rows
            .iter()
            .filter(|&&i| indicator[i] == 1.0)
            .count();

        for predictor in [PredictorKind::ContinuousScore, PredictorKind::QuartileFactor] {
            for (analysis, ladder) in analyses {
                if ladder.is_empty() {
                    continue;
                }
                if events < config.min_events {
                    log::warn!(
                        "outcome '{}' has {events} events (< {}); reporting as underpowered",
                        outcome.label(),
                        config.min_events
                    );
                    results.push(AssociationResult {
                        outcome: outcome.label(),
                        model,
                        predictor,
                        analysis,
                        n_used: candidate_rows.len(),
                        events,
                        status: ModelStatus::InsufficientPower {
                            events,
                            required: config.min_events,
                        },
                    });
                    continue;
                }

                let mut status = None;
                let mut last_error = String::new();
                for (rank, candidate) in ladder.iter().enumerate() {
                    match attempt_fit(cohort, outcome, predictor, &candidate_rows, candidate, config.alpha)
                    {
                        Ok((effects, n_used)) => {
                            if rank > 0 {
                                log::warn!(
                                    "outcome '{}' ({}, {}, {}): adjustment set '{}' replaced '{}' after a non-identifiable fit",
                                    outcome.label(),
                                    model.label(),
                                    predictor.label(),
                                    analysis.label(),
                                    candidate.name,
                                    ladder[..rank].iter().map(|c| c.name.as_str()).join(", ")
                                );
                            }
                            status = Some((
                                ModelStatus::Fitted {
                                    effects,
                                    covariates: candidate.name.clone(),
                                    fell_back: rank > 0,
                                },
                                n_used,
                            ));
                            break;
                        }
                        Err(error) => {
                            log::warn!(
                                "outcome '{}' ({}, {}, {}): candidate '{}' failed: {error}",
                                outcome.label(),
                                model.label(),
                                predictor.label(),
                                analysis.label(),
                                candidate.name
                            );
                            last_error = error.to_string();
                        }
                    }
                }

                let (status, n_used) = status.unwrap_or((
                    ModelStatus::Unestimable { reason: last_error },
                    candidate_rows.len(),
                ));
                results.push(AssociationResult {
                    outcome: outcome.label(),
                    model,
                    predictor,
                    analysis,
                    n_used,
                    events,
                    status,
                });
            }
        }
    }
    Ok(results)
}
