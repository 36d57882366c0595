//! # Descriptive Tables
//!
//! Survey-weighted summaries of the scored cohort by score stratum: the
//! baseline characteristics table, the score-component table and outcome
//! prevalences. Everything here is a weighted mean under the complex design
//! (a proportion is the weighted mean of a 0/1 indicator), with Taylor
//! standard errors from [`crate::design::SurveyDesign`]. No model fitting,
//! no file output; the report stage serializes these structures.

use crate::cohort::ScoredCohort;
use crate::design::{SurveyDesign, WeightedEstimate};
use crate::estimator::{OUTCOMES, Outcome};
use ndarray::Array1;
use std::collections::BTreeSet;

/// One summarized variable: a cell per stratum plus the overall column.
#[derive(Debug, Clone)]
pub struct TableRow {
    pub variable: String,
    /// True when the estimate is a proportion rather than a mean on the
    /// variable's native scale; the report stage scales these to percent.
    pub is_proportion: bool,
    pub cells: Vec<WeightedEstimate>,
    pub overall: WeightedEstimate,
}

#[derive(Debug, Clone)]
pub struct SummaryTable {
    pub stratum_labels: Vec<String>,
    /// Unweighted participant counts per stratum, then overall.
    pub unweighted_n: Vec<usize>,
    pub rows: Vec<TableRow>,
}

/// Weighted prevalence of one outcome in one stratum.
#[derive(Debug, Clone)]
pub struct PrevalenceCell {
    pub outcome: &'static str,
    pub stratum: usize,
    pub estimate: WeightedEstimate,
}

fn stratum_labels(count: usize) -> Vec<String> {
    (1..=count).map(|q| format!("Q{q}")).collect()
}

/// The full-cohort design used by every table; one instance per run.
pub fn cohort_design(cohort: &ScoredCohort) -> SurveyDesign {
    SurveyDesign::new(
        cohort.weight.clone(),
        cohort.strata.view(),
        cohort.psu.view(),
    )
}

fn observed_rows(values: &Array1<f64>, rows: &[usize]) -> Vec<usize> {
    rows.iter().copied().filter(|&i| !values[i].is_nan()).collect()
}

fn summarize(
    design: &SurveyDesign,
    values: &Array1<f64>,
    strata_rows: &[Vec<usize>],
    all_rows: &[usize],
    variable: &str,
    is_proportion: bool,
) -> TableRow {
    let cells = strata_rows
        .iter()
        .map(|rows| design.weighted_mean_se(values.view(), &observed_rows(values, rows)))
        .collect();
    TableRow {
        variable: variable.to_string(),
        is_proportion,
        cells,
        overall: design.weighted_mean_se(values.view(), &observed_rows(values, all_rows)),
    }
}

fn indicator(values: &Array1<f64>, predicate: impl Fn(f64) -> bool) -> Array1<f64> {
    values.mapv(|v| if v.is_nan() { f64::NAN } else { predicate(v) as u8 as f64 })
}

/// Baseline characteristics by stratum: demographics, anthropometry,
/// comorbidities. Race/ethnicity expands into one proportion row per
/// observed code.
pub fn baseline_table(cohort: &ScoredCohort, design: &SurveyDesign) -> SummaryTable {
    let stratum_count = cohort.stratum_count();
    let strata_rows: Vec<Vec<usize>> = (0..stratum_count).map(|s| cohort.stratum_rows(s)).collect();
    let all_rows: Vec<usize> = (0..cohort.n_rows()).collect();

    let mut rows = Vec::new();
    rows.push(summarize(design, &cohort.age, &strata_rows, &all_rows, "age_years", false));
    let female = indicator(&cohort.sex, |v| v == 2.0);
    rows.push(summarize(design, &female, &strata_rows, &all_rows, "female", true));

    let race_codes: BTreeSet<i64> = cohort
        .race_eth
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| v as i64)
        .collect();
    for code in race_codes {
        let member = indicator(&cohort.race_eth, |v| v as i64 == code);
        rows.push(summarize(
            design,
            &member,
            &strata_rows,
            &all_rows,
            &format!("race_eth_{code}"),
            true,
        ));
    }

    rows.push(summarize(design, &cohort.bmi, &strata_rows, &all_rows, "bmi", false));
    for (values, name) in [
        (&cohort.diabetes, "diabetes"),
        (&cohort.hypertension, "hypertension"),
        (&cohort.current_smoker, "current_smoker"),
        (&cohort.cvd_history, "cvd_history"),
    ] {
        rows.push(summarize(design, values, &strata_rows, &all_rows, name, true));
    }

    let mut unweighted_n: Vec<usize> = strata_rows.iter().map(|r| r.len()).collect();
    unweighted_n.push(all_rows.len());
    SummaryTable {
        stratum_labels: stratum_labels(stratum_count),
        unweighted_n,
        rows,
    }
}

/// Score components by stratum; a sanity view of the construction (inverted
/// CRP z-score should rise monotonically across strata by definition).
pub fn component_table(cohort: &ScoredCohort, design: &SurveyDesign) -> SummaryTable {
    let stratum_count = cohort.stratum_count();
    let strata_rows: Vec<Vec<usize>> = (0..stratum_count).map(|s| cohort.stratum_rows(s)).collect();
    let all_rows: Vec<usize> = (0..cohort.n_rows()).collect();

    let mut rows = Vec::new();
    for (values, name) in [
        (&cohort.hscrp, "hscrp_mg_l"),
        (&cohort.albumin, "albumin_g_dl"),
        (&cohort.almi, "almi_kg_m2"),
        (&cohort.z_crp_inv, "z_crp_inverted"),
        (&cohort.z_albumin, "z_albumin"),
        (&cohort.z_almi, "z_almi"),
        (&cohort.score, "iri"),
    ] {
        rows.push(summarize(design, values, &strata_rows, &all_rows, name, false));
    }
    rows.push(summarize(
        design,
        &cohort.flag_albumin_low,
        &strata_rows,
        &all_rows,
        "albumin_below_3_5",
        true,
    ));

    let mut unweighted_n: Vec<usize> = strata_rows.iter().map(|r| r.len()).collect();
    unweighted_n.push(all_rows.len());
    SummaryTable {
        stratum_labels: stratum_labels(stratum_count),
        unweighted_n,
        rows,
    }
}

/// Weighted prevalence of every outcome indicator in every stratum, in
/// stratum-major order. Feeds both the prevalence table and the grouped
/// bar chart.
pub fn outcome_prevalence(cohort: &ScoredCohort, design: &SurveyDesign) -> Vec<PrevalenceCell> {
    let stratum_count = cohort.stratum_count();
    let mut cells = Vec::with_capacity(OUTCOMES.len() * stratum_count);
    for &outcome in OUTCOMES {
        let values = outcome.indicator(cohort);
        for stratum in 0..stratum_count {
            let rows = observed_rows(values, &cohort.stratum_rows(stratum));
            cells.push(PrevalenceCell {
                outcome: outcome.label(),
                stratum,
                estimate: design.weighted_mean_se(values.view(), &rows),
            });
        }
    }
    cells
}

/// Convenience lookup for one outcome's per-stratum prevalences.
pub fn prevalence_series<'a>(
    cells: &'a [PrevalenceCell],
    outcome: Outcome,
) -> Vec<&'a PrevalenceCell> {
    cells
        .iter()
        .filter(|cell| cell.outcome == outcome.label())
        .collect()
}
