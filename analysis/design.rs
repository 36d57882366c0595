//! Complex-survey design: sampling weights, strata and primary sampling
//! units, shared by the descriptive stratifier and the association
//! estimator.
//!
//! Variance estimation is by Taylor linearization: the variance of a
//! weighted total is the between-PSU variance of PSU totals within each
//! stratum, scaled by `n_h / (n_h - 1)`. A stratum with a single PSU cannot
//! contribute a between-PSU term and is counted as zero, with a warning (the
//! centered single-unit convention). Means and proportions are ratios of
//! totals, linearized through their influence values.

use ndarray::{Array1, Array2, ArrayView1};
use std::collections::BTreeMap;

/// A point estimate with its design-based standard error and the unweighted
/// number of observations that fed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedEstimate {
    pub estimate: f64,
    pub se: f64,
    pub n: usize,
}

#[derive(Debug)]
pub struct SurveyDesign {
    weights: Array1<f64>,
    /// stratum code -> psu code -> member rows.
    groups: BTreeMap<i64, BTreeMap<i64, Vec<usize>>>,
    singleton_strata: usize,
}

impl SurveyDesign {
    pub fn new(weights: Array1<f64>, strata: ArrayView1<'_, f64>, psu: ArrayView1<'_, f64>) -> Self {
        assert_eq!(weights.len(), strata.len());
        assert_eq!(weights.len(), psu.len());
        let mut groups: BTreeMap<i64, BTreeMap<i64, Vec<usize>>> = BTreeMap::new();
        for i in 0..weights.len() {
            groups
                .entry(strata[i] as i64)
                .or_default()
                .entry(psu[i] as i64)
                .or_default()
                .push(i);
        }
        let singleton_strata = groups.values().filter(|psus| psus.len() < 2).count();
        if singleton_strata > 0 {
            log::warn!(
                "{singleton_strata} design stratum(s) hold a single PSU; their between-PSU variance contribution is zero."
            );
        }
        Self {
            weights,
            groups,
            singleton_strata,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn singleton_strata(&self) -> usize {
        self.singleton_strata
    }

    /// Variance of the weighted total of a full-length per-row contribution
    /// vector (rows outside the quantity of interest must carry zeros).
    pub fn variance_of_total(&self, contributions: ArrayView1<'_, f64>) -> f64 {
        debug_assert_eq!(contributions.len(), self.n_rows());
        let mut variance = 0.0;
        for psus in self.groups.values() {
            let n_h = psus.len();
            if n_h < 2 {
                continue;
            }
            let totals: Vec<f64> = psus
                .values()
                .map(|rows| rows.iter().map(|&i| contributions[i]).sum())
                .collect();
            let mean = totals.iter().sum::<f64>() / n_h as f64;
            let ss: f64 = totals.iter().map(|t| (t - mean) * (t - mean)).sum();
            variance += ss * n_h as f64 / (n_h - 1) as f64;
        }
        variance
    }

    /// Survey-weighted mean of `values` over `rows`, with linearized SE.
    /// Works for proportions when `values` is a 0/1 indicator.
    pub fn weighted_mean_se(&self, values: ArrayView1<'_, f64>, rows: &[usize]) -> WeightedEstimate {
        debug_assert_eq!(values.len(), self.n_rows());
        let weight_total: f64 = rows.iter().map(|&i| self.weights[i]).sum();
        if rows.is_empty() || weight_total <= 0.0 {
            return WeightedEstimate {
                estimate: f64::NAN,
                se: f64::NAN,
                n: rows.len(),
            };
        }
        let estimate =
            rows.iter().map(|&i| self.weights[i] * values[i]).sum::<f64>() / weight_total;

        // Influence of each observation on the ratio estimator.
        let mut influence = Array1::zeros(self.n_rows());
        for &i in rows {
            influence[i] = self.weights[i] * (values[i] - estimate) / weight_total;
        }
        let se = self.variance_of_total(influence.view()).sqrt();
        WeightedEstimate {
            estimate,
            se,
            n: rows.len(),
        }
    }

    /// Design-based covariance of a vector of weighted estimating-equation
    /// totals: `scores` holds one p-length contribution row per observation.
    pub fn sandwich_covariance(&self, scores: &Array2<f64>) -> Array2<f64> {
        debug_assert_eq!(scores.nrows(), self.n_rows());
        let p = scores.ncols();
        let mut g = Array2::zeros((p, p));
        for psus in self.groups.values() {
            let n_h = psus.len();
            if n_h < 2 {
                continue;
            }
            let factor = n_h as f64 / (n_h - 1) as f64;
            let mut totals: Vec<Array1<f64>> = Vec::with_capacity(n_h);
            for rows in psus.values() {
                let mut total = Array1::zeros(p);
                for &i in rows {
                    total += &scores.row(i);
                }
                totals.push(total);
            }
            let mut mean = Array1::<f64>::zeros(p);
            for total in &totals {
                mean += total;
            }
            mean /= n_h as f64;
            for total in &totals {
                let dev = total - &mean;
                for a in 0..p {
                    for b in 0..p {
                        g[[a, b]] += factor * dev[a] * dev[b];
                    }
                }
            }
        }
        g
    }
}
