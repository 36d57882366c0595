//! Survey-weighted logistic regression.
//!
//! Point estimates come from iteratively reweighted least squares with the
//! sampling weights as prior weights; the covariance is the design-based
//! sandwich: `A⁻¹ G A⁻¹`, where `A` is the weighted information matrix and
//! `G` is the between-PSU covariance of the weighted score totals. This is
//! the estimator the R `survey` package reports for `svyglm`, which is what
//! population-representative odds ratios require.
//!
//! Failure modes map onto the estimator's fallback policy: a singular
//! information matrix or runaway coefficients signal non-identifiability of
//! the requested adjustment set, and the caller drops to a smaller one.

use crate::design::SurveyDesign;
use crate::faer_ndarray::{FaerCholesky, FaerLinalgError};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, Zip};
use thiserror::Error;

const PROB_EPS: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-6;
/// Coefficients beyond this magnitude on the logit scale indicate
/// quasi-separation rather than a usable estimate.
const BETA_LIMIT: f64 = 30.0;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("information matrix is singular: {0}")]
    Singular(#[from] FaerLinalgError),
    #[error("did not converge within {max_iterations} iterations (last change {last_change:.3e})")]
    NotConverged {
        max_iterations: usize,
        last_change: f64,
    },
    #[error("coefficients diverged (|beta| reached {max_abs_beta:.1}); the model is not identifiable on this data")]
    Diverged { max_abs_beta: f64 },
    #[error("non-finite values encountered during fitting")]
    NonFinite,
    #[error("no complete cases remain under this covariate set")]
    NoCompleteCases,
}

/// A converged fit: coefficients on the logit scale and their design-based
/// covariance.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub beta: Array1<f64>,
    pub covariance: Array2<f64>,
    pub iterations: usize,
    pub deviance: f64,
}

impl LogisticFit {
    pub fn standard_error(&self, j: usize) -> f64 {
        self.covariance[[j, j]].sqrt()
    }
}

fn weighted_binomial_deviance(
    y: ArrayView1<'_, f64>,
    mu: &Array1<f64>,
    prior_weights: &Array1<f64>,
) -> f64 {
    let total = Zip::from(y)
        .and(mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mui, &wi| {
            let mui_c = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let term1 = if yi > PROB_EPS {
                yi * (yi.ln() - mui_c.ln())
            } else {
                0.0
            };
            let term2 = if yi < 1.0 - PROB_EPS {
                (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui_c).ln())
            } else {
                0.0
            };
            acc + wi * (term1 + term2)
        });
    2.0 * total
}

/// Fits `logit P(y = 1) = x'beta` under the survey design. `x` must already
/// carry an intercept column; rows of `x`, `y` and the design are parallel.
pub fn fit_survey_logistic(
    x: &Array2<f64>,
    y: ArrayView1<'_, f64>,
    design: &SurveyDesign,
    max_iterations: usize,
    tolerance: f64,
) -> Result<LogisticFit, FitError> {
    let n = x.nrows();
    let p = x.ncols();
    assert_eq!(y.len(), n);
    assert_eq!(design.n_rows(), n);
    let prior_weights = design.weights().clone();

    let mut eta = Array1::<f64>::zeros(n);
    let mut mu = eta.mapv(|e| 1.0 / (1.0 + (-e).exp()));
    let mut last_deviance = weighted_binomial_deviance(y, &mu, &prior_weights);
    let mut last_change = f64::NAN;

    for iteration in 1..=max_iterations {
        // Working weights and response at the current linear predictor.
        let variance = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
        let irls_weights = &prior_weights * &variance;
        let residual = &y.view() - &mu;
        let z = &eta + &(&residual / &variance);

        if !z.iter().all(|v| v.is_finite()) || !irls_weights.iter().all(|v| v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        // Normal equations X'WX beta = X'Wz.
        let weighted_x = x * &irls_weights.clone().insert_axis(ndarray::Axis(1));
        let xtwx = x.t().dot(&weighted_x);
        let xtwz = weighted_x.t().dot(&z);
        let factor = xtwx.cholesky(Side::Lower)?;
        let beta = factor.solve_vec(&xtwz);

        let max_abs_beta = beta.iter().fold(0.0f64, |m, &b| m.max(b.abs()));
        if max_abs_beta > BETA_LIMIT {
            return Err(FitError::Diverged { max_abs_beta });
        }

        eta = x.dot(&beta);
        mu = eta.mapv(|e| {
            let clamped = e.clamp(-700.0, 700.0);
            (1.0 / (1.0 + (-clamped).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS)
        });
        let deviance = weighted_binomial_deviance(y, &mu, &prior_weights);
        last_change = (deviance - last_deviance).abs();
        let converged = last_change < tolerance * (0.1 + deviance.abs());
        last_deviance = deviance;

        if converged && iteration >= 2 {
            log::debug!(
                "logistic IRLS converged in {iteration} iterations (deviance {deviance:.4})"
            );
            let covariance = sandwich_covariance(x, y, &mu, &prior_weights, design)?;
            return Ok(LogisticFit {
                beta,
                covariance,
                iterations: iteration,
                deviance,
            });
        }
    }

    Err(FitError::NotConverged {
        max_iterations,
        last_change,
    })
}

fn sandwich_covariance(
    x: &Array2<f64>,
    y: ArrayView1<'_, f64>,
    mu: &Array1<f64>,
    prior_weights: &Array1<f64>,
    design: &SurveyDesign,
) -> Result<Array2<f64>, FitError> {
    let p = x.ncols();
    let variance = mu.mapv(|m| m * (1.0 - m));
    let irls_weights = prior_weights * &variance;
    let weighted_x = x * &irls_weights.insert_axis(ndarray::Axis(1));
    let info = x.t().dot(&weighted_x);
    let info_inv = info.cholesky(Side::Lower)?.inverse(p);

    // Weighted score contribution of each observation.
    let score_scale = prior_weights * &(&y.view() - mu);
    let scores = x * &score_scale.insert_axis(ndarray::Axis(1));
    let g = design.sandwich_covariance(&scores);
    Ok(info_inv.dot(&g).dot(&info_inv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, stack};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal, Uniform};

    fn synthetic_design(n: usize) -> SurveyDesign {
        let weights = Array1::from_elem(n, 1.0);
        let strata = Array1::from_shape_fn(n, |i| (i % 8) as f64 + 1.0);
        let psu = Array1::from_shape_fn(n, |i| ((i / 8) % 4) as f64 + 1.0);
        SurveyDesign::new(weights, strata.view(), psu.view())
    }

    fn simulate(n: usize, b0: f64, b1: f64, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let uniform = Uniform::new(0.0, 1.0);
        let covariate = Array1::from_shape_fn(n, |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(n, |i| {
            let p = 1.0 / (1.0 + (-(b0 + b1 * covariate[i])).exp());
            if uniform.sample(&mut rng) < p { 1.0 } else { 0.0 }
        });
        let intercept = Array1::from_elem(n, 1.0);
        let x = stack![ndarray::Axis(1), intercept, covariate];
        (x, y)
    }

    #[test]
    fn recovers_a_known_odds_ratio() {
        // Generating OR per unit of the covariate: 0.81.
        let b1 = 0.81f64.ln();
        let (x, y) = simulate(6000, -0.6, b1, 7);
        let design = synthetic_design(6000);
        let fit = fit_survey_logistic(&x, y.view(), &design, 50, 1e-8).unwrap();
        let or = fit.beta[1].exp();
        assert!(
            (or - 0.81).abs() < 0.08,
            "estimated OR {or:.3} too far from 0.81"
        );
        assert!(fit.standard_error(1) > 0.0);
    }

    #[test]
    fn null_covariate_gives_or_near_one_and_large_p() {
        let (x, y) = simulate(4000, 0.2, 0.0, 11);
        let design = synthetic_design(4000);
        let fit = fit_survey_logistic(&x, y.view(), &design, 50, 1e-8).unwrap();
        let or = fit.beta[1].exp();
        assert!((or - 1.0).abs() < 0.15, "null OR drifted to {or:.3}");
        let z = fit.beta[1] / fit.standard_error(1);
        assert!(z.abs() < 3.0);
    }

    #[test]
    fn intercept_only_matches_weighted_prevalence() {
        let n = 400;
        let y = Array1::from_shape_fn(n, |i| (i % 4 == 0) as u8 as f64);
        let x = Array2::from_elem((n, 1), 1.0);
        let design = synthetic_design(n);
        let fit = fit_survey_logistic(&x, y.view(), &design, 50, 1e-10).unwrap();
        let fitted_prevalence = 1.0 / (1.0 + (-fit.beta[0]).exp());
        assert_abs_diff_eq!(fitted_prevalence, 0.25, epsilon = 1e-6);
    }

    #[test]
    fn perfect_separation_is_reported_as_non_identifiable() {
        let n = 200;
        let covariate = Array1::from_shape_fn(n, |i| i as f64 / n as f64 - 0.5);
        let y = covariate.mapv(|v| (v > 0.0) as u8 as f64);
        let intercept = Array1::from_elem(n, 1.0);
        let x = stack![ndarray::Axis(1), intercept, covariate];
        let design = synthetic_design(n);
        let result = fit_survey_logistic(&x, y.view(), &design, 100, 1e-10);
        assert!(
            matches!(
                result,
                Err(FitError::Diverged { .. })
                    | Err(FitError::Singular(_))
                    | Err(FitError::NotConverged { .. })
            ),
            "separated data must not produce a fit"
        );
    }

    #[test]
    fn collinear_columns_are_singular() {
        let n = 300;
        let covariate = Array1::from_shape_fn(n, |i| (i % 10) as f64);
        let doubled = covariate.mapv(|v| 2.0 * v);
        let intercept = Array1::from_elem(n, 1.0);
        let x = stack![ndarray::Axis(1), intercept, covariate, doubled];
        let y = Array1::from_shape_fn(n, |i| (i % 3 == 0) as u8 as f64);
        let design = synthetic_design(n);
        assert!(matches!(
            fit_survey_logistic(&x, y.view(), &design, 50, 1e-8),
            Err(FitError::Singular(_))
        ));
    }
}
