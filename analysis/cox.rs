//! Survey-weighted Cox proportional-hazards regression and the weighted
//! Kaplan-Meier estimator.
//!
//! The partial likelihood uses the Breslow convention for ties. Point
//! estimates come from Newton iterations with step halving; the covariance
//! is the same design-based sandwich as the logistic fit, assembled from
//! per-subject score residuals clustered by PSU within strata. Risk-set
//! sums are accumulated over a single descending-time sweep, so a fit is
//! `O(n log n + n p²)`.

use crate::design::SurveyDesign;
use crate::faer_ndarray::FaerCholesky;
use crate::logistic::FitError;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1};

const BETA_LIMIT: f64 = 30.0;
const MAX_STEP_HALVINGS: usize = 5;

/// A converged fit: coefficients on the log-hazard scale and their
/// design-based covariance.
#[derive(Debug, Clone)]
pub struct CoxFit {
    pub beta: Array1<f64>,
    pub covariance: Array2<f64>,
    pub iterations: usize,
    pub log_likelihood: f64,
}

impl CoxFit {
    pub fn standard_error(&self, j: usize) -> f64 {
        self.covariance[[j, j]].sqrt()
    }
}

struct PartialLikelihood {
    log_likelihood: f64,
    gradient: Array1<f64>,
    hessian: Array2<f64>,
    /// Per distinct event time, ascending: (time, weighted events d,
    /// S0, S1/S0), retained for the score residuals.
    event_records: Vec<(f64, f64, f64, Array1<f64>)>,
}

/// One sweep over the risk sets at fixed `beta`.
fn evaluate(
    x: &Array2<f64>,
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, f64>,
    weights: &Array1<f64>,
    beta: &Array1<f64>,
    order_desc: &[usize],
) -> Result<PartialLikelihood, FitError> {
    let p = x.ncols();
    let eta = x.dot(beta);
    if !eta.iter().all(|v| v.is_finite()) {
        return Err(FitError::NonFinite);
    }

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));
    let mut log_likelihood = 0.0;
    let mut gradient = Array1::<f64>::zeros(p);
    let mut hessian = Array2::<f64>::zeros((p, p));
    let mut event_records = Vec::new();

    let mut idx = 0;
    while idx < order_desc.len() {
        let t = time[order_desc[idx]];
        // Everyone with this exact time enters the risk set before any
        // event at this time is scored (Breslow).
        let mut tied_end = idx;
        while tied_end < order_desc.len() && time[order_desc[tied_end]] == t {
            let i = order_desc[tied_end];
            let r = weights[i] * eta[i].exp();
            s0 += r;
            for a in 0..p {
                s1[a] += r * x[[i, a]];
                for b in 0..p {
                    s2[[a, b]] += r * x[[i, a]] * x[[i, b]];
                }
            }
            tied_end += 1;
        }

        let mut d = 0.0;
        for &i in &order_desc[idx..tied_end] {
            if event[i] == 1.0 {
                let w = weights[i];
                d += w;
                log_likelihood += w * (eta[i] - s0.ln());
                for a in 0..p {
                    gradient[a] += w * (x[[i, a]] - s1[a] / s0);
                    for b in 0..p {
                        hessian[[a, b]] +=
                            w * (s2[[a, b]] / s0 - (s1[a] / s0) * (s1[b] / s0));
                    }
                }
            }
        }
        if d > 0.0 {
            event_records.push((t, d, s0, &s1 / s0));
        }
        idx = tied_end;
    }

    // Sweep runs from the latest time down, so records come out descending.
    event_records.reverse();
    Ok(PartialLikelihood {
        log_likelihood,
        gradient,
        hessian,
        event_records,
    })
}

/// Fits a weighted Cox model under the survey design. `event` is a 0/1
/// indicator aligned with `time`; rows with missing values must have been
/// dropped by the caller.
pub fn fit_survey_cox(
    x: &Array2<f64>,
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, f64>,
    design: &SurveyDesign,
    max_iterations: usize,
    tolerance: f64,
) -> Result<CoxFit, FitError> {
    let n = x.nrows();
    let p = x.ncols();
    assert_eq!(time.len(), n);
    assert_eq!(event.len(), n);
    assert_eq!(design.n_rows(), n);
    let weights = design.weights().clone();

    let mut order_desc: Vec<usize> = (0..n).collect();
    order_desc.sort_by(|&a, &b| time[b].total_cmp(&time[a]));

    let mut beta = Array1::<f64>::zeros(p);
    let mut current = evaluate(x, time, event, &weights, &beta, &order_desc)?;
    let mut last_change = f64::NAN;

    for iteration in 1..=max_iterations {
        let factor = current.hessian.cholesky(Side::Lower)?;
        let direction = factor.solve_vec(&current.gradient);

        // Newton step with halving if the partial likelihood worsens.
        let mut step = 1.0;
        let mut candidate_beta;
        let mut candidate;
        loop {
            candidate_beta = &beta + &(&direction * step);
            candidate = evaluate(x, time, event, &weights, &candidate_beta, &order_desc)?;
            if candidate.log_likelihood >= current.log_likelihood - 1e-12 || step < 1.0 / (1 << MAX_STEP_HALVINGS) as f64
            {
                break;
            }
            step /= 2.0;
        }

        let max_abs_beta = candidate_beta.iter().fold(0.0f64, |m, &b| m.max(b.abs()));
        if max_abs_beta > BETA_LIMIT {
            return Err(FitError::Diverged { max_abs_beta });
        }

        last_change = (candidate.log_likelihood - current.log_likelihood).abs();
        beta = candidate_beta;
        current = candidate;

        if last_change < tolerance * (0.1 + current.log_likelihood.abs()) {
            log::debug!(
                "Cox Newton converged in {iteration} iterations (log-likelihood {:.4})",
                current.log_likelihood
            );
            let covariance = cox_sandwich(x, time, event, &weights, &beta, design, &current)?;
            return Ok(CoxFit {
                beta,
                covariance,
                iterations: iteration,
                log_likelihood: current.log_likelihood,
            });
        }
    }

    Err(FitError::NotConverged {
        max_iterations,
        last_change,
    })
}

/// Lin-Wei score residuals clustered through the design.
fn cox_sandwich(
    x: &Array2<f64>,
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, f64>,
    weights: &Array1<f64>,
    beta: &Array1<f64>,
    design: &SurveyDesign,
    state: &PartialLikelihood,
) -> Result<Array2<f64>, FitError> {
    let n = x.nrows();
    let p = x.ncols();
    let eta = x.dot(beta);

    // Martingale pieces accumulated over event times at or before each
    // subject's own time: G0 = sum d/S0, G1 = sum d*S1/S0^2.
    let mut order_asc: Vec<usize> = (0..n).collect();
    order_asc.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

    let mut scores = Array2::<f64>::zeros((n, p));
    let mut g0 = 0.0;
    let mut g1 = Array1::<f64>::zeros(p);
    let mut record_idx = 0;
    for &i in &order_asc {
        while record_idx < state.event_records.len() && state.event_records[record_idx].0 <= time[i]
        {
            let (_, d, s0, xbar) = &state.event_records[record_idx];
            g0 += d / s0;
            g1 += &(xbar * (d / s0));
            record_idx += 1;
        }
        let expected = eta[i].exp();
        // Event part: x_i - xbar at the subject's own event time.
        if event[i] == 1.0 {
            if let Some((_, _, _, xbar)) = state
                .event_records
                .iter()
                .find(|record| record.0 == time[i])
            {
                for a in 0..p {
                    scores[[i, a]] += weights[i] * (x[[i, a]] - xbar[a]);
                }
            }
        }
        for a in 0..p {
            scores[[i, a]] -= weights[i] * expected * (x[[i, a]] * g0 - g1[a]);
        }
    }

    let info_inv = state.hessian.cholesky(Side::Lower)?.inverse(p);
    let g = design.sandwich_covariance(&scores);
    Ok(info_inv.dot(&g).dot(&info_inv))
}

/// One weighted product-limit survival curve.
#[derive(Debug, Clone, PartialEq)]
pub struct KmCurve {
    /// Event times, ascending, starting at 0.
    pub times: Vec<f64>,
    /// Survival probability after each corresponding time.
    pub survival: Vec<f64>,
}

/// Weighted Kaplan-Meier estimator over a row subset.
pub fn weighted_kaplan_meier(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, f64>,
    weights: &Array1<f64>,
    rows: &[usize],
) -> KmCurve {
    let mut order: Vec<usize> = rows.to_vec();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

    let mut at_risk: f64 = order.iter().map(|&i| weights[i]).sum();
    let mut survival = 1.0;
    let mut times = vec![0.0];
    let mut curve = vec![1.0];

    let mut idx = 0;
    while idx < order.len() {
        let t = time[order[idx]];
        let mut tied_end = idx;
        let mut events_here = 0.0;
        let mut leaving_here = 0.0;
        while tied_end < order.len() && time[order[tied_end]] == t {
            let i = order[tied_end];
            if event[i] == 1.0 {
                events_here += weights[i];
            }
            leaving_here += weights[i];
            tied_end += 1;
        }
        if events_here > 0.0 && at_risk > 0.0 {
            survival *= 1.0 - events_here / at_risk;
            times.push(t);
            curve.push(survival);
        }
        at_risk -= leaving_here;
        idx = tied_end;
    }

    KmCurve {
        times,
        survival: curve,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::stack;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Uniform};

    fn flat_design(n: usize) -> SurveyDesign {
        let weights = Array1::from_elem(n, 1.0);
        let strata = Array1::from_shape_fn(n, |i| (i % 6) as f64 + 1.0);
        let psu = Array1::from_shape_fn(n, |i| ((i / 6) % 3) as f64 + 1.0);
        SurveyDesign::new(weights, strata.view(), psu.view())
    }

    fn simulate_exponential(n: usize, log_hr: f64, seed: u64) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let uniform = Uniform::new(1e-12, 1.0);
        let group = Array1::from_shape_fn(n, |i| (i % 2) as f64);
        let censor_at = 2.0;
        let mut time = Array1::zeros(n);
        let mut event = Array1::zeros(n);
        for i in 0..n {
            let hazard = (log_hr * group[i]).exp();
            let t: f64 = -(uniform.sample(&mut rng) as f64).ln() / hazard;
            if t < censor_at {
                time[i] = t;
                event[i] = 1.0;
            } else {
                time[i] = censor_at;
                event[i] = 0.0;
            }
        }
        let x = stack![ndarray::Axis(1), group];
        (x, time, event)
    }

    #[test]
    fn recovers_a_known_hazard_ratio() {
        let log_hr = 0.6f64;
        let (x, time, event) = simulate_exponential(3000, log_hr, 3);
        let design = flat_design(3000);
        let fit = fit_survey_cox(&x, time.view(), event.view(), &design, 50, 1e-9).unwrap();
        assert!(
            (fit.beta[0] - log_hr).abs() < 0.12,
            "estimated log HR {:.3} too far from {log_hr}",
            fit.beta[0]
        );
        assert!(fit.standard_error(0) > 0.0);
    }

    #[test]
    fn null_effect_stays_near_zero() {
        let (x, time, event) = simulate_exponential(2000, 0.0, 9);
        let design = flat_design(2000);
        let fit = fit_survey_cox(&x, time.view(), event.view(), &design, 50, 1e-9).unwrap();
        assert!(fit.beta[0].abs() < 0.15, "null log HR drifted to {:.3}", fit.beta[0]);
    }

    #[test]
    fn km_matches_a_hand_worked_example() {
        // 4 subjects, unit weights: events at t=1 (of 4 at risk) and t=3
        // (of 2 at risk); censoring at t=2.
        let time = ndarray::array![1.0, 2.0, 3.0, 4.0];
        let event = ndarray::array![1.0, 0.0, 1.0, 0.0];
        let weights = Array1::from_elem(4, 1.0);
        let curve = weighted_kaplan_meier(time.view(), event.view(), &weights, &[0, 1, 2, 3]);
        assert_eq!(curve.times, vec![0.0, 1.0, 3.0]);
        assert_abs_diff_eq!(curve.survival[1], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(curve.survival[2], 0.75 * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn km_weights_move_the_curve() {
        let time = ndarray::array![1.0, 2.0];
        let event = ndarray::array![1.0, 0.0];
        let weights = ndarray::array![1.0, 3.0];
        let curve = weighted_kaplan_meier(time.view(), event.view(), &weights, &[0, 1]);
        // Weighted at-risk 4, weighted events 1.
        assert_abs_diff_eq!(curve.survival[1], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn tied_event_times_share_one_risk_set() {
        let time = ndarray::array![1.0, 1.0, 2.0, 2.0];
        let event = ndarray::array![1.0, 1.0, 0.0, 0.0];
        let weights = Array1::from_elem(4, 1.0);
        let curve = weighted_kaplan_meier(time.view(), event.view(), &weights, &[0, 1, 2, 3]);
        assert_eq!(curve.times.len(), 2);
        assert_abs_diff_eq!(curve.survival[1], 0.5, epsilon = 1e-12);
    }
}
