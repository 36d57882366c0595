//! Score stratification: empirical quantile cut points and stratum labels.
//!
//! One quantile convention is used everywhere in this crate: *unweighted*
//! empirical quantiles with linear interpolation between order statistics
//! (the "type 7" rule). Ties on a cut point fall into the lower stratum, so
//! a score exactly equal to cut k is assigned stratum k, deterministically.
//! Cut points are data-dependent and must be recomputed whenever the
//! eligible cohort changes.

use ndarray::ArrayView1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuartileError {
    #[error("cannot compute {requested} strata from {available} scores")]
    TooFewScores { requested: usize, available: usize },
    #[error("score values must be finite to stratify")]
    NonFiniteScore,
    #[error(
        "quantile cut points are not strictly increasing (cut {index} = {value}); the score distribution is too degenerate to stratify"
    )]
    DegenerateCuts { index: usize, value: f64 },
}

/// Linear-interpolation empirical quantile over an already sorted slice.
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    debug_assert!((0.0..=1.0).contains(&p));
    let h = p * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// The frozen cut points partitioning scores into `k` ordered strata.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileCuts {
    cuts: Vec<f64>,
}

impl QuantileCuts {
    /// Computes the `k - 1` interior cut points from the eligible scores.
    pub fn compute(scores: ArrayView1<'_, f64>, k: usize) -> Result<Self, QuartileError> {
        if scores.iter().any(|v| !v.is_finite()) {
            return Err(QuartileError::NonFiniteScore);
        }
        if scores.len() < k {
            return Err(QuartileError::TooFewScores {
                requested: k,
                available: scores.len(),
            });
        }

        let mut sorted: Vec<f64> = scores.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let cuts: Vec<f64> = (1..k)
            .map(|i| quantile_sorted(&sorted, i as f64 / k as f64))
            .collect();
        for (index, pair) in cuts.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(QuartileError::DegenerateCuts {
                    index: index + 1,
                    value: pair[1],
                });
            }
        }
        Ok(Self { cuts })
    }

    /// Builds cuts from explicit boundary values (used when a frozen cohort
    /// is re-read rather than re-stratified).
    pub fn from_boundaries(cuts: Vec<f64>) -> Self {
        Self { cuts }
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.cuts
    }

    /// Number of strata.
    pub fn stratum_count(&self) -> usize {
        self.cuts.len() + 1
    }

    /// Zero-based stratum for a score. A score exactly on a cut point goes
    /// to the lower stratum.
    pub fn assign(&self, score: f64) -> usize {
        debug_assert!(score.is_finite(), "scores are computed before stratification");
        self.cuts
            .iter()
            .position(|&cut| score <= cut)
            .unwrap_or(self.cuts.len())
    }

    /// "Q1".."Qk" display labels, Q1 = lowest resilience.
    pub fn labels(&self) -> Vec<String> {
        (1..=self.stratum_count()).map(|i| format!("Q{i}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn worked_boundaries_assign_ties_to_the_lower_stratum() {
        let cuts = QuantileCuts::from_boundaries(vec![-0.28, 0.83, 1.90]);
        assert_eq!(cuts.assign(-0.28), 0); // exactly on cut 1 -> Q1
        assert_eq!(cuts.assign(0.83), 1); // exactly on cut 2 -> Q2
        assert_eq!(cuts.assign(-0.29), 0);
        assert_eq!(cuts.assign(0.0), 1);
        assert_eq!(cuts.assign(1.90), 2);
        assert_eq!(cuts.assign(2.5), 3);
    }

    #[test]
    fn partition_is_exhaustive_and_balanced() {
        // 1000 evenly spread scores: every stratum within one of N/4.
        let scores = Array1::from_shape_fn(1000, |i| i as f64 / 10.0);
        let cuts = QuantileCuts::compute(scores.view(), 4).unwrap();
        let mut counts = [0usize; 4];
        for &s in scores.iter() {
            counts[cuts.assign(s)] += 1;
        }
        assert_eq!(counts.iter().sum::<usize>(), 1000);
        for &c in &counts {
            assert!((c as i64 - 250).abs() <= 1, "counts: {counts:?}");
        }
    }

    #[test]
    fn mean_score_strictly_increases_across_strata() {
        let scores = Array1::from_shape_fn(997, |i| (i as f64 * 0.37).sin() * 3.0);
        let cuts = QuantileCuts::compute(scores.view(), 4).unwrap();
        let mut sums = [0.0f64; 4];
        let mut counts = [0usize; 4];
        for &s in scores.iter() {
            let q = cuts.assign(s);
            sums[q] += s;
            counts[q] += 1;
        }
        let means: Vec<f64> = (0..4).map(|q| sums[q] / counts[q] as f64).collect();
        for pair in means.windows(2) {
            assert!(pair[1] > pair[0], "means not monotone: {means:?}");
        }
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let sorted = [0.0, 1.0, 2.0, 3.0];
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.5), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.25), 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 1.0), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_scores_cannot_be_stratified() {
        let scores = Array1::from_elem(100, 1.5);
        assert!(matches!(
            QuantileCuts::compute(scores.view(), 4),
            Err(QuartileError::DegenerateCuts { .. })
        ));
    }

    #[test]
    fn assignment_is_stable_across_runs() {
        let scores = Array1::from_shape_fn(503, |i| ((i * 7919) % 503) as f64 / 100.0);
        let first = QuantileCuts::compute(scores.view(), 4).unwrap();
        let second = QuantileCuts::compute(scores.view(), 4).unwrap();
        assert_eq!(first, second);
        for &s in scores.iter() {
            assert_eq!(first.assign(s), second.assign(s));
        }
    }
}
