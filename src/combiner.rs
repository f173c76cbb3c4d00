//! Inverse-variance-weighted combination of successive iteration results.

use crate::error::{Error, Result};
use crate::iteration::Iteration;

/// Combines a sequence of [`Iteration`]s into a single inverse-variance-weighted mean
/// with a χ²/dof consistency diagnostic.
#[derive(Clone, Debug, Default)]
pub struct Combiner {
    iterations: Vec<Iteration>,
}

impl Combiner {
    /// Constructs an empty combiner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes one iteration's accumulator. Iterations with zero samples are ignored.
    pub fn push(&mut self, iter: Iteration) {
        if !iter.is_empty() {
            self.iterations.push(iter);
        }
    }

    /// Pushes every iteration held by `other` into `self`.
    pub fn push_result(&mut self, other: &Self) {
        for iter in &other.iterations {
            self.push(*iter);
        }
    }

    /// Clears all accumulated iterations.
    pub fn reset(&mut self) {
        self.iterations.clear();
    }

    /// Total number of samples across all pushed iterations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.iterations.iter().map(Iteration::count).sum()
    }

    /// `true` if no iterations have been pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    /// The kept iterations, in push order, for data save/load.
    #[must_use]
    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    fn weighted(&self) -> Option<(f64, f64, usize)> {
        let mut sum_wv = 0.0;
        let mut sum_w = 0.0;
        let mut kept = 0;

        for it in &self.iterations {
            let v = it.value().ok()?;
            let var = it.variance().unwrap_or(0.0);
            if var > 0.0 {
                let w = 1.0 / var;
                sum_wv += w * v;
                sum_w += w;
                kept += 1;
            }
        }

        if sum_w > 0.0 {
            Some((sum_wv / sum_w, 1.0 / sum_w, kept))
        } else {
            // every kept variance was non-positive: fall back to the arithmetic mean
            let n = self.iterations.len();
            if n == 0 {
                return None;
            }
            let mean = self
                .iterations
                .iter()
                .filter_map(|it| it.value().ok())
                .sum::<f64>()
                / n as f64;
            Some((mean, 0.0, 0))
        }
    }

    /// The inverse-variance-weighted mean of all kept iterations, or the arithmetic mean
    /// if every iteration has non-positive variance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoResults`] if no iterations have been pushed.
    pub fn value(&self) -> Result<f64> {
        self.weighted().map(|(v, _, _)| v).ok_or(Error::NoResults)
    }

    /// The variance of the combined mean (the reciprocal of the summed inverse
    /// variances).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoResults`] if no iterations have been pushed.
    pub fn variance(&self) -> Result<f64> {
        self.weighted().map(|(_, var, _)| var).ok_or(Error::NoResults)
    }

    /// `√variance()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoResults`] if no iterations have been pushed.
    pub fn error(&self) -> Result<f64> {
        self.variance().map(f64::sqrt)
    }

    /// χ² = Σ(⟨f⟩ᵢ − μ)² / Varᵢ over the iterations kept in the weighted mean.
    #[must_use]
    pub fn chi2(&self) -> f64 {
        let Ok(mean) = self.value() else {
            return 0.0;
        };
        self.iterations
            .iter()
            .filter_map(|it| {
                let v = it.value().ok()?;
                let var = it.variance().ok()?;
                (var > 0.0).then_some((v, var))
            })
            .map(|(v, var)| (v - mean).powi(2) / var)
            .sum()
    }

    /// Degrees of freedom: `kept - 1`, where `kept` is the number of iterations with
    /// positive variance.
    #[must_use]
    pub fn dof(&self) -> usize {
        let kept = self.weighted().map_or(0, |(_, _, kept)| kept);
        kept.saturating_sub(1)
    }

    /// `chi2() / dof()`, or `0.0` when fewer than two iterations were kept.
    #[must_use]
    pub fn chi2_per_dof(&self) -> f64 {
        let dof = self.dof();
        if dof == 0 {
            0.0
        } else {
            self.chi2() / dof as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn iter_of(values: &[f64]) -> Iteration {
        let mut it = Iteration::new();
        for &v in values {
            it.accumulate(v);
        }
        it
    }

    #[test]
    fn empty_fails() {
        let c = Combiner::new();
        assert!(matches!(c.value(), Err(Error::NoResults)));
    }

    #[test]
    fn zero_sample_iterations_are_ignored() {
        let mut c = Combiner::new();
        c.push(Iteration::new());
        assert!(c.is_empty());
    }

    #[test]
    fn order_independence() {
        let a = iter_of(&[1.0, 1.1, 0.9, 1.05]);
        let b = iter_of(&[2.0, 2.2, 1.8, 2.1, 1.95]);
        let c = iter_of(&[0.5, 0.6, 0.4]);

        let mut forward = Combiner::new();
        forward.push(a);
        forward.push(b);
        forward.push(c);

        let mut backward = Combiner::new();
        backward.push(c);
        backward.push(b);
        backward.push(a);

        assert_approx_eq!(f64, forward.value().unwrap(), backward.value().unwrap());
        assert_approx_eq!(f64, forward.variance().unwrap(), backward.variance().unwrap());
        assert_approx_eq!(f64, forward.chi2_per_dof(), backward.chi2_per_dof());
    }

    #[test]
    fn single_iteration_has_zero_dof() {
        let mut c = Combiner::new();
        c.push(iter_of(&[1.0, 1.1, 0.95]));
        assert_eq!(c.dof(), 0);
        assert_approx_eq!(f64, c.chi2_per_dof(), 0.0);
    }

    #[test]
    fn all_zero_variance_falls_back_to_arithmetic_mean() {
        let mut c = Combiner::new();
        let mut one = Iteration::new();
        one.accumulate(2.0);
        c.push(one);
        let mut two = Iteration::new();
        two.accumulate(4.0);
        c.push(two);

        assert_approx_eq!(f64, c.value().unwrap(), 3.0);
    }
}
