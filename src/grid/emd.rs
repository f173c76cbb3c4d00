//! Wasserstein-1 distance (Earth Mover's Distance) between two one-dimensional
//! distributions given as equal-mass edge lists on `[0, 1]`.
//!
//! Each edge array is treated as `n` equal-mass atoms located at its edge values (the
//! empirical distribution of its own bin boundaries), not as the continuous
//! piecewise-uniform distribution those bins would imply — two edge lists that describe
//! the same continuous distribution under different binnings are not considered
//! identical by this measure, which is what makes it useful for scoring how much two
//! differently-placed grids have actually diverged.

/// Step-function CDF value of `edges` (an `n`-atom equal-mass empirical distribution) at
/// `x`: the fraction of `edges` that are `<= x`.
fn step_cdf(edges: &[f64], x: f64) -> f64 {
    let count = edges.partition_point(|&e| e <= x);
    count as f64 / edges.len() as f64
}

/// Wasserstein-1 distance between the two equal-mass empirical distributions
/// represented by `a` and `b`'s strictly increasing edge lists (both ending at `1.0`).
/// Computed as `integral_0^1 |F_a(x) - F_b(x)| dx`, where `F_a`, `F_b` are the
/// respective step CDFs: since both are constant between consecutive breakpoints of
/// their merged, deduplicated union, the integral reduces to a sum of rectangles, one
/// per gap between consecutive breakpoints.
///
/// # Panics
///
/// Panics if either edge list is empty.
#[must_use]
pub fn earth_movers_distance(a: &[f64], b: &[f64]) -> f64 {
    assert!(!a.is_empty() && !b.is_empty(), "edge lists must be non-empty");

    let mut breakpoints: Vec<f64> = std::iter::once(0.0).chain(a.iter().copied()).chain(b.iter().copied()).collect();
    breakpoints.sort_by(|l, r| l.partial_cmp(r).expect("NaN edge"));
    breakpoints.dedup_by(|l, r| (*l - *r).abs() < f64::EPSILON);

    breakpoints
        .windows(2)
        .map(|w| {
            let (left, right) = (w[0], w[1]);
            let diff = (step_cdf(a, left) - step_cdf(b, left)).abs();
            diff * (right - left)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn distance_to_self_is_zero() {
        let a = vec![0.2, 0.5, 0.8, 1.0];
        assert_approx_eq!(f64, earth_movers_distance(&a, &a), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn quarter_offset_uniform_distributions() {
        // S5: EMD({0.5, 1.0}, {0.25, 0.5, 0.75, 1.0}) = 0.125
        let a = vec![0.5, 1.0];
        let b = vec![0.25, 0.5, 0.75, 1.0];
        assert_approx_eq!(f64, earth_movers_distance(&a, &b), 0.125, epsilon = 1e-9);
    }

    #[test]
    fn symmetric_in_its_arguments() {
        let a = vec![0.3, 0.6, 1.0];
        let b = vec![0.1, 0.4, 0.7, 1.0];
        assert_approx_eq!(
            f64,
            earth_movers_distance(&a, &b),
            earth_movers_distance(&b, &a),
            epsilon = 1e-9
        );
    }

    #[test]
    fn non_negative() {
        let a = vec![0.1, 0.2, 0.3, 1.0];
        let b = vec![0.9, 0.95, 1.0];
        assert!(earth_movers_distance(&a, &b) >= 0.0);
    }

    #[test]
    fn finer_grid_against_itself_coarsened_is_zero() {
        let a = vec![0.25, 0.5, 0.75, 1.0];
        assert_approx_eq!(f64, earth_movers_distance(&a, &a), 0.0, epsilon = 1e-9);
    }
}
