//! VEGAS sampler: an independent, per-axis adaptive grid (C7).

use log::debug;

use crate::cell::Cell;
use crate::fingerprint::fingerprint_vegas;
use crate::grid::array::FlatGrid;
use crate::grid::refine;
use crate::rng::Rng;

/// Default damping exponent α.
pub const DEFAULT_ALPHA: f64 = 0.75;
/// Default number of bins per axis.
pub const DEFAULT_K: usize = 128;

/// A `[d, K]` grid of per-axis bin edges, adapted independently along each dimension.
///
/// Edges are stored as `d` rows of `K + 1` values each (`edges.row(i)[0] == 0.0`,
/// `edges.row(i)[K] == 1.0`), backed by one [`FlatGrid`] allocation. Per-cell importance
/// accumulators are a flat `d * K` array of [`Cell`]s, cleared on every `adapt()`.
#[derive(Clone, Debug)]
pub struct VegasGrid {
    d: usize,
    k: usize,
    alpha: f64,
    edges: FlatGrid,
    cells: Vec<Cell>,
    n_total: u64,
}

impl VegasGrid {
    /// Constructs a uniform grid of dimension `d` with `k` bins per axis and damping
    /// exponent `alpha`.
    #[must_use]
    pub fn new(d: usize, k: usize, alpha: f64) -> Self {
        let mut grid = Self {
            d,
            k,
            alpha,
            edges: FlatGrid::new(&[d, k + 1], 0.0),
            cells: vec![Cell::new(); d * k],
            n_total: 0,
        };
        grid.reset_edges();
        grid
    }

    fn reset_edges(&mut self) {
        for i in 0..self.d {
            let row = self.edges.row_mut(&[i]);
            for (j, slot) in row.iter_mut().enumerate() {
                *slot = j as f64 / self.k as f64;
            }
        }
    }

    /// Dimension `d`.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.d
    }

    /// Bins per axis, `K`.
    #[must_use]
    pub const fn k(&self) -> usize {
        self.k
    }

    /// Damping exponent α.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Total number of samples accumulated into the per-cell importance table since the
    /// last `adapt()`/`reset()`.
    #[must_use]
    pub const fn n_total(&self) -> u64 {
        self.n_total
    }

    /// Overwrites the running sample count, used when restoring accumulated data.
    pub fn set_n_total(&mut self, n: u64) {
        self.n_total = n;
    }

    /// The flat `d * K` per-cell importance table, for data save/load.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Mutable access to the flat `d * K` per-cell importance table.
    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    fn cell_index(&self, i: usize, j: usize) -> usize {
        i * self.k + j
    }

    /// Draws one point: for each dimension independently, draws `u`, locates the bin
    /// `j = floor(u*K)`, and maps `u`'s fractional part linearly across that bin's edges.
    /// Writes the mapped coordinate into `x` and the chosen bin index per dimension into
    /// `idx` (needed later by [`Self::accumulate`]). Returns the sampling weight
    /// (product over dimensions of `K * bin width`).
    ///
    /// # Panics
    ///
    /// Panics if `x.len() != self.dim()` or `idx.len() != self.dim()`.
    pub fn sample(&self, rng: &mut Rng, x: &mut [f64], idx: &mut [usize]) -> f64 {
        assert_eq!(x.len(), self.d);
        assert_eq!(idx.len(), self.d);

        let k = self.k as f64;
        let mut weight = 1.0;
        for i in 0..self.d {
            let u = rng.next_f64();
            let j = ((u * k) as usize).min(self.k - 1);
            let frac = u * k - j as f64;

            let row = self.edges.row(&[i]);
            let g_low = row[j];
            let g_upp = row[j + 1];

            x[i] = g_low + frac * (g_upp - g_low);
            weight *= k * (g_upp - g_low);
            idx[i] = j;
        }
        weight
    }

    /// Accumulates one evaluated sample's contribution into the per-cell importance
    /// table, keyed by the bin indices `idx` returned from [`Self::sample`].
    ///
    /// # Panics
    ///
    /// Panics if `idx.len() != self.dim()`.
    pub fn accumulate(&mut self, idx: &[usize], f: f64, weight: f64) {
        assert_eq!(idx.len(), self.d);
        let acc = f * f * weight * weight;
        for (i, &j) in idx.iter().enumerate() {
            let ci = self.cell_index(i, j);
            self.cells[ci] += acc;
        }
        self.n_total += 1;
    }

    /// Refines every axis independently: floors/smooths/damps the per-cell importance
    /// table, then rebins that axis into `K` equal-(damped-)mass cells. Clears the
    /// per-cell accumulators afterward. A no-op (with a logged warning from
    /// [`refine::rebin_equal_mass`]) for an axis whose accumulated mass has underflowed.
    pub fn adapt(&mut self) {
        if self.n_total == 0 {
            return;
        }
        let n_sq = (self.n_total as f64) * (self.n_total as f64);

        for i in 0..self.d {
            debug_assert_eq!(
                (0..self.k).map(|j| self.cells[self.cell_index(i, j)].count()).sum::<u64>(),
                self.n_total,
                "axis {i}: per-cell sample counts must sum to n_total before refining"
            );

            let mut d_raw: Vec<f64> = (0..self.k)
                .map(|j| self.cells[self.cell_index(i, j)].sum() / n_sq)
                .collect();
            refine::floor_eps(&mut d_raw);

            let mut d = refine::smooth3_vegas(&d_raw);
            refine::damp(&mut d, self.alpha);

            let old_row = self.edges.row(&[i]).to_vec();
            let new_row = refine::rebin_equal_mass(&old_row, &d, self.k);
            self.edges.row_mut(&[i]).copy_from_slice(&new_row);
        }

        debug!("vegas adapt: d={} k={} n_total={}", self.d, self.k, self.n_total);
        self.clear_cells();
    }

    /// Clears the per-cell importance accumulators without touching the grid edges.
    pub fn clear_cells(&mut self) {
        for c in &mut self.cells {
            c.reset();
        }
        self.n_total = 0;
    }

    /// Resets to a uniform grid and clears the per-cell accumulators.
    pub fn reset(&mut self) {
        self.reset_edges();
        self.clear_cells();
    }

    /// The flattened `d * K` grid values actually persisted to disk: each axis's `K`
    /// right-hand bin edges (the implicit leading `0.0` of each row is not stored).
    #[must_use]
    pub fn grid_values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.d * self.k);
        for i in 0..self.d {
            out.extend_from_slice(&self.edges.row(&[i])[1..]);
        }
        out
    }

    /// Restores the grid from `values` as produced by [`Self::grid_values`].
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != self.dim() * self.k()`.
    pub fn set_grid_values(&mut self, values: &[f64]) {
        assert_eq!(values.len(), self.d * self.k);
        for i in 0..self.d {
            let row = self.edges.row_mut(&[i]);
            row[0] = 0.0;
            row[1..].copy_from_slice(&values[i * self.k..(i + 1) * self.k]);
        }
    }

    /// 64-bit FNV-1a fingerprint of this grid's layout.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let rows: Vec<Vec<f64>> = (0..self.d).map(|i| self.edges.row(&[i]).to_vec()).collect();
        fingerprint_vegas(self.d, self.k, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_grid_samples_cover_unit_cube() {
        let grid = VegasGrid::new(2, 8, DEFAULT_ALPHA);
        let mut rng = Rng::from_seed(1);
        let mut x = [0.0; 2];
        let mut idx = [0usize; 2];
        for _ in 0..1000 {
            let w = grid.sample(&mut rng, &mut x, &mut idx);
            assert!((0.999..1.001).contains(&w));
            for &xi in &x {
                assert!((0.0..1.0).contains(&xi));
            }
        }
    }

    #[test]
    fn grid_values_round_trip() {
        let mut a = VegasGrid::new(3, 16, DEFAULT_ALPHA);
        let mut rng = Rng::from_seed(7);
        let mut x = [0.0; 3];
        let mut idx = [0usize; 3];
        for _ in 0..2000 {
            let w = a.sample(&mut rng, &mut x, &mut idx);
            let f = (x[0] - x[1]).abs();
            a.accumulate(&idx, f, w);
        }
        a.adapt();

        let values = a.grid_values();
        let mut b = VegasGrid::new(3, 16, DEFAULT_ALPHA);
        b.set_grid_values(&values);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn adapt_skews_bins_toward_peak() {
        let mut grid = VegasGrid::new(1, 32, DEFAULT_ALPHA);
        let mut rng = Rng::from_seed(3);
        let mut x = [0.0; 1];
        let mut idx = [0usize; 1];
        for _ in 0..20_000 {
            let w = grid.sample(&mut rng, &mut x, &mut idx);
            let f = (-200.0 * (x[0] - 0.5).powi(2)).exp();
            grid.accumulate(&idx, f, w);
        }
        grid.adapt();

        let row = grid.grid_values();
        // bins should be denser (smaller gaps) near 0.5 than near the edges after adapting
        let near_edge_width = row[1] - row[0];
        let mid = row.len() / 2;
        let near_mid_width = row[mid] - row[mid - 1];
        assert!(near_mid_width < near_edge_width);
    }

    #[test]
    fn reset_restores_uniform_spacing() {
        let mut grid = VegasGrid::new(1, 4, DEFAULT_ALPHA);
        let mut rng = Rng::from_seed(1);
        let mut x = [0.0; 1];
        let mut idx = [0usize; 1];
        for _ in 0..100 {
            let w = grid.sample(&mut rng, &mut x, &mut idx);
            grid.accumulate(&idx, 1.0, w);
        }
        grid.adapt();
        grid.reset();

        assert_eq!(grid.n_total(), 0);
        let values = grid.grid_values();
        assert_eq!(values, vec![0.25, 0.5, 0.75, 1.0]);
    }
}
