//! BASIN sampler: nested marginal/conditional grids with EMD-driven order selection (C8).

use log::debug;

use crate::cell::Cell;
use crate::fingerprint::fingerprint_basin;
use crate::grid::array::FlatGrid;
use crate::grid::emd::earth_movers_distance;
use crate::grid::refine;
use crate::rng::Rng;

/// Default damping exponent α.
pub const DEFAULT_ALPHA: f64 = 0.75;
/// Default coarse bin count K₁.
pub const DEFAULT_K1: usize = 8;
/// Default fine bin count per coarse bin K₂.
pub const DEFAULT_K2: usize = 16;
/// Default conditional-smoothing weight `w_s` (must be `>= 1`).
pub const DEFAULT_W_S: f64 = 3.0;
/// Default minimum cross-score for a conditioning edge to be eligible for selection.
pub const DEFAULT_S_MIN: f64 = 0.05;
/// Default new-dimension penalty ρ.
pub const DEFAULT_RHO: f64 = 2.0;

/// Finds the bin `j` such that `edges[j] <= x < edges[j+1]` in an edges array of length
/// `n + 1`, clamped to the last bin.
fn locate_bin(edges: &[f64], x: f64) -> usize {
    let n = edges.len() - 1;
    edges[1..].partition_point(|&e| e <= x).min(n - 1)
}

fn merge_superset(strips: &[&[f64]]) -> Vec<f64> {
    let mut pts: Vec<f64> = strips.iter().flat_map(|s| s.iter().copied()).collect();
    pts.sort_by(|a, b| a.partial_cmp(b).expect("NaN edge"));
    pts.dedup_by(|a, b| (*a - *b).abs() < 1.0e-12);
    if pts.len() < 2 {
        pts = vec![0.0, 1.0];
    }
    pts
}

/// Fractional overlap `w[k'][k]` of new coarse bin `k'` against old coarse bin `k`,
/// normalized by the old bin's width so each old bin's mass redistributes completely
/// across the new bins it overlaps.
fn compute_weight_table(old_marginal: &[f64], new_marginal: &[f64], k1: usize, k2: usize) -> Vec<Vec<f64>> {
    let bounds = |edges: &[f64]| -> Vec<(f64, f64)> { (0..k1).map(|k| (edges[k * k2], edges[(k + 1) * k2])).collect() };
    let old_bounds = bounds(old_marginal);
    let new_bounds = bounds(new_marginal);

    let mut w = vec![vec![0.0; k1]; k1];
    for (k_prime, &(n_lo, n_hi)) in new_bounds.iter().enumerate() {
        for (k, &(o_lo, o_hi)) in old_bounds.iter().enumerate() {
            let overlap = (n_hi.min(o_hi) - n_lo.max(o_lo)).max(0.0);
            let width = o_hi - o_lo;
            w[k_prime][k] = if width > 0.0 { overlap / width } else { 0.0 };
        }
    }
    w
}

/// Nested grid of shape `[d, d, K1, K2]` (`K0 = K1*K2`) plus an order table describing,
/// for each of the `d` sampling steps, whether that step draws a fresh marginal
/// coordinate or a coordinate conditioned on one already drawn.
#[derive(Clone, Debug)]
pub struct BasinGrid {
    d: usize,
    k1: usize,
    k2: usize,
    k0: usize,
    alpha: f64,
    w_s: f64,
    s_min: f64,
    rho: f64,
    /// `[d, K0 + 1]`: axis `a`'s marginal edges, flat across all `K0` fine cells.
    marginal: FlatGrid,
    /// `[d, d, K1, K2 + 1]`: conditional strip `g[a,b,k,*]`, local to `[0,1]` per `k`.
    /// Diagonal (`a == b`) entries are unused.
    conditional: FlatGrid,
    marginal_cells: Vec<Cell>,
    conditional_cells: Vec<Cell>,
    order: Vec<[usize; 2]>,
    n_total: u64,
}

impl BasinGrid {
    /// Constructs a freshly initialized grid: diagonal order `(i, i)`, uniform marginal
    /// and conditional strips.
    ///
    /// # Panics
    ///
    /// Panics if `w_s < 1.0`.
    #[must_use]
    pub fn new(d: usize, k1: usize, k2: usize, alpha: f64, w_s: f64, s_min: f64, rho: f64) -> Self {
        assert!(w_s >= 1.0, "w_s must be >= 1");
        let k0 = k1 * k2;
        let mut grid = Self {
            d,
            k1,
            k2,
            k0,
            alpha,
            w_s,
            s_min,
            rho,
            marginal: FlatGrid::new(&[d, k0 + 1], 0.0),
            conditional: FlatGrid::new(&[d, d, k1, k2 + 1], 0.0),
            marginal_cells: vec![Cell::new(); d * k0],
            conditional_cells: vec![Cell::new(); d * d * k1 * k2],
            order: (0..d).map(|i| [i, i]).collect(),
            n_total: 0,
        };
        grid.reset_edges();
        grid
    }

    fn reset_edges(&mut self) {
        for a in 0..self.d {
            let row = self.marginal.row_mut(&[a]);
            for (j, slot) in row.iter_mut().enumerate() {
                *slot = j as f64 / self.k0 as f64;
            }
        }
        for a in 0..self.d {
            for b in 0..self.d {
                if a == b {
                    continue;
                }
                for k in 0..self.k1 {
                    let strip = self.conditional.row_mut(&[a, b, k]);
                    for (c, slot) in strip.iter_mut().enumerate() {
                        *slot = c as f64 / self.k2 as f64;
                    }
                }
            }
        }
        self.order = (0..self.d).map(|i| [i, i]).collect();
    }

    /// Dimension.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.d
    }

    /// Coarse bin count K1.
    #[must_use]
    pub const fn k1(&self) -> usize {
        self.k1
    }

    /// Fine bin count K2.
    #[must_use]
    pub const fn k2(&self) -> usize {
        self.k2
    }

    /// Damping exponent α.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Conditional-smoothing weight `w_s`.
    #[must_use]
    pub const fn w_s(&self) -> f64 {
        self.w_s
    }

    /// Minimum cross-score for a conditioning edge to be eligible for selection.
    #[must_use]
    pub const fn s_min(&self) -> f64 {
        self.s_min
    }

    /// New-dimension penalty ρ.
    #[must_use]
    pub const fn rho(&self) -> f64 {
        self.rho
    }

    /// The current sampling order: `order()[r]` is `[a, b]` for step `r`.
    #[must_use]
    pub fn order(&self) -> &[[usize; 2]] {
        &self.order
    }

    /// Total number of samples accumulated into the per-cell importance tables since the
    /// last `adapt()`/`reset()`.
    #[must_use]
    pub const fn n_total(&self) -> u64 {
        self.n_total
    }

    /// Overwrites the running sample count, used when restoring accumulated data.
    pub fn set_n_total(&mut self, n: u64) {
        self.n_total = n;
    }

    /// The flat `d * K0` marginal per-cell importance table, for data save/load.
    #[must_use]
    pub fn marginal_cells(&self) -> &[Cell] {
        &self.marginal_cells
    }

    /// Mutable access to the flat `d * K0` marginal per-cell importance table.
    pub fn marginal_cells_mut(&mut self) -> &mut [Cell] {
        &mut self.marginal_cells
    }

    /// The flat `d * d * K1 * K2` conditional per-cell importance table (diagonal slots
    /// unused), for data save/load.
    #[must_use]
    pub fn conditional_cells(&self) -> &[Cell] {
        &self.conditional_cells
    }

    /// Mutable access to the flat `d * d * K1 * K2` conditional per-cell importance table.
    pub fn conditional_cells_mut(&mut self) -> &mut [Cell] {
        &mut self.conditional_cells
    }

    fn marginal_cell_index(&self, a: usize, j: usize) -> usize {
        a * self.k0 + j
    }

    fn conditional_cell_index(&self, a: usize, b: usize, k: usize, c: usize) -> usize {
        ((a * self.d + b) * self.k1 + k) * self.k2 + c
    }

    /// Draws one full `d`-dimensional point by walking the sampling order. Writes the
    /// mapped coordinate into `x` and each dimension's marginal fine-cell index into
    /// `j0` (needed by [`Self::accumulate`]). Returns the overall sampling weight.
    ///
    /// # Panics
    ///
    /// Panics if `x.len() != self.dim()` or `j0.len() != self.dim()`, or if the order
    /// conditions on a dimension not yet placed.
    pub fn sample(&self, rng: &mut Rng, x: &mut [f64], j0: &mut [usize]) -> f64 {
        assert_eq!(x.len(), self.d);
        assert_eq!(j0.len(), self.d);

        let mut weight = 1.0;
        let mut placed = vec![false; self.d];

        for &[a, b] in &self.order {
            let u = rng.next_f64();
            if a == b {
                let k0 = self.k0 as f64;
                let row = self.marginal.row(&[a]);
                let j = ((u * k0) as usize).min(self.k0 - 1);
                let frac = u * k0 - j as f64;
                let (g_low, g_upp) = (row[j], row[j + 1]);
                x[a] = g_low + frac * (g_upp - g_low);
                weight *= k0 * (g_upp - g_low);
                j0[a] = j;
            } else {
                assert!(placed[a], "order conditions on dimension {a} before it is sampled");
                // the coarse bin index is a flat division of the fine marginal index
                // because the marginal and conditional grids share the same K1*K2 split
                let k = j0[a] / self.k2;

                let k2 = self.k2 as f64;
                let strip = self.conditional.row(&[a, b, k]);
                let j2 = ((u * k2) as usize).min(self.k2 - 1);
                let frac = u * k2 - j2 as f64;
                let (g_low, g_upp) = (strip[j2], strip[j2 + 1]);
                x[b] = g_low + frac * (g_upp - g_low);
                weight *= k2 * (g_upp - g_low);

                let mrow = self.marginal.row(&[b]);
                j0[b] = locate_bin(mrow, x[b]);
            }
            placed[b] = true;
        }
        weight
    }

    /// Accumulates one evaluated sample's contribution into both the marginal and
    /// conditional per-cell importance tables.
    ///
    /// # Panics
    ///
    /// Panics if `x.len() != self.dim()` or `j0.len() != self.dim()`.
    pub fn accumulate(&mut self, j0: &[usize], x: &[f64], f: f64, weight: f64) {
        assert_eq!(x.len(), self.d);
        assert_eq!(j0.len(), self.d);

        let acc = f * f * weight * weight;
        self.n_total += 1;
        for i in 0..self.d {
            let mi = self.marginal_cell_index(i, j0[i]);
            self.marginal_cells[mi] += acc;

            let k = j0[i] / self.k2;
            for j in 0..self.d {
                if j == i {
                    continue;
                }
                let strip = self.conditional.row(&[i, j, k]);
                let c = locate_bin(strip, x[j]);
                let ci = self.conditional_cell_index(i, j, k, c);
                self.conditional_cells[ci] += acc;
            }
        }
    }

    fn refine_marginal(&mut self) -> Vec<Vec<Vec<f64>>> {
        let n_sq = (self.n_total as f64) * (self.n_total as f64);
        let mut weight_tables = Vec::with_capacity(self.d);

        for a in 0..self.d {
            debug_assert_eq!(
                (0..self.k0).map(|j| self.marginal_cells[self.marginal_cell_index(a, j)].count()).sum::<u64>(),
                self.n_total,
                "axis {a}: marginal cell sample counts must sum to n_total before refining"
            );

            let old_row = self.marginal.row(&[a]).to_vec();
            let mut d_raw: Vec<f64> =
                (0..self.k0).map(|j| self.marginal_cells[self.marginal_cell_index(a, j)].sum() / n_sq).collect();
            refine::floor_eps(&mut d_raw);
            let mut d = refine::smooth3_vegas(&d_raw);
            refine::damp(&mut d, self.alpha);

            let new_row = refine::rebin_equal_mass(&old_row, &d, self.k0);
            weight_tables.push(compute_weight_table(&old_row, &new_row, self.k1, self.k2));
            self.marginal.row_mut(&[a]).copy_from_slice(&new_row);
        }
        weight_tables
    }

    fn refine_conditional(&mut self, weight_tables: &[Vec<Vec<f64>>]) {
        let n_sq = (self.n_total as f64) * (self.n_total as f64);

        for a in 0..self.d {
            for b in 0..self.d {
                if a == b {
                    continue;
                }

                let old_strips: Vec<Vec<f64>> = (0..self.k1).map(|k| self.conditional.row(&[a, b, k]).to_vec()).collect();
                let d12: Vec<Vec<f64>> = (0..self.k1)
                    .map(|k| {
                        let raw: Vec<f64> = (0..self.k2)
                            .map(|c| self.conditional_cells[self.conditional_cell_index(a, b, k, c)].sum() / n_sq)
                            .collect();
                        let mut smoothed = refine::smooth3_weighted(&raw, self.w_s);
                        refine::floor_eps(&mut smoothed);
                        refine::damp(&mut smoothed, self.alpha);
                        smoothed
                    })
                    .collect();

                let mut new_strips = Vec::with_capacity(self.k1);
                for k_prime in 0..self.k1 {
                    let w_row = &weight_tables[a][k_prime];
                    let contributing: Vec<usize> = (0..self.k1).filter(|&k| w_row[k] > 0.0).collect();
                    let strip_refs: Vec<&[f64]> = contributing.iter().map(|&k| old_strips[k].as_slice()).collect();
                    let super_grid = merge_superset(&strip_refs);

                    let mut d_merged = vec![0.0; super_grid.len() - 1];
                    for &k in &contributing {
                        let w = w_row[k];
                        let strip = &old_strips[k];
                        for c in 0..self.k2 {
                            let (cell_lo, cell_hi) = (strip[c], strip[c + 1]);
                            let len_cell = cell_hi - cell_lo;
                            if len_cell <= 0.0 {
                                continue;
                            }
                            let d_val = d12[k][c];
                            for (m, seg) in d_merged.iter_mut().enumerate() {
                                let (seg_lo, seg_hi) = (super_grid[m], super_grid[m + 1]);
                                let overlap = (cell_hi.min(seg_hi) - cell_lo.max(seg_lo)).max(0.0);
                                if overlap > 0.0 {
                                    *seg += (overlap / len_cell) * w * d_val;
                                }
                            }
                        }
                    }

                    new_strips.push(refine::rebin_equal_mass(&super_grid, &d_merged, self.k2));
                }

                for (k_prime, strip) in new_strips.into_iter().enumerate() {
                    self.conditional.row_mut(&[a, b, k_prime]).copy_from_slice(&strip);
                }
            }
        }
    }

    fn cross_scores(&self) -> Vec<Vec<f64>> {
        let mut s = vec![vec![0.0; self.d]; self.d];
        for i in 0..self.d {
            for j in 0..self.d {
                if i == j {
                    s[i][j] = 1.0;
                    continue;
                }
                let marginal_j = self.marginal.row(&[j]);
                let total: f64 =
                    (0..self.k1).map(|k| earth_movers_distance(marginal_j, self.conditional.row(&[i, j, k]))).sum();
                s[i][j] = total / self.k1 as f64;
            }
        }
        s
    }

    fn select_order(&self, s: &mut [Vec<f64>]) -> Vec<[usize; 2]> {
        let d = self.d;
        let mut order = Vec::with_capacity(d);

        while order.len() < d {
            let mut best_new: Option<(usize, f64)> = None;
            for i in 0..d {
                if s[i][i] < 0.0 {
                    continue;
                }
                let mut sum = 0.0;
                let mut count = 0usize;
                for j in 0..d {
                    if j == i || s[i][j] <= 0.0 {
                        continue;
                    }
                    sum += s[i][j];
                    count += 1;
                }
                if count == 0 {
                    continue;
                }
                let avg = sum / (self.rho * count as f64);
                if best_new.map_or(true, |(_, best)| avg > best) {
                    best_new = Some((i, avg));
                }
            }

            let mut best_chain: Option<([usize; 2], f64)> = None;
            for &[_, ell] in &order {
                for j in 0..d {
                    if j == ell || s[j][j] < 0.0 || s[ell][j] < self.s_min {
                        continue;
                    }
                    let score = s[ell][j];
                    if best_chain.map_or(true, |(_, best)| score > best) {
                        best_chain = Some(([ell, j], score));
                    }
                }
            }

            let (row, chosen) = match (best_new, best_chain) {
                (Some((_, avg)), Some((pair, score))) if score > avg => (pair, pair[1]),
                (Some((i, _)), _) => ([i, i], i),
                (None, Some((pair, _))) => (pair, pair[1]),
                (None, None) => unreachable!("order selection exhausted before placing all dimensions"),
            };

            order.push(row);
            for col in s.iter_mut() {
                col[chosen] = -1.0;
            }
            s[chosen][chosen] = -1.0;
        }
        order
    }

    /// Refines the marginal grid of every axis, then the conditional strips for every
    /// ordered pair, then re-derives the sampling order from the updated EMD cross
    /// scores. Clears the per-cell accumulators afterward.
    ///
    /// # Panics
    ///
    /// Panics (via debug assertion) if the resulting order does not use every dimension
    /// exactly once as a second column.
    pub fn adapt(&mut self) {
        if self.n_total == 0 {
            return;
        }

        let weight_tables = self.refine_marginal();
        self.refine_conditional(&weight_tables);

        let mut s = self.cross_scores();
        let new_order = self.select_order(&mut s);

        let mut seen = vec![false; self.d];
        for &[_, b] in &new_order {
            debug_assert!(!seen[b], "dimension {b} used as second column more than once");
            seen[b] = true;
        }
        debug_assert!(seen.iter().all(|&v| v), "not every dimension was placed as a second column");

        self.order = new_order;
        debug!("basin adapt: d={} k1={} k2={} n_total={}", self.d, self.k1, self.k2, self.n_total);
        self.clear_cells();
    }

    /// Clears the per-cell importance accumulators without touching the grid or order.
    pub fn clear_cells(&mut self) {
        for c in &mut self.marginal_cells {
            c.reset();
        }
        for c in &mut self.conditional_cells {
            c.reset();
        }
        self.n_total = 0;
    }

    /// Resets to uniform marginal/conditional grids, the fully-marginal order, and
    /// clears the per-cell accumulators.
    pub fn reset(&mut self) {
        self.reset_edges();
        self.clear_cells();
    }

    /// Flattened `d*d*K1*K2` grid values as persisted to disk: for each axis `a`, the
    /// `K0` marginal values; then for each ordered pair `(a,b)`, `a != b`, the `K1*K2`
    /// conditional values.
    #[must_use]
    pub fn grid_values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.d * self.d * self.k1 * self.k2);
        for a in 0..self.d {
            out.extend_from_slice(&self.marginal.row(&[a])[1..]);
        }
        for a in 0..self.d {
            for b in 0..self.d {
                if a == b {
                    continue;
                }
                for k in 0..self.k1 {
                    out.extend_from_slice(&self.conditional.row(&[a, b, k])[1..]);
                }
            }
        }
        out
    }

    /// Restores the grid from `values` as produced by [`Self::grid_values`].
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != self.dim()^2 * k1() * k2()`.
    pub fn set_grid_values(&mut self, values: &[f64]) {
        assert_eq!(values.len(), self.d * self.d * self.k1 * self.k2);
        let mut cursor = 0usize;
        for a in 0..self.d {
            let row = self.marginal.row_mut(&[a]);
            row[0] = 0.0;
            row[1..].copy_from_slice(&values[cursor..cursor + self.k0]);
            cursor += self.k0;
        }
        for a in 0..self.d {
            for b in 0..self.d {
                if a == b {
                    continue;
                }
                for k in 0..self.k1 {
                    let strip = self.conditional.row_mut(&[a, b, k]);
                    strip[0] = 0.0;
                    strip[1..].copy_from_slice(&values[cursor..cursor + self.k2]);
                    cursor += self.k2;
                }
            }
        }
    }

    /// Flattened `order` as `d*2` `usize`s, `[order[0][0], order[0][1], order[1][0], ...]`.
    #[must_use]
    pub fn order_values(&self) -> Vec<usize> {
        self.order.iter().flat_map(|row| row.iter().copied()).collect()
    }

    /// Restores `order` from `values` as produced by [`Self::order_values`].
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != 2 * self.dim()`.
    pub fn set_order_values(&mut self, values: &[usize]) {
        assert_eq!(values.len(), 2 * self.d);
        self.order = values.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
    }

    /// 64-bit FNV-1a fingerprint of this grid's layout: dimension, bin counts, and every
    /// edge of every marginal and conditional strip. Does not depend on the sampling
    /// order (see [`fingerprint_basin`]'s doc comment).
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let marginal_flat: Vec<f64> = (0..self.d).flat_map(|a| self.marginal.row(&[a]).to_vec()).collect();
        let conditional_rows: Vec<Vec<Vec<f64>>> = (0..self.d)
            .map(|a| {
                (0..self.d)
                    .map(|b| {
                        if a == b {
                            vec![]
                        } else {
                            (0..self.k1).flat_map(|c| self.conditional.row(&[a, b, c]).to_vec()).collect()
                        }
                    })
                    .collect()
            })
            .collect();
        fingerprint_basin(self.d, self.k1, self.k2, &marginal_flat, &conditional_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_default(d: usize) -> BasinGrid {
        BasinGrid::new(d, DEFAULT_K1, DEFAULT_K2, DEFAULT_ALPHA, DEFAULT_W_S, DEFAULT_S_MIN, DEFAULT_RHO)
    }

    #[test]
    fn initial_order_is_fully_marginal() {
        let grid = new_default(3);
        assert_eq!(grid.order(), &[[0, 0], [1, 1], [2, 2]]);
    }

    #[test]
    fn samples_stay_in_unit_cube() {
        let grid = new_default(3);
        let mut rng = Rng::from_seed(11);
        let mut x = [0.0; 3];
        let mut j0 = [0usize; 3];
        for _ in 0..1000 {
            let w = grid.sample(&mut rng, &mut x, &mut j0);
            assert!(w > 0.0);
            for &xi in &x {
                assert!((0.0..1.0).contains(&xi));
            }
        }
    }

    #[test]
    fn grid_values_round_trip() {
        let mut a = new_default(2);
        let mut rng = Rng::from_seed(5);
        let mut x = [0.0; 2];
        let mut j0 = [0usize; 2];
        for _ in 0..500 {
            let w = a.sample(&mut rng, &mut x, &mut j0);
            let f = (-50.0 * (x[0] - x[1]).powi(2)).exp();
            a.accumulate(&j0, &x, f, w);
        }
        a.adapt();

        let values = a.grid_values();
        let order = a.order_values();
        let mut b = new_default(2);
        b.set_grid_values(&values);
        b.set_order_values(&order);

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn adapt_produces_a_valid_permutation_order() {
        let mut grid = new_default(4);
        let mut rng = Rng::from_seed(2);
        let mut x = [0.0; 4];
        let mut j0 = [0usize; 4];
        for _ in 0..5000 {
            let w = grid.sample(&mut rng, &mut x, &mut j0);
            let f = (-30.0 * (x[0] - x[1]).powi(2) - 10.0 * (x[2] - x[3]).powi(2)).exp();
            grid.accumulate(&j0, &x, f, w);
        }
        grid.adapt();

        let mut seen = vec![false; 4];
        for &[_, b] in grid.order() {
            assert!(!seen[b]);
            seen[b] = true;
        }
        assert!(seen.iter().all(|&v| v));
    }

    #[test]
    fn reset_restores_fully_marginal_order() {
        let mut grid = new_default(2);
        let mut rng = Rng::from_seed(1);
        let mut x = [0.0; 2];
        let mut j0 = [0usize; 2];
        for _ in 0..200 {
            let w = grid.sample(&mut rng, &mut x, &mut j0);
            grid.accumulate(&j0, &x, 1.0, w);
        }
        grid.adapt();
        grid.reset();

        assert_eq!(grid.order(), &[[0, 0], [1, 1]]);
        assert_eq!(grid.n_total, 0);
    }
}
