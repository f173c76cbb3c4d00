//! The sampler spine: the `Sampler` capability interface, the `VegasSampler`/`BasinSampler`
//! concrete types dispatched through it, and the `integrate` driving loop.
//!
//! Mirrors the split this corpus already uses for `SubgridEnum`/`Subgrid`
//! (`pineappl::subgrid`): one `#[enum_dispatch]` trait describing every capability a
//! sampler might offer, one tagged-sum enum over the concrete implementations, and an
//! `Unsupported` error for a capability a given variant doesn't provide.

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use enum_dispatch::enum_dispatch;
use log::{debug, info};

use crate::cell::Cell;
use crate::codec::{self, AlgId, FileKind};
use crate::combiner::Combiner;
use crate::error::{Error, Result};
use crate::grid::basin::{self, BasinGrid};
use crate::grid::vegas::{self, VegasGrid};
use crate::iteration::Iteration;
use crate::point::Point;
use crate::rng::Rng;

bitflags! {
    /// Capabilities a concrete sampler may or may not offer. Both [`VegasSampler`] and
    /// [`BasinSampler`] currently offer all three; the flags exist so a future sampler
    /// variant can opt out of one without widening [`Error::Unsupported`]'s call sites.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// Supports `adapt()`.
        const ADAPT = 0b0000_0001;
        /// Supports `save_state`/`load_state`.
        const SAVE_STATE = 0b0000_0010;
        /// Supports `save_data`/`append_data`/`load_data`.
        const SAVE_DATA = 0b0000_0100;
    }
}

/// Per-call / sticky integration options. Every field is optional; `merge` lets a
/// per-call override replace only the fields it sets, leaving the rest at whatever the
/// sampler was last configured with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Options {
    /// Evaluations per iteration.
    pub neval: Option<u64>,
    /// Number of iterations to run.
    pub niter: Option<u64>,
    /// Whether to call `adapt()` after each iteration.
    pub adapt: Option<bool>,
    /// VEGAS-only: whether to also record per-cell data during non-adapting iterations.
    pub collect_adapt_data: Option<bool>,
    /// If set, reseeds the RNG before the run.
    pub seed: Option<u64>,
    /// Reserved for a future early-stop criterion; not consulted by `integrate` today.
    pub rel_tol: Option<f64>,
    /// Reserved for a future early-stop criterion; not consulted by `integrate` today.
    pub abs_tol: Option<f64>,
    /// `0` = silent, `1` = per-iteration summary, `>= 2` = full grid diagnostics.
    pub verbosity: Option<u8>,
    /// Overrides the `.khs` state snapshot's path stem (extension is always rewritten).
    pub file_path: Option<PathBuf>,
}

impl Options {
    /// Constructs an all-`None` options value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new `Options` where every `Some` field of `overrides` replaces the
    /// corresponding field of `self`, and every `None` field of `overrides` falls back to
    /// `self`'s value.
    #[must_use]
    pub fn merge(&self, overrides: &Self) -> Self {
        Self {
            neval: overrides.neval.or(self.neval),
            niter: overrides.niter.or(self.niter),
            adapt: overrides.adapt.or(self.adapt),
            collect_adapt_data: overrides.collect_adapt_data.or(self.collect_adapt_data),
            seed: overrides.seed.or(self.seed),
            rel_tol: overrides.rel_tol.or(self.rel_tol),
            abs_tol: overrides.abs_tol.or(self.abs_tol),
            verbosity: overrides.verbosity.or(self.verbosity),
            file_path: overrides.file_path.clone().or_else(|| self.file_path.clone()),
        }
    }
}

/// The capability interface every sampler variant implements. Dispatched onto
/// [`SamplerEnum`] via `enum_dispatch` rather than as a `dyn Sampler` trait object, so
/// every call site keeps static dispatch and the concrete type stays in a single `match`.
#[enum_dispatch]
pub trait Sampler {
    /// Number of dimensions this sampler integrates over.
    fn dim(&self) -> usize;

    /// Which of `ADAPT`/`SAVE_STATE`/`SAVE_DATA` this sampler variant supports.
    fn capabilities(&self) -> Capabilities;

    /// 64-bit fingerprint of the current grid layout (dimension, bin counts, and every
    /// edge). Independent of BASIN's sampling order: two grids with identical edges merge
    /// regardless of which order selection produced them.
    fn fingerprint(&self) -> u64;

    /// A filesystem-stem identifying this sampler, e.g. `"vegas_4d"`. When `with_hash` is
    /// `true`, the grid's current fingerprint is appended as 16 hex digits.
    fn prefix(&self, with_hash: bool) -> String;

    /// The sticky options this sampler was last configured with.
    fn options(&self) -> &Options;

    /// Overwrites the sticky options wholesale (callers that want a shallow merge should
    /// merge against [`Self::options`] themselves, as [`integrate`] does).
    fn set_options(&mut self, opts: Options);

    /// The RNG's current integer seed.
    fn seed(&self) -> u64;

    /// `Some(s)` reseeds immediately with `s`; `None` bumps the current seed by one and
    /// reseeds with that.
    fn set_seed(&mut self, seed: Option<u64>);

    /// The accumulated result combiner.
    fn result(&self) -> &Combiner;

    /// Mutable access to the accumulated result combiner.
    fn result_mut(&mut self) -> &mut Combiner;

    /// Resets the grid to its fully uniform construction-time state and clears all
    /// accumulated results.
    fn reset(&mut self);

    /// Clears accumulated results and per-cell importance data without touching the
    /// current grid shape (or, for BASIN, the current sampling order).
    fn clear_data(&mut self);

    /// Refines the grid from whatever per-cell importance data has been accumulated
    /// since the last `adapt()`/`reset()`, then clears that data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] if this variant doesn't support adaptation.
    fn adapt(&mut self) -> Result<()>;

    /// Draws `neval` points, evaluates `f` at each, and returns the resulting iteration
    /// accumulator. Also feeds the per-cell importance data used by a later `adapt()`.
    fn run_iter<T>(&mut self, f: &mut dyn FnMut(&Point<'_, T>) -> f64, neval: u64, user_data: Option<&T>) -> Iteration;

    /// Writes this sampler's grid (and order, for BASIN) to `w` as a `.khs` stream.
    ///
    /// # Errors
    ///
    /// Propagates any I/O failure from `w`.
    fn write_state(&self, w: &mut dyn Write) -> Result<()>;

    /// Replaces this sampler's grid (and order, for BASIN) from a `.khs` stream
    /// previously written by [`Self::write_state`]. The dimension and bin counts are
    /// re-derived from the file, not from `self`'s current construction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeaderMismatch`] if the header doesn't match this algorithm and
    /// file kind, or propagates an I/O failure.
    fn read_state(&mut self, r: &mut dyn Read) -> Result<()>;

    /// Writes the accumulated result combiner and per-cell importance data to `w` as a
    /// `.khd` stream, guarded by this grid's current fingerprint.
    ///
    /// # Errors
    ///
    /// Propagates any I/O failure from `w`.
    fn write_data(&self, w: &mut dyn Write) -> Result<()>;

    /// Reads a `.khd` stream previously written by [`Self::write_data`]. When `merge` is
    /// `false`, the fingerprint is only checked for informational header validation and
    /// `self` must currently hold no accumulated data; when `true`, the file's
    /// fingerprint must match `self`'s current fingerprint exactly, and the file's result
    /// and per-cell data are additively merged into `self`'s.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeaderMismatch`] on a grid-shape mismatch,
    /// [`Error::IncompatibleFingerprint`] on a fingerprint mismatch while merging,
    /// [`Error::NonEmptyData`] when loading fresh into a non-empty sampler, or propagates
    /// an I/O failure.
    fn read_data(&mut self, r: &mut dyn Read, merge: bool) -> Result<()>;

    /// Writes the RNG's current state to `w` as a `.khr` stream.
    ///
    /// # Errors
    ///
    /// Propagates any I/O failure from `w`.
    fn write_rng(&self, w: &mut dyn Write) -> Result<()>;

    /// Replaces the RNG's state from a `.khr` stream previously written by
    /// [`Self::write_rng`]. `seed_hint` becomes the restored generator's reported
    /// [`Self::seed`], since the integer seed is not recoverable from the state words
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeaderMismatch`] if the generator tag doesn't match, or
    /// propagates an I/O or parse failure.
    fn read_rng(&mut self, r: &mut dyn BufRead, seed_hint: u64) -> Result<()>;
}

/// An independent, per-axis adaptive importance sampler (VEGAS).
#[derive(Clone, Debug)]
pub struct VegasSampler {
    grid: VegasGrid,
    rng: Rng,
    result: Combiner,
    opts: Options,
}

impl VegasSampler {
    /// Constructs a sampler over `d` dimensions with `k` bins per axis and the default
    /// damping exponent.
    #[must_use]
    pub fn new(d: usize, k: usize) -> Self {
        Self::with_grid(VegasGrid::new(d, k, vegas::DEFAULT_ALPHA))
    }

    /// Constructs a sampler wrapping an already-configured grid.
    #[must_use]
    pub fn with_grid(grid: VegasGrid) -> Self {
        Self { grid, rng: Rng::new(), result: Combiner::new(), opts: Options::new() }
    }

    /// The underlying grid.
    #[must_use]
    pub const fn grid(&self) -> &VegasGrid {
        &self.grid
    }
}

impl Sampler for VegasSampler {
    fn dim(&self) -> usize {
        self.grid.dim()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ADAPT | Capabilities::SAVE_STATE | Capabilities::SAVE_DATA
    }

    fn fingerprint(&self) -> u64 {
        self.grid.fingerprint()
    }

    fn prefix(&self, with_hash: bool) -> String {
        if with_hash {
            format!("vegas_{}d_{:016x}", self.grid.dim(), self.fingerprint())
        } else {
            format!("vegas_{}d", self.grid.dim())
        }
    }

    fn options(&self) -> &Options {
        &self.opts
    }

    fn set_options(&mut self, opts: Options) {
        self.opts = opts;
    }

    fn seed(&self) -> u64 {
        self.rng.seed()
    }

    fn set_seed(&mut self, seed: Option<u64>) {
        match seed {
            Some(s) => self.rng.set_seed(s),
            None => self.rng.bump_seed(),
        }
        self.opts.seed = Some(self.rng.seed());
    }

    fn result(&self) -> &Combiner {
        &self.result
    }

    fn result_mut(&mut self) -> &mut Combiner {
        &mut self.result
    }

    fn reset(&mut self) {
        self.grid.reset();
        self.result.reset();
    }

    fn clear_data(&mut self) {
        self.grid.clear_cells();
        self.result.reset();
    }

    fn adapt(&mut self) -> Result<()> {
        self.grid.adapt();
        Ok(())
    }

    fn run_iter<T>(&mut self, f: &mut dyn FnMut(&Point<'_, T>) -> f64, neval: u64, user_data: Option<&T>) -> Iteration {
        let d = self.grid.dim();
        let mut x = vec![0.0; d];
        let mut idx = vec![0usize; d];
        let mut iter = Iteration::new();

        for i in 0..neval {
            let w = self.grid.sample(&mut self.rng, &mut x, &mut idx);
            let fx = f(&Point::new(&x, w, i, user_data));
            iter.accumulate(fx * w);
            self.grid.accumulate(&idx, fx, w);
        }
        iter
    }

    fn write_state(&self, w: &mut dyn Write) -> Result<()> {
        codec::write_header(&mut *w, AlgId::Vegas, FileKind::State)?;
        codec::write_size(&mut *w, self.grid.dim())?;
        codec::write_size(&mut *w, self.grid.k())?;
        codec::write_count(&mut *w, self.grid.n_total())?;
        codec::write_f64_array(&mut *w, &self.grid.grid_values())?;
        Ok(())
    }

    fn read_state(&mut self, r: &mut dyn Read) -> Result<()> {
        let (alg_id, kind) = codec::read_header(&mut *r)?;
        if alg_id != AlgId::Vegas || kind != FileKind::State {
            return Err(Error::HeaderMismatch { detail: "expected a VEGAS state file".to_string() });
        }

        let d = codec::read_size(&mut *r)?;
        let k = codec::read_size(&mut *r)?;
        let n_total = codec::read_count(&mut *r)?;
        let values = codec::read_f64_array(&mut *r, d * k)?;

        self.grid = VegasGrid::new(d, k, self.grid.alpha());
        self.grid.set_grid_values(&values);
        self.grid.set_n_total(n_total);
        Ok(())
    }

    fn write_data(&self, w: &mut dyn Write) -> Result<()> {
        codec::write_header(&mut *w, AlgId::Vegas, FileKind::Data)?;
        codec::write_size(&mut *w, self.grid.dim())?;
        codec::write_size(&mut *w, self.grid.k())?;
        codec::write_count(&mut *w, self.grid.fingerprint())?;

        codec::write_size(&mut *w, self.result.iterations().len())?;
        for it in self.result.iterations() {
            codec::write_f64(&mut *w, it.sum_f())?;
            codec::write_f64(&mut *w, it.sum_f2())?;
            codec::write_count(&mut *w, it.count())?;
        }

        codec::write_count(&mut *w, self.grid.n_total())?;
        for cell in self.grid.cells() {
            codec::write_f64(&mut *w, cell.sum())?;
            codec::write_count(&mut *w, cell.count())?;
        }
        Ok(())
    }

    fn read_data(&mut self, r: &mut dyn Read, merge: bool) -> Result<()> {
        let (alg_id, kind) = codec::read_header(&mut *r)?;
        if alg_id != AlgId::Vegas || kind != FileKind::Data {
            return Err(Error::HeaderMismatch { detail: "expected a VEGAS data file".to_string() });
        }

        let d = codec::read_size(&mut *r)?;
        let k = codec::read_size(&mut *r)?;
        if d != self.grid.dim() || k != self.grid.k() {
            return Err(Error::HeaderMismatch {
                detail: format!(
                    "grid shape mismatch: file has d={d} k={k}, sampler has d={} k={}",
                    self.grid.dim(),
                    self.grid.k()
                ),
            });
        }

        let found = codec::read_count(&mut *r)?;
        if merge {
            let expected = self.grid.fingerprint();
            if found != expected {
                return Err(Error::IncompatibleFingerprint { expected, found });
            }
        } else if !self.result.is_empty() || self.grid.n_total() > 0 {
            return Err(Error::NonEmptyData);
        }

        let n_iters = codec::read_size(&mut *r)?;
        let mut incoming = Combiner::new();
        for _ in 0..n_iters {
            let sum_f = codec::read_f64(&mut *r)?;
            let sum_f2 = codec::read_f64(&mut *r)?;
            let count = codec::read_count(&mut *r)?;
            incoming.push(Iteration::from_parts(sum_f, sum_f2, count));
        }

        let total_cell_count = codec::read_count(&mut *r)?;
        let mut incoming_cells = Vec::with_capacity(self.grid.cells().len());
        for _ in 0..self.grid.cells().len() {
            let sum = codec::read_f64(&mut *r)?;
            let count = codec::read_count(&mut *r)?;
            incoming_cells.push(Cell::from_parts(sum, count));
        }

        if merge {
            self.result.push_result(&incoming);
            for (c, inc) in self.grid.cells_mut().iter_mut().zip(incoming_cells) {
                *c += &inc;
            }
            self.grid.set_n_total(self.grid.n_total() + total_cell_count);
        } else {
            self.result = incoming;
            self.grid.cells_mut().copy_from_slice(&incoming_cells);
            self.grid.set_n_total(total_cell_count);
        }
        Ok(())
    }

    fn write_rng(&self, w: &mut dyn Write) -> Result<()> {
        self.rng.save(w)
    }

    fn read_rng(&mut self, r: &mut dyn BufRead, seed_hint: u64) -> Result<()> {
        self.rng.load(r, seed_hint)
    }
}

/// A nested marginal/conditional adaptive importance sampler (BASIN).
#[derive(Clone, Debug)]
pub struct BasinSampler {
    grid: BasinGrid,
    rng: Rng,
    result: Combiner,
    opts: Options,
}

impl BasinSampler {
    /// Constructs a sampler over `d` dimensions with `k1` coarse and `k2` fine bins per
    /// axis and the default damping/smoothing/selection parameters.
    #[must_use]
    pub fn new(d: usize, k1: usize, k2: usize) -> Self {
        Self::with_grid(BasinGrid::new(
            d,
            k1,
            k2,
            basin::DEFAULT_ALPHA,
            basin::DEFAULT_W_S,
            basin::DEFAULT_S_MIN,
            basin::DEFAULT_RHO,
        ))
    }

    /// Constructs a sampler wrapping an already-configured grid.
    #[must_use]
    pub fn with_grid(grid: BasinGrid) -> Self {
        Self { grid, rng: Rng::new(), result: Combiner::new(), opts: Options::new() }
    }

    /// The underlying grid.
    #[must_use]
    pub const fn grid(&self) -> &BasinGrid {
        &self.grid
    }
}

impl Sampler for BasinSampler {
    fn dim(&self) -> usize {
        self.grid.dim()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ADAPT | Capabilities::SAVE_STATE | Capabilities::SAVE_DATA
    }

    fn fingerprint(&self) -> u64 {
        self.grid.fingerprint()
    }

    fn prefix(&self, with_hash: bool) -> String {
        if with_hash {
            format!("basin_{}d_{:016x}", self.grid.dim(), self.fingerprint())
        } else {
            format!("basin_{}d", self.grid.dim())
        }
    }

    fn options(&self) -> &Options {
        &self.opts
    }

    fn set_options(&mut self, opts: Options) {
        self.opts = opts;
    }

    fn seed(&self) -> u64 {
        self.rng.seed()
    }

    fn set_seed(&mut self, seed: Option<u64>) {
        match seed {
            Some(s) => self.rng.set_seed(s),
            None => self.rng.bump_seed(),
        }
        self.opts.seed = Some(self.rng.seed());
    }

    fn result(&self) -> &Combiner {
        &self.result
    }

    fn result_mut(&mut self) -> &mut Combiner {
        &mut self.result
    }

    fn reset(&mut self) {
        self.grid.reset();
        self.result.reset();
    }

    fn clear_data(&mut self) {
        self.grid.clear_cells();
        self.result.reset();
    }

    fn adapt(&mut self) -> Result<()> {
        self.grid.adapt();
        Ok(())
    }

    fn run_iter<T>(&mut self, f: &mut dyn FnMut(&Point<'_, T>) -> f64, neval: u64, user_data: Option<&T>) -> Iteration {
        let d = self.grid.dim();
        let mut x = vec![0.0; d];
        let mut j0 = vec![0usize; d];
        let mut iter = Iteration::new();

        for i in 0..neval {
            let w = self.grid.sample(&mut self.rng, &mut x, &mut j0);
            let fx = f(&Point::new(&x, w, i, user_data));
            iter.accumulate(fx * w);
            self.grid.accumulate(&j0, &x, fx, w);
        }
        iter
    }

    fn write_state(&self, w: &mut dyn Write) -> Result<()> {
        codec::write_header(&mut *w, AlgId::Basin, FileKind::State)?;
        codec::write_size(&mut *w, self.grid.dim())?;
        codec::write_size(&mut *w, self.grid.k1())?;
        codec::write_size(&mut *w, self.grid.k2())?;
        codec::write_f64_array(&mut *w, &self.grid.grid_values())?;
        codec::write_size_array(&mut *w, &self.grid.order_values())?;
        Ok(())
    }

    fn read_state(&mut self, r: &mut dyn Read) -> Result<()> {
        let (alg_id, kind) = codec::read_header(&mut *r)?;
        if alg_id != AlgId::Basin || kind != FileKind::State {
            return Err(Error::HeaderMismatch { detail: "expected a BASIN state file".to_string() });
        }

        let d = codec::read_size(&mut *r)?;
        let k1 = codec::read_size(&mut *r)?;
        let k2 = codec::read_size(&mut *r)?;
        let values = codec::read_f64_array(&mut *r, d * d * k1 * k2)?;
        let order = codec::read_size_array(&mut *r)?;

        self.grid = BasinGrid::new(d, k1, k2, self.grid.alpha(), self.grid.w_s(), self.grid.s_min(), self.grid.rho());
        self.grid.set_grid_values(&values);
        self.grid.set_order_values(&order);
        Ok(())
    }

    fn write_data(&self, w: &mut dyn Write) -> Result<()> {
        codec::write_header(&mut *w, AlgId::Basin, FileKind::Data)?;
        codec::write_size(&mut *w, self.grid.dim())?;
        codec::write_size(&mut *w, self.grid.k1())?;
        codec::write_size(&mut *w, self.grid.k2())?;
        codec::write_count(&mut *w, self.grid.fingerprint())?;

        codec::write_size(&mut *w, self.result.iterations().len())?;
        for it in self.result.iterations() {
            codec::write_f64(&mut *w, it.sum_f())?;
            codec::write_f64(&mut *w, it.sum_f2())?;
            codec::write_count(&mut *w, it.count())?;
        }

        codec::write_count(&mut *w, self.grid.n_total())?;
        for cell in self.grid.marginal_cells() {
            codec::write_f64(&mut *w, cell.sum())?;
            codec::write_count(&mut *w, cell.count())?;
        }
        for cell in self.grid.conditional_cells() {
            codec::write_f64(&mut *w, cell.sum())?;
            codec::write_count(&mut *w, cell.count())?;
        }
        Ok(())
    }

    fn read_data(&mut self, r: &mut dyn Read, merge: bool) -> Result<()> {
        let (alg_id, kind) = codec::read_header(&mut *r)?;
        if alg_id != AlgId::Basin || kind != FileKind::Data {
            return Err(Error::HeaderMismatch { detail: "expected a BASIN data file".to_string() });
        }

        let d = codec::read_size(&mut *r)?;
        let k1 = codec::read_size(&mut *r)?;
        let k2 = codec::read_size(&mut *r)?;
        if d != self.grid.dim() || k1 != self.grid.k1() || k2 != self.grid.k2() {
            return Err(Error::HeaderMismatch {
                detail: format!(
                    "grid shape mismatch: file has d={d} k1={k1} k2={k2}, sampler has d={} k1={} k2={}",
                    self.grid.dim(),
                    self.grid.k1(),
                    self.grid.k2()
                ),
            });
        }

        let found = codec::read_count(&mut *r)?;
        if merge {
            let expected = self.grid.fingerprint();
            if found != expected {
                return Err(Error::IncompatibleFingerprint { expected, found });
            }
        } else if !self.result.is_empty() || self.grid.n_total() > 0 {
            return Err(Error::NonEmptyData);
        }

        let n_iters = codec::read_size(&mut *r)?;
        let mut incoming = Combiner::new();
        for _ in 0..n_iters {
            let sum_f = codec::read_f64(&mut *r)?;
            let sum_f2 = codec::read_f64(&mut *r)?;
            let count = codec::read_count(&mut *r)?;
            incoming.push(Iteration::from_parts(sum_f, sum_f2, count));
        }

        let total_cell_count = codec::read_count(&mut *r)?;
        let mut incoming_marginal = Vec::with_capacity(self.grid.marginal_cells().len());
        for _ in 0..self.grid.marginal_cells().len() {
            let sum = codec::read_f64(&mut *r)?;
            let count = codec::read_count(&mut *r)?;
            incoming_marginal.push(Cell::from_parts(sum, count));
        }
        let mut incoming_conditional = Vec::with_capacity(self.grid.conditional_cells().len());
        for _ in 0..self.grid.conditional_cells().len() {
            let sum = codec::read_f64(&mut *r)?;
            let count = codec::read_count(&mut *r)?;
            incoming_conditional.push(Cell::from_parts(sum, count));
        }

        if merge {
            self.result.push_result(&incoming);
            for (c, inc) in self.grid.marginal_cells_mut().iter_mut().zip(incoming_marginal) {
                *c += &inc;
            }
            for (c, inc) in self.grid.conditional_cells_mut().iter_mut().zip(incoming_conditional) {
                *c += &inc;
            }
            self.grid.set_n_total(self.grid.n_total() + total_cell_count);
        } else {
            self.result = incoming;
            self.grid.marginal_cells_mut().copy_from_slice(&incoming_marginal);
            self.grid.conditional_cells_mut().copy_from_slice(&incoming_conditional);
            self.grid.set_n_total(total_cell_count);
        }
        Ok(())
    }

    fn write_rng(&self, w: &mut dyn Write) -> Result<()> {
        self.rng.save(w)
    }

    fn read_rng(&mut self, r: &mut dyn BufRead, seed_hint: u64) -> Result<()> {
        self.rng.load(r, seed_hint)
    }
}

/// Tagged sum of the two concrete sampler variants, dispatched through [`Sampler`].
#[enum_dispatch(Sampler)]
pub enum SamplerEnum {
    /// Independent per-axis adaptive grid.
    VegasSampler,
    /// Nested marginal/conditional adaptive grid.
    BasinSampler,
}

fn state_file_path<S: Sampler>(sampler: &S, file_path: Option<&Path>) -> PathBuf {
    match file_path {
        Some(stem) => stem.with_extension("khs"),
        None => PathBuf::from(format!("{}.khs", sampler.prefix(false))),
    }
}

fn data_file_path<S: Sampler>(sampler: &S, file_path: Option<&Path>) -> PathBuf {
    match file_path {
        Some(stem) => stem.with_extension(format!("s{}.khd", sampler.seed())),
        None => PathBuf::from(format!("{}.s{}.khd", sampler.prefix(true), sampler.seed())),
    }
}

fn log_iteration<S: Sampler>(sampler: &S, iter_num: u64, niter: u64, iter: &Iteration, verbosity: u8) {
    let iv = iter.value().unwrap_or(f64::NAN);
    let ie = iter.error().unwrap_or(f64::NAN);
    let av = sampler.result().value().unwrap_or(f64::NAN);
    let ae = sampler.result().error().unwrap_or(f64::NAN);
    info!(
        "iter {iter_num}/{niter}: {iv:.6e} +- {ie:.6e}  accumulated: {av:.6e} +- {ae:.6e}  chi2/dof={:.3}",
        sampler.result().chi2_per_dof()
    );
    if verbosity >= 2 {
        debug!("sampler dim={} fingerprint={:#018x}", sampler.dim(), sampler.fingerprint());
    }
}

/// Runs `niter` iterations of `neval` samples each against integrand `f`, adapting and
/// snapshotting state along the way as `opts` (merged against `sampler`'s sticky options)
/// directs, and returns the accumulated result.
///
/// If `opts` sets `seed`, the sampler is reseeded with it before the first iteration.
/// `sampler`'s sticky options are restored to their pre-call value before returning,
/// successfully or not; the RNG is never restored, since its advancing state across the
/// run is the point of seeding it in the first place.
///
/// # Errors
///
/// Returns [`Error::Uninitialized`] if neither the sticky options nor `opts` set
/// `neval`/`niter`, [`Error::Unsupported`] if `opts` requests adaptation on a sampler
/// variant that doesn't support it, or propagates an I/O failure writing a state
/// snapshot.
pub fn integrate<S, T>(
    sampler: &mut S,
    f: &mut dyn FnMut(&Point<'_, T>) -> f64,
    user_data: Option<&T>,
    opts: Option<&Options>,
) -> Result<Combiner>
where
    S: Sampler,
{
    let original = sampler.options().clone();
    let effective = opts.map_or_else(|| original.clone(), |o| original.merge(o));

    if let Some(seed) = opts.and_then(|o| o.seed) {
        sampler.set_seed(Some(seed));
    }
    sampler.set_options(effective.clone());

    let run = (|| -> Result<Combiner> {
        let neval = effective.neval.ok_or_else(|| Error::Uninitialized { detail: "neval".to_string() })?;
        let niter = effective.niter.ok_or_else(|| Error::Uninitialized { detail: "niter".to_string() })?;
        let verbosity = effective.verbosity.unwrap_or(0);
        let do_adapt = effective.adapt.unwrap_or(false);

        for iter_num in 1..=niter {
            let iter = sampler.run_iter(f, neval, user_data);
            sampler.result_mut().push(iter);

            if verbosity > 0 {
                log_iteration(sampler, iter_num, niter, &iter, verbosity);
            }

            if do_adapt {
                if !sampler.capabilities().contains(Capabilities::ADAPT) {
                    return Err(Error::Unsupported { capability: "adapt" });
                }
                sampler.adapt()?;
            }

            if sampler.capabilities().contains(Capabilities::SAVE_STATE) {
                if let Some(stem) = effective.file_path.as_deref() {
                    let path = state_file_path(sampler, Some(stem));
                    let mut file = std::fs::File::create(path)?;
                    sampler.write_state(&mut file)?;
                }
            }
        }

        Ok(sampler.result().clone())
    })();

    sampler.set_options(original);
    run
}

/// Writes `sampler`'s grid/order to a `.khs` file. `file_path` overrides the default
/// `<prefix>.khs` name, with its extension rewritten.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if the sampler doesn't support state snapshots, or
/// propagates an I/O failure.
pub fn save_state<S: Sampler>(sampler: &S, file_path: Option<&Path>) -> Result<()> {
    if !sampler.capabilities().contains(Capabilities::SAVE_STATE) {
        return Err(Error::Unsupported { capability: "save_state" });
    }
    let path = state_file_path(sampler, file_path);
    let mut file = std::fs::File::create(path)?;
    sampler.write_state(&mut file)
}

/// Replaces `sampler`'s grid/order from a `.khs` file at `path`.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if the sampler doesn't support state snapshots, or
/// propagates an I/O or parse failure.
pub fn load_state<S: Sampler>(sampler: &mut S, path: &Path) -> Result<()> {
    if !sampler.capabilities().contains(Capabilities::SAVE_STATE) {
        return Err(Error::Unsupported { capability: "save_state" });
    }
    let mut file = std::fs::File::open(path)?;
    sampler.read_state(&mut file)
}

/// Writes `sampler`'s accumulated result and per-cell data to a `.khd` file. `file_path`
/// overrides the default `<prefix(with_hash)>.s<seed>.khd` name, with its extension
/// rewritten.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if the sampler doesn't support data snapshots, or
/// propagates an I/O failure.
pub fn save_data<S: Sampler>(sampler: &S, file_path: Option<&Path>) -> Result<()> {
    if !sampler.capabilities().contains(Capabilities::SAVE_DATA) {
        return Err(Error::Unsupported { capability: "save_data" });
    }
    let path = data_file_path(sampler, file_path);
    let mut file = std::fs::File::create(path)?;
    sampler.write_data(&mut file)
}

/// Replaces `sampler`'s accumulated result and per-cell data from a `.khd` file at
/// `path`. Fails if `sampler` already holds accumulated data.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if the sampler doesn't support data snapshots,
/// [`Error::NonEmptyData`] if `sampler` already holds accumulated data, or propagates an
/// I/O or parse failure.
pub fn load_data<S: Sampler>(sampler: &mut S, path: &Path) -> Result<()> {
    if !sampler.capabilities().contains(Capabilities::SAVE_DATA) {
        return Err(Error::Unsupported { capability: "save_data" });
    }
    let mut file = std::fs::File::open(path)?;
    sampler.read_data(&mut file, false)
}

/// Additively merges a `.khd` file at `path` into `sampler`'s accumulated result and
/// per-cell data. Fails if the file's fingerprint doesn't match `sampler`'s current grid
/// fingerprint exactly.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if the sampler doesn't support data snapshots,
/// [`Error::IncompatibleFingerprint`] on a fingerprint mismatch, or propagates an I/O or
/// parse failure.
pub fn append_data<S: Sampler>(sampler: &mut S, path: &Path) -> Result<()> {
    if !sampler.capabilities().contains(Capabilities::SAVE_DATA) {
        return Err(Error::Unsupported { capability: "save_data" });
    }
    let mut file = std::fs::File::open(path)?;
    sampler.read_data(&mut file, true)
}

/// Writes `sampler`'s RNG state to a `.khr` file at `path`.
///
/// # Errors
///
/// Propagates any I/O failure.
pub fn save_rng<S: Sampler>(sampler: &S, path: &Path) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    sampler.write_rng(&mut file)
}

/// Replaces `sampler`'s RNG state from a `.khr` file at `path`. The restored generator
/// reports `sampler`'s current seed via [`Sampler::seed`] afterward, since the original
/// integer seed isn't recoverable from the state words alone.
///
/// # Errors
///
/// Returns [`Error::HeaderMismatch`] if the generator tag doesn't match, or propagates an
/// I/O or parse failure.
pub fn load_rng<S: Sampler>(sampler: &mut S, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let hint = sampler.seed();
    sampler.read_rng(&mut std::io::BufReader::new(file), hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opts(neval: u64, niter: u64) -> Options {
        Options { neval: Some(neval), niter: Some(niter), ..Options::new() }
    }

    #[test]
    fn merge_prefers_overrides() {
        let base = base_opts(1000, 5);
        let overrides = Options { niter: Some(10), ..Options::new() };
        let merged = base.merge(&overrides);
        assert_eq!(merged.neval, Some(1000));
        assert_eq!(merged.niter, Some(10));
    }

    #[test]
    fn integrate_requires_neval_and_niter() {
        let mut sampler = VegasSampler::new(1, 8);
        let mut f = |p: &Point<'_, ()>| p.x[0];
        let err = integrate(&mut sampler, &mut f, None, None).unwrap_err();
        assert!(matches!(err, Error::Uninitialized { .. }));
    }

    #[test]
    fn uniform_integrand_converges_with_vegas() {
        let mut sampler = VegasSampler::new(1, 8);
        let mut f = |p: &Point<'_, ()>| p.x[0];
        let opts = base_opts(2000, 5);
        let result = integrate(&mut sampler, &mut f, None, Some(&opts)).unwrap();
        assert!((result.value().unwrap() - 0.5).abs() < 0.05);
    }

    #[test]
    fn adapt_during_integrate_updates_fingerprint() {
        let mut sampler = VegasSampler::new(2, 8);
        let before = sampler.fingerprint();
        let mut f = |p: &Point<'_, ()>| (-20.0 * (p.x[0] - 0.5).powi(2)).exp();
        let opts = Options { adapt: Some(true), ..base_opts(2000, 3) };
        integrate(&mut sampler, &mut f, None, Some(&opts)).unwrap();
        assert_ne!(sampler.fingerprint(), before);
    }

    #[test]
    fn integrate_restores_sticky_options_after_override() {
        let mut sampler = VegasSampler::new(1, 4);
        sampler.set_options(base_opts(100, 1));
        let mut f = |p: &Point<'_, ()>| p.x[0];
        let overrides = base_opts(50, 1);
        integrate(&mut sampler, &mut f, None, Some(&overrides)).unwrap();
        assert_eq!(sampler.options().neval, Some(100));
    }

    #[test]
    fn data_round_trips_through_bytes() {
        let mut sampler = VegasSampler::new(2, 8);
        let mut f = |p: &Point<'_, ()>| p.x[0] * p.x[1];
        let opts = base_opts(500, 2);
        integrate(&mut sampler, &mut f, None, Some(&opts)).unwrap();

        let mut buf = Vec::new();
        sampler.write_data(&mut buf).unwrap();

        let mut restored = VegasSampler::new(2, 8);
        restored.read_data(&mut &buf[..], false).unwrap();
        assert_eq!(restored.result().count(), sampler.result().count());
        assert_eq!(restored.grid().n_total(), sampler.grid().n_total());
    }

    #[test]
    fn append_data_rejects_fingerprint_mismatch() {
        let mut a = VegasSampler::new(1, 8);
        let mut f = |p: &Point<'_, ()>| p.x[0];
        let opts = Options { adapt: Some(true), ..base_opts(2000, 2) };
        integrate(&mut a, &mut f, None, Some(&opts)).unwrap();
        let mut buf = Vec::new();
        a.write_data(&mut buf).unwrap();

        // same shape as `a`, but never adapted: its fingerprint differs from `a`'s.
        let mut b = VegasSampler::new(1, 8);
        let err = b.read_data(&mut &buf[..], true).unwrap_err();
        assert!(matches!(err, Error::IncompatibleFingerprint { .. }));
    }

    #[test]
    fn load_data_rejects_non_empty_sampler() {
        let mut a = VegasSampler::new(1, 8);
        let mut f = |p: &Point<'_, ()>| p.x[0];
        integrate(&mut a, &mut f, None, Some(&base_opts(200, 1))).unwrap();
        let mut buf = Vec::new();
        a.write_data(&mut buf).unwrap();

        integrate(&mut a, &mut f, None, Some(&base_opts(10, 1))).unwrap();
        let err = a.read_data(&mut &buf[..], false).unwrap_err();
        assert!(matches!(err, Error::NonEmptyData));
    }

    #[test]
    fn basin_samples_and_adapts() {
        let mut sampler = BasinSampler::new(2, 4, 8);
        let mut f = |p: &Point<'_, ()>| (-30.0 * (p.x[0] - p.x[1]).powi(2)).exp();
        let opts = Options { adapt: Some(true), ..base_opts(3000, 2) };
        let result = integrate(&mut sampler, &mut f, None, Some(&opts)).unwrap();
        assert!(result.value().unwrap() >= 0.0);
    }

    #[test]
    fn state_round_trips_through_bytes() {
        let mut sampler = VegasSampler::new(2, 16);
        let mut f = |p: &Point<'_, ()>| p.x[0];
        let opts = Options { adapt: Some(true), ..base_opts(2000, 2) };
        integrate(&mut sampler, &mut f, None, Some(&opts)).unwrap();

        let mut buf = Vec::new();
        sampler.write_state(&mut buf).unwrap();

        let mut restored = VegasSampler::new(2, 16);
        restored.read_state(&mut &buf[..]).unwrap();
        assert_eq!(restored.fingerprint(), sampler.fingerprint());
    }

    #[test]
    fn prefix_includes_hash_only_when_requested() {
        let sampler = BasinSampler::new(3, 4, 8);
        let bare = sampler.prefix(false);
        let hashed = sampler.prefix(true);
        assert_eq!(bare, "basin_3d");
        assert!(hashed.starts_with("basin_3d_"));
        assert_ne!(bare, hashed);
    }
}
