//! Property-level scenario tests over the public sampler API.

use kakuhen::{
    accumulator::Compensated, grid::emd::earth_movers_distance, integrate, BasinSampler, Options, Point, Sampler,
    VegasSampler,
};

fn opts(neval: u64, niter: u64, adapt: bool) -> Options {
    Options { neval: Some(neval), niter: Some(niter), adapt: Some(adapt), ..Options::new() }
}

#[test]
fn s1_uniform_2d_vegas_converges() {
    let mut sampler = VegasSampler::new(2, 64);
    let mut f = |_: &Point<'_, ()>| 1.0;
    let result = integrate(&mut sampler, &mut f, None, Some(&opts(10_000, 5, true))).unwrap();

    let value = result.value().unwrap();
    let error = result.error().unwrap();
    assert!((value - 1.0).abs() <= 3.0 * error.max(1e-6));
    assert!(error <= 0.01);
    assert!(result.chi2_per_dof().is_finite());
    assert!(result.chi2_per_dof() < 5.0);
}

#[test]
fn s2_peaked_2d_vegas_adaptation_shrinks_variance() {
    let mut f = |p: &Point<'_, ()>| (-50.0 * ((p.x[0] - 0.3).powi(2) + (p.x[1] - 0.7).powi(2))).exp();

    let mut adapted = VegasSampler::new(2, 64);
    integrate(&mut adapted, &mut f, None, Some(&opts(5_000, 5, true))).unwrap();
    let adapted_var = adapted.result().error().unwrap().powi(2);

    let mut flat = VegasSampler::new(2, 64);
    integrate(&mut flat, &mut f, None, Some(&opts(25_000, 1, false))).unwrap();
    let flat_var = flat.result().error().unwrap().powi(2);

    assert!(adapted_var < 0.1 * flat_var, "adapted_var={adapted_var}, flat_var={flat_var}");
}

#[test]
fn s3_correlated_ridge_basin_beats_vegas_and_chains_order() {
    let mut f = |p: &Point<'_, ()>| (-200.0 * (p.x[0] - p.x[1]).powi(2)).exp();

    let mut basin = BasinSampler::new(2, 8, 16);
    integrate(&mut basin, &mut f, None, Some(&opts(4_000, 3, true))).unwrap();
    let basin_var = basin.result().error().unwrap().powi(2);

    let mut vegas = VegasSampler::new(2, 64);
    integrate(&mut vegas, &mut f, None, Some(&opts(4_000, 3, true))).unwrap();
    let vegas_var = vegas.result().error().unwrap().powi(2);

    assert!(basin_var < vegas_var, "basin_var={basin_var}, vegas_var={vegas_var}");

    let order = basin.grid().order();
    let [i, j] = order[0];
    assert_eq!(i, j, "order[0] must pick a new axis: {order:?}");
    assert_eq!(order[1], [i, 1 - i], "order[1] must chain the conditioning over both dims: {order:?}");
}

#[test]
fn s4_fingerprint_sensitivity() {
    let mut a = VegasSampler::new(3, 32);
    let mut b = VegasSampler::new(3, 32);
    let mut f = |p: &Point<'_, ()>| p.x[0] + p.x[1] + p.x[2];

    integrate(&mut a, &mut f, None, Some(&opts(1_000, 1, false))).unwrap();
    integrate(&mut b, &mut f, None, Some(&opts(1_000, 1, false))).unwrap();

    let mut buf = Vec::new();
    a.write_data(&mut buf).unwrap();
    b.read_data(&mut &buf[..], true).unwrap();
    assert_eq!(b.result().count(), 2_000);

    b.adapt().unwrap();
    let err = b.read_data(&mut &buf[..], true).unwrap_err();
    assert!(matches!(err, kakuhen::Error::IncompatibleFingerprint { .. }));
}

#[test]
fn s5_emd_sanity() {
    let a = [0.25, 0.5, 0.75, 1.0];
    assert!((earth_movers_distance(&a, &a)).abs() < 1e-12);

    let half = [0.5, 1.0];
    let quarters = [0.25, 0.5, 0.75, 1.0];
    assert!((earth_movers_distance(&half, &quarters) - 0.125).abs() < 1e-9);
}

#[test]
fn verbose_integrate_logs_progress() {
    let _ = simplelog::TermLogger::init(
        log::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Never,
    );

    let mut sampler = VegasSampler::new(1, 8);
    let mut f = |p: &Point<'_, ()>| p.x[0];
    integrate(&mut sampler, &mut f, None, Some(&opts(200, 2, false))).unwrap();

    let mut verbose_opts = opts(200, 2, true);
    verbose_opts.verbosity = Some(2);
    integrate(&mut sampler, &mut f, None, Some(&verbose_opts)).unwrap();
}

#[test]
fn s6_two_sum_accuracy() {
    let mut acc = Compensated::new(0.0);
    const N_ONES: usize = 1000;
    for _ in 0..N_ONES {
        acc.add(1e16);
        acc.add(1.0);
        acc.add(-1e16);
        acc.add(1.0);
        acc.add(-1.0);
    }
    assert!((acc.result() - N_ONES as f64).abs() < 1e-6);

    let mut naive = 0.0_f64;
    for _ in 0..N_ONES {
        naive += 1e16;
        naive += 1.0;
        naive += -1e16;
        naive += 1.0;
        naive += -1.0;
    }
    assert!((naive - N_ONES as f64).abs() > 1.0, "naive accumulation unexpectedly stayed accurate: {naive}");
}
