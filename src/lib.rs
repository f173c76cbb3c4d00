//! Adaptive multi-dimensional Monte Carlo integration: VEGAS and BASIN importance
//! samplers sharing one compensated-summation, result-combination, and binary
//! serialization spine.

pub mod accumulator;
pub mod cell;
pub mod codec;
pub mod combiner;
pub mod error;
pub mod fingerprint;
pub mod grid;
pub mod iteration;
pub mod point;
pub mod rng;
pub mod sampler;

pub use accumulator::Compensated;
pub use cell::Cell;
pub use combiner::Combiner;
pub use error::{Error, Result};
pub use grid::basin::BasinGrid;
pub use grid::vegas::VegasGrid;
pub use iteration::Iteration;
pub use point::Point;
pub use rng::Rng;
pub use sampler::{
    append_data, integrate, load_data, load_rng, load_state, save_data, save_rng, save_state, BasinSampler, Capabilities,
    Options, Sampler, SamplerEnum, VegasSampler,
};
