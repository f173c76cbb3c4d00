//! Error taxonomy for this crate.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Zero dimension, `K <= 1`, `min >= max`, unsorted edges, or a negative damping
    /// exponent were supplied to a constructor or setter.
    #[error("invalid argument: {detail}")]
    InvalidArgument {
        /// Human-readable description of what was wrong.
        detail: String,
    },
    /// `integrate` was called without `neval`/`niter` set.
    #[error("sampler not fully configured: {detail}")]
    Uninitialized {
        /// Which option was missing.
        detail: String,
    },
    /// The magic, algorithm id, file kind, or a type tag didn't match on load.
    #[error("file header mismatch: {detail}")]
    HeaderMismatch {
        /// Human-readable description of the mismatch.
        detail: String,
    },
    /// `append_data`'s on-disk fingerprint didn't match the current grid's fingerprint.
    #[error("incompatible fingerprint: expected {expected:#018x}, found {found:#018x}")]
    IncompatibleFingerprint {
        /// The fingerprint of the sampler being merged into.
        expected: u64,
        /// The fingerprint recorded in the file being merged.
        found: u64,
    },
    /// `load_data` was called while the sampler's accumulators or result were non-empty.
    #[error("refusing to overwrite non-empty accumulated data")]
    NonEmptyData,
    /// A statistic was requested on an empty result combiner.
    #[error("no iteration results have been accumulated")]
    NoResults,
    /// A statistic was requested on an iteration accumulator with zero samples.
    #[error("iteration accumulator is empty")]
    EmptyAccumulator,
    /// The sampler doesn't support the requested capability.
    #[error("sampler does not support capability {capability}")]
    Unsupported {
        /// Name of the capability requested (`"adapt"`, `"save_data"`, ...).
        capability: &'static str,
    },
    /// A wrapped I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
