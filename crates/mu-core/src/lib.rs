//! # mu-core
//!
//! Shared error type and numeric helpers for the multiverse systematics
//! engine: spread/quantile statistics and the sentinel constants used by the
//! lateral-shift fill protocol.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod stats;

pub use error::{Error, Result};
pub use stats::{
    interquartile_range, is_not_physical_shift, quantile, IQR_TO_SIGMA, NOT_PHYSICAL_SHIFT,
};
