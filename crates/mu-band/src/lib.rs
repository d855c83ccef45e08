//! # mu-band
//!
//! Multi-universe propagation of systematic uncertainty through binned
//! measurements. A systematic source is a [`UniverseSet`]: N alternate
//! outcomes of the same measurement, filled either by reweighting events
//! (vertical) or by shifting their fill location (lateral). A covariance
//! matrix is estimated from the spread of the universes around the central
//! value. [`UniverseHist`] aggregates many named sources, externally pushed
//! covariance matrices and uncorrelated per-bin errors into total
//! covariance/correlation matrices, and propagates histogram arithmetic
//! consistently across everything it owns.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod band;
pub mod hist;
pub mod store;
pub mod uncorr;

pub use band::UniverseSet;
pub use hist::UniverseHist;
pub use store::{SysMatrixStore, SHAPE_SUFFIX};
pub use uncorr::UncorrError;
