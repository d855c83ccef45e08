//! # mu-hist
//!
//! Dense 1D binned accumulator used as the storage collaborator by the
//! multiverse systematics engine. Bins are indexed `0..=n+1` where bin `0`
//! is the underflow and bin `n+1` the overflow, so every per-bin array and
//! every covariance matrix built on top has dimension `n + 2`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hist1d;

pub use hist1d::Hist1D;
