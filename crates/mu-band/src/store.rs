//! Storage for externally supplied covariance matrices.

use std::collections::BTreeMap;

use log::warn;
use mu_core::{Error, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Suffix marking the shape-only (area-normalized) partner of a pushed
/// covariance matrix.
pub const SHAPE_SUFFIX: &str = "_asShape";

/// Named covariance matrices pushed from outside, with a parallel store of
/// matrices temporarily removed from total-error sums.
///
/// A matrix pushed with area normalization is stored under
/// `name + "_asShape"`; the plain and shape entries for a name move between
/// the active and removed stores together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysMatrixStore {
    active: BTreeMap<String, DMatrix<f64>>,
    removed: BTreeMap<String, DMatrix<f64>>,
}

impl SysMatrixStore {
    /// New empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `covmx` under `name`, or under `name + "_asShape"` when
    /// `area_normalized` is set. Rejects names already present (active or
    /// removed), names that themselves carry the shape suffix, and matrices
    /// whose dimension is not `expected_dim`.
    pub fn push(
        &mut self,
        name: &str,
        covmx: DMatrix<f64>,
        area_normalized: bool,
        expected_dim: usize,
    ) -> Result<()> {
        if name.ends_with(SHAPE_SUFFIX) {
            warn!("cannot push matrix '{name}': name carries the shape suffix");
            return Err(Error::Validation(format!(
                "matrix name '{name}' may not end with '{SHAPE_SUFFIX}'"
            )));
        }
        if covmx.nrows() != expected_dim || covmx.ncols() != expected_dim {
            warn!(
                "cannot push matrix '{name}': dimension {}x{}, expected {expected_dim}x{expected_dim}",
                covmx.nrows(),
                covmx.ncols()
            );
            return Err(Error::Validation(format!(
                "matrix '{name}' has dimension {}x{}, expected {expected_dim}x{expected_dim}",
                covmx.nrows(),
                covmx.ncols()
            )));
        }
        let fname = if area_normalized { format!("{name}{SHAPE_SUFFIX}") } else { name.to_owned() };
        if self.removed.contains_key(&fname) {
            warn!("cannot push matrix '{fname}': a removed matrix holds that name");
            return Err(Error::Validation(format!(
                "matrix '{fname}' exists among removed matrices"
            )));
        }
        if self.active.contains_key(&fname) {
            warn!("cannot push matrix '{fname}': already present");
            return Err(Error::Validation(format!("matrix '{fname}' already present")));
        }
        self.active.insert(fname, covmx);
        Ok(())
    }

    /// Move the plain and shape entries for `name` from the active store to
    /// the removed store. At least one of the two must be active.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let shape = format!("{name}{SHAPE_SUFFIX}");
        let plain = self.active.remove(name);
        let shaped = self.active.remove(&shape);
        if plain.is_none() && shaped.is_none() {
            warn!("cannot remove matrix '{name}': not present");
            return Err(Error::Validation(format!("no active matrix named '{name}'")));
        }
        if let Some(m) = plain {
            self.removed.insert(name.to_owned(), m);
        }
        if let Some(m) = shaped {
            self.removed.insert(shape, m);
        }
        Ok(())
    }

    /// Move the plain and shape entries for `name` back to the active store.
    pub fn unremove(&mut self, name: &str) -> Result<()> {
        let shape = format!("{name}{SHAPE_SUFFIX}");
        let plain = self.removed.remove(name);
        let shaped = self.removed.remove(&shape);
        if plain.is_none() && shaped.is_none() {
            warn!("cannot restore matrix '{name}': not among removed matrices");
            return Err(Error::Validation(format!("no removed matrix named '{name}'")));
        }
        if let Some(m) = plain {
            self.active.insert(name.to_owned(), m);
        }
        if let Some(m) = shaped {
            self.active.insert(shape, m);
        }
        Ok(())
    }

    /// Whether an active matrix is stored under exactly `name`.
    pub fn has(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    /// Whether `name` (plain or shape) sits in the removed store.
    pub fn has_removed(&self, name: &str) -> bool {
        self.removed.contains_key(name)
            || self.removed.contains_key(&format!("{name}{SHAPE_SUFFIX}"))
    }

    /// Active matrix stored under exactly `name`.
    pub fn get(&self, name: &str) -> Option<&DMatrix<f64>> {
        self.active.get(name)
    }

    /// Active names, sorted. Shape entries are never listed: a matrix pushed
    /// only in its area-normalized form stays out of enumeration (and so out
    /// of total-error sums) until a plain sibling is pushed.
    pub fn names(&self) -> Vec<String> {
        self.active.keys().filter(|k| !k.ends_with(SHAPE_SUFFIX)).cloned().collect()
    }

    /// Removed names, sorted, shape entries excluded as in
    /// [`names`](Self::names).
    pub fn removed_names(&self) -> Vec<String> {
        self.removed.keys().filter(|k| !k.ends_with(SHAPE_SUFFIX)).cloned().collect()
    }

    /// Number of active entries (plain and shape counted separately).
    pub fn n_matrices(&self) -> usize {
        self.active.len()
    }

    /// Iterate over active entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DMatrix<f64>)> {
        self.active.iter()
    }

    /// Scale every stored matrix (active and removed) by `c²`, matching a
    /// histogram scaled by `c`.
    pub fn scale(&mut self, c: f64) {
        let c2 = c * c;
        for m in self.active.values_mut() {
            *m *= c2;
        }
        for m in self.removed.values_mut() {
            *m *= c2;
        }
    }

    /// Scale element `(j, k)` of every stored matrix by
    /// `factors[j] * factors[k]`, matching a histogram scaled per bin by
    /// `factors`.
    pub fn scale_elementwise(&mut self, factors: &[f64]) {
        let apply = |m: &mut DMatrix<f64>| {
            for j in 0..m.nrows().min(factors.len()) {
                for k in 0..m.ncols().min(factors.len()) {
                    m[(j, k)] *= factors[j] * factors[k];
                }
            }
        };
        for m in self.active.values_mut() {
            apply(m);
        }
        for m in self.removed.values_mut() {
            apply(m);
        }
    }

    /// Drop everything, active and removed.
    pub fn clear(&mut self) {
        self.active.clear();
        self.removed.clear();
    }

    /// Whether both stores are empty.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mx(dim: usize, val: f64) -> DMatrix<f64> {
        DMatrix::from_element(dim, dim, val)
    }

    #[test]
    fn push_and_get() {
        let mut store = SysMatrixStore::new();
        store.push("flux", mx(4, 1.0), false, 4).unwrap();
        assert!(store.has("flux"));
        assert_eq!(store.n_matrices(), 1);
        assert_relative_eq!(store.get("flux").unwrap()[(0, 0)], 1.0);
    }

    #[test]
    fn shape_push_stores_under_suffix() {
        let mut store = SysMatrixStore::new();
        store.push("flux", mx(4, 1.0), true, 4).unwrap();
        assert!(!store.has("flux"));
        assert!(store.has("flux_asShape"));
        // shape-only: the name is not enumerated until a plain sibling lands
        assert!(store.names().is_empty());
        store.push("flux", mx(4, 2.0), false, 4).unwrap();
        assert_eq!(store.names(), vec!["flux".to_owned()]);
    }

    #[test]
    fn removed_names_hide_shape_entries() {
        let mut store = SysMatrixStore::new();
        store.push("flux", mx(4, 1.0), false, 4).unwrap();
        store.push("flux", mx(4, 2.0), true, 4).unwrap();
        store.remove("flux").unwrap();
        assert_eq!(store.removed_names(), vec!["flux".to_owned()]);
    }

    #[test]
    fn rejects_wrong_dimension_and_duplicates() {
        let mut store = SysMatrixStore::new();
        assert!(store.push("a", mx(3, 1.0), false, 4).is_err());
        assert_eq!(store.n_matrices(), 0);
        store.push("a", mx(4, 1.0), false, 4).unwrap();
        assert!(store.push("a", mx(4, 2.0), false, 4).is_err());
        assert_eq!(store.n_matrices(), 1);
    }

    #[test]
    fn rejects_suffix_named_push() {
        let mut store = SysMatrixStore::new();
        assert!(store.push("bad_asShape", mx(4, 1.0), false, 4).is_err());
    }

    #[test]
    fn remove_moves_pair_and_blocks_repush() {
        let mut store = SysMatrixStore::new();
        store.push("flux", mx(4, 1.0), false, 4).unwrap();
        store.push("flux", mx(4, 2.0), true, 4).unwrap();
        store.remove("flux").unwrap();
        assert!(!store.has("flux"));
        assert!(!store.has("flux_asShape"));
        assert!(store.has_removed("flux"));
        assert!(store.push("flux", mx(4, 3.0), false, 4).is_err());

        store.unremove("flux").unwrap();
        assert!(store.has("flux"));
        assert!(store.has("flux_asShape"));
        assert_relative_eq!(store.get("flux_asShape").unwrap()[(1, 1)], 2.0);
    }

    #[test]
    fn remove_unknown_fails() {
        let mut store = SysMatrixStore::new();
        assert!(store.remove("nope").is_err());
        assert!(store.unremove("nope").is_err());
    }

    #[test]
    fn scale_applies_c_squared_everywhere() {
        let mut store = SysMatrixStore::new();
        store.push("a", mx(4, 1.0), false, 4).unwrap();
        store.push("b", mx(4, 1.0), false, 4).unwrap();
        store.remove("b").unwrap();
        store.scale(3.0);
        assert_relative_eq!(store.get("a").unwrap()[(0, 0)], 9.0);
        store.unremove("b").unwrap();
        assert_relative_eq!(store.get("b").unwrap()[(0, 0)], 9.0);
    }
}
