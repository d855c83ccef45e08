//! Uncorrelated (diagonal-only) error sources.

use mu_core::{Error, Result};
use mu_hist::Hist1D;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// A named bin-to-bin uncorrelated error source.
///
/// The histogram's content accumulates CV weights and its error field
/// accumulates the supplied per-event errors by plain addition (not
/// quadrature), so `bin_err / bin_content` stays the average of
/// `err / weight` over repeated fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncorrError {
    name: String,
    hist: Hist1D,
}

impl UncorrError {
    /// Create an empty source cloned from `base`.
    pub fn new(name: impl Into<String>, base: &Hist1D) -> Self {
        let name = name.into();
        let hist = base.cloned_empty(name.clone());
        Self { name, hist }
    }

    /// Adopt an existing error histogram: the content is copied from `base`
    /// (assumed final), the per-bin error is read from `errs`'s content when
    /// `err_in_content` is set, otherwise from its error field.
    pub fn from_hist(
        name: impl Into<String>,
        base: &Hist1D,
        errs: &Hist1D,
        err_in_content: bool,
    ) -> Result<Self> {
        if !base.same_binning(errs) {
            return Err(Error::Validation(format!(
                "uncorrelated error '{}': binning mismatch with '{}'",
                base.name(),
                errs.name()
            )));
        }
        let name = name.into();
        let mut hist = base.clone();
        hist.set_name(name.clone());
        for bin in 0..hist.n_total_bins() {
            let err = if err_in_content { errs.bin_content(bin) } else { errs.bin_error(bin) };
            hist.set_bin_error(bin, err);
        }
        Ok(Self { name, hist })
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the source.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.hist.set_name(self.name.clone());
    }

    /// Backing histogram (content = accumulated weights, error = summed errors).
    pub fn hist(&self) -> &Hist1D {
        &self.hist
    }

    /// Mutable access for arithmetic propagation by the owning aggregator.
    pub(crate) fn hist_mut(&mut self) -> &mut Hist1D {
        &mut self.hist
    }

    /// Accumulate an event: content += `cvweight`, error += `err` (plain
    /// addition, not quadrature).
    pub fn fill(&mut self, val: f64, err: f64, cvweight: f64) {
        let bin = self.hist.find_bin(val);
        self.hist.add_bin_content(bin, cvweight);
        self.hist.set_bin_error(bin, err + self.hist.bin_error(bin));
    }

    /// The stored error as a histogram: content = accumulated error
    /// (divided by the CV content when `as_frac`, 0 where the CV is empty),
    /// errors zeroed.
    pub fn get_as_hist(&self, cv: &Hist1D, as_frac: bool) -> Hist1D {
        let mut out = cv.cloned_empty(self.name.clone());
        for bin in 0..self.hist.n_total_bins() {
            let err = self.hist.bin_error(bin);
            let content = if as_frac {
                let cv_val = cv.bin_content(bin);
                if cv_val == 0.0 {
                    0.0
                } else {
                    (err / cv_val).abs()
                }
            } else {
                err
            };
            out.set_bin_content(bin, content);
            out.set_bin_error(bin, 0.0);
        }
        out
    }

    /// Diagonal covariance contribution: `err²` on the diagonal.
    pub fn cov_mx(&self) -> DMatrix<f64> {
        let n_total = self.hist.n_total_bins();
        let mut covmx = DMatrix::<f64>::zeros(n_total, n_total);
        for bin in 0..n_total {
            let e = self.hist.bin_error(bin);
            covmx[(bin, bin)] = e * e;
        }
        covmx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn base() -> Hist1D {
        Hist1D::with_uniform_bins("cv", 4, 0.0, 4.0).unwrap()
    }

    #[test]
    fn fill_keeps_error_over_content_average() {
        let mut unc = UncorrError::new("u", &base());
        // err/weight = 0.1 both times; average must stay 0.1
        unc.fill(1.5, 0.2, 2.0);
        unc.fill(1.5, 0.1, 1.0);
        assert_relative_eq!(unc.hist().bin_content(2), 3.0);
        assert_relative_eq!(unc.hist().bin_error(2), 0.3);
        assert_relative_eq!(unc.hist().bin_error(2) / unc.hist().bin_content(2), 0.1);
    }

    #[test]
    fn errors_add_plainly_not_in_quadrature() {
        let mut unc = UncorrError::new("u", &base());
        unc.fill(0.5, 3.0, 1.0);
        unc.fill(0.5, 4.0, 1.0);
        assert_relative_eq!(unc.hist().bin_error(1), 7.0);
    }

    #[test]
    fn as_hist_absolute_and_fractional() {
        let mut cv = base();
        cv.fill(1.5, 10.0);
        let mut unc = UncorrError::new("u", &cv);
        unc.fill(1.5, 2.0, 1.0);

        let abs = unc.get_as_hist(&cv, false);
        assert_relative_eq!(abs.bin_content(2), 2.0);
        assert_eq!(abs.bin_error(2), 0.0);

        let frac = unc.get_as_hist(&cv, true);
        assert_relative_eq!(frac.bin_content(2), 0.2);
        // empty CV bin: fractional error defined as 0
        assert_eq!(frac.bin_content(1), 0.0);
    }

    #[test]
    fn cov_is_diagonal_err_squared() {
        let mut unc = UncorrError::new("u", &base());
        unc.fill(2.5, 3.0, 1.0);
        let covmx = unc.cov_mx();
        assert_relative_eq!(covmx[(3, 3)], 9.0);
        assert_eq!(covmx[(3, 2)], 0.0);
        assert_eq!(covmx[(2, 2)], 0.0);
    }

    #[test]
    fn from_hist_reads_err_from_content_or_error() {
        let mut errs = base();
        errs.set_bin_content(1, 0.5);
        errs.set_bin_error(1, 0.7);

        let a = UncorrError::from_hist("a", &base(), &errs, true).unwrap();
        assert_relative_eq!(a.hist().bin_error(1), 0.5);

        let b = UncorrError::from_hist("b", &base(), &errs, false).unwrap();
        assert_relative_eq!(b.hist().bin_error(1), 0.7);
    }
}
