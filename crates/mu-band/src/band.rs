//! A named systematic source: N universe histograms around a central value.

use mu_core::{interquartile_range, is_not_physical_shift, Error, Result, IQR_TO_SIGMA};
use mu_hist::Hist1D;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Below this universe count the spread estimator is the default.
const SPREAD_ERROR_DEFAULT_BELOW: usize = 10;

/// A systematic error band: a fixed-size ordered set of universe histograms
/// plus its own copy of the central value (CV), kept in sync by the owning
/// aggregator's arithmetic propagation.
///
/// The universe count is fixed at construction. Vertical sources fill with
/// [`fill_reweighted`](Self::fill_reweighted) (same bin as the CV, varied
/// weight); lateral sources fill with [`fill_shifted`](Self::fill_shifted)
/// (varied bin, CV weight).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseSet {
    name: String,
    cv: Hist1D,
    universes: Vec<Hist1D>,
    use_spread_error: bool,
}

impl UniverseSet {
    /// Create a band with `n_universes` empty universes cloned from `base`.
    ///
    /// The spread estimator is the default for fewer than 10 universes.
    pub fn new(name: impl Into<String>, base: &Hist1D, n_universes: usize) -> Result<Self> {
        if n_universes == 0 {
            return Err(Error::Validation("error band needs at least one universe".to_string()));
        }
        let name = name.into();
        let mut cv = base.clone();
        cv.set_name(name.clone());
        let universes = (0..n_universes)
            .map(|i| base.cloned_empty(format!("{name}_universe{i}")))
            .collect();
        Ok(Self { name, cv, universes, use_spread_error: n_universes < SPREAD_ERROR_DEFAULT_BELOW })
    }

    /// Create a band from pre-filled universe histograms.
    ///
    /// All universes must share the binning of `base`.
    pub fn from_universes(
        name: impl Into<String>,
        base: &Hist1D,
        universes: Vec<Hist1D>,
    ) -> Result<Self> {
        if universes.is_empty() {
            return Err(Error::Validation("error band needs at least one universe".to_string()));
        }
        if universes.iter().any(|u| !u.same_binning(base)) {
            return Err(Error::Validation(format!(
                "universe binning does not match central value '{}'",
                base.name()
            )));
        }
        let name = name.into();
        let mut cv = base.clone();
        cv.set_name(name.clone());
        let universes = universes
            .into_iter()
            .enumerate()
            .map(|(i, mut u)| {
                u.set_name(format!("{name}_universe{i}"));
                u
            })
            .collect::<Vec<_>>();
        let n = universes.len();
        Ok(Self { name, cv, universes, use_spread_error: n < SPREAD_ERROR_DEFAULT_BELOW })
    }

    /// Band name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the band and its universes.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.cv.set_name(self.name.clone());
        for (i, u) in self.universes.iter_mut().enumerate() {
            u.set_name(format!("{}_universe{i}", self.name));
        }
    }

    /// Number of universes (fixed at construction).
    pub fn n_universes(&self) -> usize {
        self.universes.len()
    }

    /// This band's copy of the central value.
    pub fn cv(&self) -> &Hist1D {
        &self.cv
    }

    /// Universe `i`, or `None` past the end (with a warning).
    pub fn universe(&self, i: usize) -> Option<&Hist1D> {
        if i >= self.universes.len() {
            log::warn!(
                "band '{}' has {} universes, cannot return universe {i}",
                self.name,
                self.universes.len()
            );
            return None;
        }
        Some(&self.universes[i])
    }

    /// All universes in order.
    pub fn universes(&self) -> &[Hist1D] {
        &self.universes
    }

    /// Whether the covariance uses the spread estimator.
    pub fn use_spread_error(&self) -> bool {
        self.use_spread_error
    }

    /// Select the spread (`true`) or sample-covariance (`false`) estimator.
    pub fn set_use_spread_error(&mut self, use_spread: bool) {
        self.use_spread_error = use_spread;
    }

    //------------------------------------------------------------------
    // Filling
    //------------------------------------------------------------------

    /// Vertical (reweighted) fill: fill the CV at `val` with `cvweight`, and
    /// add `weights[i] * cvweight / cv_weight_from_me` to the SAME bin of
    /// universe `i`. `cv_weight_from_me` removes double-counting when this
    /// source already contributed a factor to `cvweight`.
    ///
    /// Returns the bin filled.
    pub fn fill_reweighted(
        &mut self,
        val: f64,
        weights: &[f64],
        cvweight: f64,
        cv_weight_from_me: f64,
    ) -> Result<usize> {
        if weights.len() != self.universes.len() {
            return Err(Error::Validation(format!(
                "band '{}': got {} weights for {} universes",
                self.name,
                weights.len(),
                self.universes.len()
            )));
        }
        let bin = self.cv.fill(val, cvweight);
        let apply = cvweight / cv_weight_from_me;
        for (u, w) in self.universes.iter_mut().zip(weights) {
            u.fill_bin(bin, w * apply);
        }
        Ok(bin)
    }

    /// Two-universe convenience form of [`fill_reweighted`](Self::fill_reweighted).
    ///
    /// # Panics
    /// Panics if the band was not constructed with exactly 2 universes.
    pub fn fill_reweighted_up_down(
        &mut self,
        val: f64,
        weight_down: f64,
        weight_up: f64,
        cvweight: f64,
        cv_weight_from_me: f64,
    ) -> usize {
        assert!(
            self.universes.len() == 2,
            "band '{}': 2-universe fill called with {} universes",
            self.name,
            self.universes.len()
        );
        // length just checked
        self.fill_reweighted(val, &[weight_down, weight_up], cvweight, cv_weight_from_me)
            .unwrap_or(0)
    }

    /// Lateral (shifted) fill: optionally fill the CV at `val`, then fill
    /// universe `i` at `val + shifts[i]` with `cvweight * weights[i]`
    /// (weight defaults to 1). A shift equal to the not-physical sentinel
    /// leaves that universe untouched.
    ///
    /// The target-bin search starts from the CV bin and walks outward one
    /// bin at a time until the shifted value fits, clamping at the
    /// under/overflow.
    pub fn fill_shifted(
        &mut self,
        val: f64,
        shifts: &[f64],
        cvweight: f64,
        fill_cv: bool,
        weights: Option<&[f64]>,
    ) -> Result<()> {
        if shifts.len() != self.universes.len() {
            return Err(Error::Validation(format!(
                "band '{}': got {} shifts for {} universes",
                self.name,
                shifts.len(),
                self.universes.len()
            )));
        }
        if let Some(w) = weights {
            if w.len() != self.universes.len() {
                return Err(Error::Validation(format!(
                    "band '{}': got {} weights for {} universes",
                    self.name,
                    w.len(),
                    self.universes.len()
                )));
            }
        }

        if fill_cv {
            self.cv.fill(val, cvweight);
        }
        let cvbin = self.cv.find_bin(val);
        let n = self.cv.n_bins();
        let cv_low = self.cv.bin_low_edge(cvbin);
        let cv_high = self.cv.bin_upper_edge(cvbin);

        for (i, u) in self.universes.iter_mut().enumerate() {
            if is_not_physical_shift(shifts[i]) {
                continue;
            }
            let shift_val = val + shifts[i];
            let mut bin = cvbin;
            if shift_val < val && shift_val < cv_low && bin > 0 {
                // walk down; land in the underflow if nothing fits
                while bin != 0 {
                    if self.cv.bin_low_edge(bin) < shift_val {
                        break;
                    }
                    bin -= 1;
                }
            } else if shift_val > val && shift_val > cv_high && bin < n + 1 {
                // walk up; land in the overflow if nothing fits
                while bin != n + 1 {
                    if shift_val < self.cv.bin_upper_edge(bin) {
                        break;
                    }
                    bin += 1;
                }
            }

            let wgt = cvweight * weights.map_or(1.0, |w| w[i]);
            u.fill_bin(bin, wgt);
        }
        Ok(())
    }

    /// Two-universe convenience form of [`fill_shifted`](Self::fill_shifted).
    ///
    /// # Panics
    /// Panics if the band was not constructed with exactly 2 universes.
    pub fn fill_shifted_up_down(
        &mut self,
        val: f64,
        shift_down: f64,
        shift_up: f64,
        cvweight: f64,
        fill_cv: bool,
    ) {
        assert!(
            self.universes.len() == 2,
            "band '{}': 2-universe fill called with {} universes",
            self.name,
            self.universes.len()
        );
        let _ = self.fill_shifted(val, &[shift_down, shift_up], cvweight, fill_cv, None);
    }

    //------------------------------------------------------------------
    // Covariance
    //------------------------------------------------------------------

    /// Covariance matrix over all bins including under/overflow
    /// (dimension `n_bins + 2`).
    ///
    /// With `area_normalize` the estimate is taken over copies of the
    /// universes rescaled so each in-range integral matches the CV's
    /// (zero-integral universes stay unscaled); the band itself is not
    /// modified. With `as_frac` each element is divided by
    /// `CV[i] * CV[k]`, or set to 0 where either CV value is 0.
    pub fn calc_cov_mx(&self, area_normalize: bool, as_frac: bool) -> DMatrix<f64> {
        let scaled;
        let universes: &[Hist1D] = if area_normalize {
            let cv_area = self.cv.integral();
            scaled = self
                .universes
                .iter()
                .map(|u| {
                    let mut c = u.clone();
                    let area = c.integral();
                    if area != 0.0 {
                        c.scale(cv_area / area);
                    }
                    c
                })
                .collect::<Vec<_>>();
            &scaled
        } else {
            &self.universes
        };

        let n_total = self.cv.n_total_bins();
        let n_univ = universes.len();
        let mut covmx = DMatrix::<f64>::zeros(n_total, n_total);

        if self.use_spread_error {
            // per bin: all universe values plus the CV, sorted
            let mut bin_vals: Vec<Vec<f64>> = Vec::with_capacity(n_total);
            for i in 0..n_total {
                let mut vals = Vec::with_capacity(n_univ + 1);
                for (j, u) in universes.iter().enumerate() {
                    let v = u.bin_content(i);
                    if v.is_nan() {
                        log::warn!("band '{}': NaN in universe {j}, bin {i}; skipped", self.name);
                    } else {
                        vals.push(v);
                    }
                }
                vals.push(self.cv.bin_content(i));
                vals.sort_by(f64::total_cmp);
                bin_vals.push(vals);
            }

            // 1 universe: full spread. Under 10: half spread. Otherwise the
            // interquartile range converted to a sigma.
            let spread = |vals: &[f64]| -> f64 {
                if n_univ == 1 {
                    vals[vals.len() - 1] - vals[0]
                } else if n_univ < SPREAD_ERROR_DEFAULT_BELOW {
                    (vals[vals.len() - 1] - vals[0]) / 2.0
                } else {
                    interquartile_range(vals) * IQR_TO_SIGMA
                }
            };
            let spreads: Vec<f64> = bin_vals.iter().map(|v| spread(v)).collect();

            for i in 0..n_total {
                for k in i..n_total {
                    let c = spreads[i] * spreads[k];
                    covmx[(i, k)] = c;
                    covmx[(k, i)] = c;
                }
            }
        } else {
            let mean = self.mean_hist(universes);
            for u in universes {
                for i in 0..n_total {
                    let di = u.bin_content(i) - mean.bin_content(i);
                    for k in i..n_total {
                        let dk = u.bin_content(k) - mean.bin_content(k);
                        covmx[(i, k)] += di * dk;
                    }
                }
            }
            for i in 0..n_total {
                for k in i..n_total {
                    let c = covmx[(i, k)] / n_univ as f64;
                    covmx[(i, k)] = c;
                    covmx[(k, i)] = c;
                }
            }
        }

        if as_frac {
            for i in 0..n_total {
                for k in i..n_total {
                    let cv_i = self.cv.bin_content(i);
                    let cv_k = self.cv.bin_content(k);
                    let c = if cv_i != 0.0 && cv_k != 0.0 {
                        covmx[(i, k)] / (cv_i * cv_k)
                    } else {
                        0.0
                    };
                    covmx[(i, k)] = c;
                    covmx[(k, i)] = c;
                }
            }
        }

        covmx
    }

    /// Correlation matrix derived from [`calc_cov_mx`](Self::calc_cov_mx);
    /// 0 where either diagonal entry vanishes.
    pub fn calc_corr_mx(&self, area_normalize: bool) -> DMatrix<f64> {
        let covmx = self.calc_cov_mx(area_normalize, false);
        let size = covmx.nrows();
        let mut corrmx = DMatrix::<f64>::zeros(size, size);
        for i in 0..size {
            for k in 0..size {
                let d = covmx[(i, i)] * covmx[(k, k)];
                if d != 0.0 {
                    corrmx[(i, k)] = covmx[(i, k)] / d.sqrt();
                }
            }
        }
        corrmx
    }

    /// One-sigma error per bin (√ of the covariance diagonal) as a histogram
    /// with zero bin errors.
    pub fn get_error_band(&self, as_frac: bool, area_normalize: bool) -> Hist1D {
        let covmx = self.calc_cov_mx(area_normalize, as_frac);
        let mut err_band = self.cv.cloned_empty(self.name.clone());
        for i in 0..self.cv.n_total_bins() {
            let d = covmx[(i, i)];
            err_band.set_bin_content(i, if d > 0.0 { d.sqrt() } else { 0.0 });
            err_band.set_bin_error(i, 0.0);
        }
        err_band
    }

    /// Arithmetic mean of the universes when there is more than one,
    /// otherwise the CV.
    fn mean_hist(&self, universes: &[Hist1D]) -> Hist1D {
        if universes.len() <= 1 {
            return self.cv.clone();
        }
        let mut mean = self.cv.cloned_empty(format!("{}_mean", self.name));
        for u in universes {
            // identical binning by construction
            let _ = mean.add(u, 1.0);
        }
        mean.scale(1.0 / universes.len() as f64);
        mean
    }

    //------------------------------------------------------------------
    // Arithmetic propagation
    //------------------------------------------------------------------

    /// Scale the CV and every universe by `c`.
    pub fn scale(&mut self, c: f64) {
        self.cv.scale(c);
        for u in &mut self.universes {
            u.scale(c);
        }
    }

    /// Bin-width normalize the CV and every universe by `c / width`.
    pub fn scale_width(&mut self, c: f64) {
        self.cv.scale_width(c);
        for u in &mut self.universes {
            u.scale_width(c);
        }
    }

    /// `self += c * other` on the CV and pairwise on universes.
    pub fn add(&mut self, other: &UniverseSet, c: f64) -> Result<()> {
        self.check_universes(other, "add")?;
        self.cv.add(&other.cv, c)?;
        for (u, o) in self.universes.iter_mut().zip(&other.universes) {
            u.add(o, c)?;
        }
        Ok(())
    }

    /// Add the same histogram to the CV and every universe.
    pub fn add_single(&mut self, h: &Hist1D, c: f64) -> Result<()> {
        self.cv.add(h, c)?;
        for u in &mut self.universes {
            u.add(h, c)?;
        }
        Ok(())
    }

    /// `self *= other` on the CV and pairwise on universes.
    pub fn multiply(&mut self, other: &UniverseSet) -> Result<()> {
        self.check_universes(other, "multiply")?;
        self.cv.multiply(&other.cv)?;
        for (u, o) in self.universes.iter_mut().zip(&other.universes) {
            u.multiply(o)?;
        }
        Ok(())
    }

    /// Multiply the CV and every universe by the same histogram.
    pub fn multiply_single(&mut self, h: &Hist1D) -> Result<()> {
        self.cv.multiply(h)?;
        for u in &mut self.universes {
            u.multiply(h)?;
        }
        Ok(())
    }

    /// `self /= other` on the CV and pairwise on universes.
    pub fn divide(&mut self, other: &UniverseSet) -> Result<()> {
        self.check_universes(other, "divide")?;
        self.cv.divide(&other.cv)?;
        for (u, o) in self.universes.iter_mut().zip(&other.universes) {
            u.divide(o)?;
        }
        Ok(())
    }

    /// Divide the CV and every universe by the same histogram.
    pub fn divide_single(&mut self, h: &Hist1D) -> Result<()> {
        self.cv.divide(h)?;
        for u in &mut self.universes {
            u.divide(h)?;
        }
        Ok(())
    }

    /// Rebin the CV and every universe.
    pub fn rebin(&mut self, ngroup: usize) -> Result<()> {
        self.cv.rebin(ngroup)?;
        for u in &mut self.universes {
            u.rebin(ngroup)?;
        }
        Ok(())
    }

    /// Reset the CV and every universe; the universe count is kept.
    pub fn reset(&mut self) {
        self.cv.reset();
        for u in &mut self.universes {
            u.reset();
        }
    }

    fn check_universes(&self, other: &UniverseSet, op: &str) -> Result<()> {
        if self.universes.len() != other.universes.len() {
            return Err(Error::Validation(format!(
                "{op}: bands '{}' ({} universes) and '{}' ({} universes) are incompatible",
                self.name,
                self.universes.len(),
                other.name,
                other.universes.len()
            )));
        }
        Ok(())
    }
}
