//! 1D binned accumulator: per-bin content and variance, with flow bins.

use mu_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A dense 1D histogram with explicit under/overflow bins.
///
/// In-range bins are `1..=n`; bin `0` is the underflow and bin `n+1` the
/// overflow. `content` and `sumw2` always have length `n + 2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hist1D {
    name: String,
    /// Sorted bin edges, length `n + 1`.
    edges: Vec<f64>,
    /// Sum of weights per bin, length `n + 2`.
    content: Vec<f64>,
    /// Sum of squared weights per bin, length `n + 2`.
    sumw2: Vec<f64>,
    entries: u64,
}

impl Hist1D {
    /// Create an empty histogram from sorted bin edges.
    pub fn new(name: impl Into<String>, edges: Vec<f64>) -> Result<Self> {
        if edges.len() < 2 {
            return Err(Error::Validation("need at least 2 bin edges".to_string()));
        }
        if edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Validation("bin edges must be strictly increasing".to_string()));
        }
        if edges.iter().any(|e| !e.is_finite()) {
            return Err(Error::Validation("bin edges must be finite".to_string()));
        }
        let n_total = edges.len() + 1;
        Ok(Self {
            name: name.into(),
            edges,
            content: vec![0.0; n_total],
            sumw2: vec![0.0; n_total],
            entries: 0,
        })
    }

    /// Create an empty histogram with `n_bins` uniform bins on `[lo, hi)`.
    pub fn with_uniform_bins(name: impl Into<String>, n_bins: usize, lo: f64, hi: f64) -> Result<Self> {
        if n_bins == 0 {
            return Err(Error::Validation("n_bins must be > 0".to_string()));
        }
        if !(lo < hi) {
            return Err(Error::Validation("lo must be < hi".to_string()));
        }
        let w = (hi - lo) / n_bins as f64;
        let edges = (0..=n_bins).map(|i| lo + w * i as f64).collect();
        Self::new(name, edges)
    }

    /// Histogram name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the histogram.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Number of in-range bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Number of bins including under/overflow (`n_bins + 2`).
    pub fn n_total_bins(&self) -> usize {
        self.n_bins() + 2
    }

    /// Bin edges (length `n_bins + 1`).
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of fill calls recorded.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// True if `other` has identical bin edges.
    pub fn same_binning(&self, other: &Hist1D) -> bool {
        self.edges == other.edges
    }

    /// Lower edge of `bin`. Underflow has no finite lower edge.
    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        let n = self.n_bins();
        if bin == 0 {
            f64::NEG_INFINITY
        } else if bin <= n {
            self.edges[bin - 1]
        } else {
            self.edges[n]
        }
    }

    /// Upper edge of `bin`. Overflow has no finite upper edge.
    pub fn bin_upper_edge(&self, bin: usize) -> f64 {
        let n = self.n_bins();
        if bin == 0 {
            self.edges[0]
        } else if bin <= n {
            self.edges[bin]
        } else {
            f64::INFINITY
        }
    }

    /// Width of in-range `bin`; flow bins report the width of the nearest
    /// in-range bin.
    pub fn bin_width(&self, bin: usize) -> f64 {
        let n = self.n_bins();
        let bin = bin.clamp(1, n);
        self.edges[bin] - self.edges[bin - 1]
    }

    /// Locate the bin for `val`: `0` for underflow, `n_bins + 1` for
    /// overflow (NaN lands in the overflow).
    pub fn find_bin(&self, val: f64) -> usize {
        let n = self.n_bins();
        if val < self.edges[0] {
            return 0;
        }
        if !(val < self.edges[n]) {
            return n + 1;
        }
        // partition_point: first edge > val; edges[i-1] <= val < edges[i]
        self.edges.partition_point(|e| *e <= val)
    }

    /// Fill with `weight` at `val`; returns the bin filled.
    pub fn fill(&mut self, val: f64, weight: f64) -> usize {
        let bin = self.find_bin(val);
        self.content[bin] += weight;
        self.sumw2[bin] += weight * weight;
        self.entries += 1;
        bin
    }

    /// Add `weight` to `bin`, accumulating its variance in quadrature.
    pub fn fill_bin(&mut self, bin: usize, weight: f64) {
        self.content[bin] += weight;
        self.sumw2[bin] += weight * weight;
        self.entries += 1;
    }

    /// Content of `bin` (0 out of range).
    pub fn bin_content(&self, bin: usize) -> f64 {
        self.content.get(bin).copied().unwrap_or(0.0)
    }

    /// Set the content of `bin` without touching its variance.
    pub fn set_bin_content(&mut self, bin: usize, value: f64) {
        if let Some(c) = self.content.get_mut(bin) {
            *c = value;
        }
    }

    /// Add to the content of `bin` without touching its variance.
    pub fn add_bin_content(&mut self, bin: usize, delta: f64) {
        if let Some(c) = self.content.get_mut(bin) {
            *c += delta;
        }
    }

    /// Error (√variance) of `bin`.
    pub fn bin_error(&self, bin: usize) -> f64 {
        self.sumw2.get(bin).map(|v| v.max(0.0).sqrt()).unwrap_or(0.0)
    }

    /// Set the error of `bin` (stored squared).
    pub fn set_bin_error(&mut self, bin: usize, err: f64) {
        if let Some(v) = self.sumw2.get_mut(bin) {
            *v = err * err;
        }
    }

    /// Sum of in-range bin contents.
    pub fn integral(&self) -> f64 {
        let n = self.n_bins();
        self.content[1..=n].iter().sum()
    }

    /// Sum of all bin contents including under/overflow.
    pub fn integral_with_flows(&self) -> f64 {
        self.content.iter().sum()
    }

    /// Scale every bin by `c` (variances by `c²`).
    pub fn scale(&mut self, c: f64) {
        for v in &mut self.content {
            *v *= c;
        }
        for v in &mut self.sumw2 {
            *v *= c * c;
        }
    }

    /// Scale each in-range bin by `c / bin_width`, the usual bin-width
    /// normalization. Flow bins have no width and are left alone.
    pub fn scale_width(&mut self, c: f64) {
        let n = self.n_bins();
        for bin in 1..=n {
            let f = c / self.bin_width(bin);
            self.content[bin] *= f;
            self.sumw2[bin] *= f * f;
        }
    }

    /// `self += c * other`, propagating variances.
    pub fn add(&mut self, other: &Hist1D, c: f64) -> Result<()> {
        self.check_binning(other, "add")?;
        for bin in 0..self.content.len() {
            self.content[bin] += c * other.content[bin];
            self.sumw2[bin] += c * c * other.sumw2[bin];
        }
        self.entries += other.entries;
        Ok(())
    }

    /// `self *= other` bin by bin, with first-order error propagation.
    pub fn multiply(&mut self, other: &Hist1D) -> Result<()> {
        self.check_binning(other, "multiply")?;
        for bin in 0..self.content.len() {
            let a = self.content[bin];
            let b = other.content[bin];
            self.sumw2[bin] = self.sumw2[bin] * b * b + other.sumw2[bin] * a * a;
            self.content[bin] = a * b;
        }
        Ok(())
    }

    /// `self /= other` bin by bin, with first-order error propagation.
    /// Bins where the denominator is 0 become 0 with 0 error.
    pub fn divide(&mut self, other: &Hist1D) -> Result<()> {
        self.check_binning(other, "divide")?;
        for bin in 0..self.content.len() {
            let a = self.content[bin];
            let b = other.content[bin];
            if b == 0.0 {
                self.content[bin] = 0.0;
                self.sumw2[bin] = 0.0;
            } else {
                let b2 = b * b;
                self.sumw2[bin] = (self.sumw2[bin] * b2 + other.sumw2[bin] * a * a) / (b2 * b2);
                self.content[bin] = a / b;
            }
        }
        Ok(())
    }

    /// Merge groups of `ngroup` adjacent in-range bins. When `ngroup` does
    /// not divide the bin count, the trailing remainder bins are folded into
    /// the overflow.
    pub fn rebin(&mut self, ngroup: usize) -> Result<()> {
        let n = self.n_bins();
        if ngroup == 0 || ngroup > n {
            return Err(Error::Validation(format!(
                "cannot rebin {} bins by group of {}",
                n, ngroup
            )));
        }
        let n_new = n / ngroup;
        let n_merged = n_new * ngroup;

        let mut edges = Vec::with_capacity(n_new + 1);
        for i in (0..=n_merged).step_by(ngroup) {
            edges.push(self.edges[i]);
        }

        let mut content = vec![0.0; n_new + 2];
        let mut sumw2 = vec![0.0; n_new + 2];
        content[0] = self.content[0];
        sumw2[0] = self.sumw2[0];
        for old in 1..=n_merged {
            let new = (old - 1) / ngroup + 1;
            content[new] += self.content[old];
            sumw2[new] += self.sumw2[old];
        }
        // remainder bins and the old overflow land in the new overflow
        for old in (n_merged + 1)..=(n + 1) {
            content[n_new + 1] += self.content[old];
            sumw2[n_new + 1] += self.sumw2[old];
        }

        self.edges = edges;
        self.content = content;
        self.sumw2 = sumw2;
        Ok(())
    }

    /// Zero all contents, variances and the entry counter; binning is kept.
    pub fn reset(&mut self) {
        self.content.iter_mut().for_each(|v| *v = 0.0);
        self.sumw2.iter_mut().for_each(|v| *v = 0.0);
        self.entries = 0;
    }

    /// A reset copy of `self` under a new name.
    pub fn cloned_empty(&self, name: impl Into<String>) -> Hist1D {
        let mut h = self.clone();
        h.set_name(name);
        h.reset();
        h
    }

    fn check_binning(&self, other: &Hist1D, op: &str) -> Result<()> {
        if !self.same_binning(other) {
            return Err(Error::Validation(format!(
                "{}: binning mismatch between '{}' and '{}'",
                op, self.name, other.name
            )));
        }
        Ok(())
    }
}
