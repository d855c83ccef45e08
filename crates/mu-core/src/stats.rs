//! Spread statistics and fill-protocol sentinels.

/// Shift value meaning "do not fill this universe for this event".
///
/// A lateral fill compares each per-universe shift against this sentinel and
/// leaves the universe untouched on a match.
pub const NOT_PHYSICAL_SHIFT: f64 = -12345678.87654321;

/// Conversion from an interquartile range to a Gaussian sigma.
pub const IQR_TO_SIGMA: f64 = 1.0 / 1.34896;

/// True if `shift` agrees with [`NOT_PHYSICAL_SHIFT`] to 6 decimals.
pub fn is_not_physical_shift(shift: f64) -> bool {
    (shift - NOT_PHYSICAL_SHIFT).abs() < 1e-6
}

/// Quantile of a sorted slice with linear interpolation (type 7).
///
/// `p` is clamped to `[0, 1]`. Returns 0 for an empty slice.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let p = p.clamp(0.0, 1.0);
    let h = p * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Interquartile range (q75 - q25) of a sorted slice.
pub fn interquartile_range(sorted: &[f64]) -> f64 {
    quantile(sorted, 0.75) - quantile(sorted, 0.25)
}
