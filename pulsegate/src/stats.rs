// pulsegate/src/stats.rs
//
// Population statistics used by every worker. All helpers return 0.0 on
// empty input or a zero mean, never NaN.

pub fn mean(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    vals.iter().sum::<f64>() / vals.len() as f64
}

pub fn std_dev(vals: &[f64]) -> f64 {
    if vals.len() < 2 {
        return 0.0;
    }
    let m = mean(vals);
    (vals.iter().map(|v| (v - m).powi(2)).sum::<f64>() / vals.len() as f64).sqrt()
}

/// (mean, coefficient of variation)
pub fn mean_and_cv(vals: &[f64]) -> (f64, f64) {
    let m = mean(vals);
    if m == 0.0 || !m.is_finite() {
        return (0.0, 0.0);
    }
    (m, std_dev(vals) / m)
}

pub fn range(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    let (lo, hi) = vals.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    hi - lo
}

/// Clamp to [lo, hi], mapping NaN to `lo`.
pub fn clamp_finite(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_nan() { lo } else { v.clamp(lo, hi) }
}

/// 0.0–1.0 → 0–100, rounded.
pub fn to_percent(v: f64) -> u8 {
    (clamp_finite(v, 0.0, 1.0) * 100.0).round() as u8
}
