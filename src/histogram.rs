//! Histogram & peak finder (spec §4.1).
//!
//! Ground truth: `ripyl.decode.gen_histogram` / `find_hist_peaks` /
//! `find_bot_top_hist_peaks`. `scipy.stats.gaussian_kde` is reimplemented
//! here as a direct Gaussian-kernel sum — adequate for the buffer sizes
//! this crate ever builds a KDE over (a few thousand samples, see
//! [`crate::levels`]), and it keeps the dependency stack free of a full
//! numerical-computing crate for a single primitive.

use crate::error::{DecodeError, Result};
use crate::stats::OnlineStats;

/// A Gaussian KDE over a 1-D sample population.
///
/// `bw_method` plays the same role as scipy's `gaussian_kde(..., bw_method=...)`
/// scalar form: the kernel bandwidth is `bw_method * sample_std(data)`.
pub struct Kde {
    samples: Vec<f64>,
    bandwidth: f64,
}

impl Kde {
    pub fn new(samples: &[f64], bw_method: f64) -> Result<Self> {
        let mut os = OnlineStats::new();
        os.accumulate_all(samples.iter().copied());
        let std = os.std(1);
        if std <= 0.0 || !std.is_finite() {
            return Err(DecodeError::NoVariation);
        }
        Ok(Self {
            samples: samples.to_vec(),
            bandwidth: bw_method * std,
        })
    }

    /// Evaluate the (unnormalized-by-1000, matching the Python scaling used
    /// for histogram display) density at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        let h = self.bandwidth;
        let n = self.samples.len() as f64;
        let norm = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * h);
        let sum: f64 = self
            .samples
            .iter()
            .map(|&xi| {
                let z = (x - xi) / h;
                (-0.5 * z * z).exp()
            })
            .sum();
        norm * sum / n
    }

    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }
}

/// Build a histogram using either normal binning or a KDE approximation.
///
/// Returns `(hist, bin_centers)`. Mirrors `ripyl.decode.gen_histogram`.
pub fn gen_histogram(raw_samples: &[f64], bins: usize, use_kde: bool, kde_bw: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    if !use_kde {
        let min = raw_samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = raw_samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !(max > min) {
            return Err(DecodeError::NoVariation);
        }
        let step = (max - min) / bins as f64;
        let mut hist = vec![0.0f64; bins];
        let mut bin_centers = vec![0.0f64; bins];
        for (i, center) in bin_centers.iter_mut().enumerate() {
            *center = min + step * (i as f64 + 0.5);
        }
        for &s in raw_samples {
            let mut idx = ((s - min) / step) as isize;
            if idx < 0 {
                idx = 0;
            }
            if idx as usize >= bins {
                idx = bins as isize - 1;
            }
            hist[idx as usize] += 1.0;
        }
        Ok((hist, bin_centers))
    } else {
        let kde = Kde::new(raw_samples, kde_bw)?;
        let min = raw_samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = raw_samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let r = max - min;
        let lo = min - r * 0.1;
        let hi = max + r * 0.1;
        let step = (hi - lo) / bins as f64;
        let bin_centers: Vec<f64> = (0..bins).map(|i| lo + step * i as f64).collect();
        let hist: Vec<f64> = bin_centers.iter().map(|&x| 1000.0 * kde.eval(x)).collect();
        Ok((hist, bin_centers))
    }
}

/// Find all statistically significant peaks in a histogram (spec §4.1 step 1-6).
///
/// `thresh_scale` lets callers (e.g. noiseless synthetic data) lower the
/// classification threshold below the default of 1.0.
pub fn find_hist_peaks(hist: &[f64], thresh_scale: f64) -> Vec<(usize, usize)> {
    let pop_bins: Vec<f64> = hist.iter().copied().filter(|&b| b > 0.0).collect();
    if pop_bins.is_empty() {
        return Vec::new();
    }

    let mut os = OnlineStats::new();
    os.accumulate_all(pop_bins.iter().copied());
    let pop_mean = os.mean();

    let t1 = pop_mean + 2.0 * pop_mean.sqrt();

    let mut os2 = OnlineStats::new();
    os2.accumulate_all(pop_bins.iter().copied().filter(|&b| b < t1));
    let t2 = pop_mean + thresh_scale * 2.0 * os2.std(1);

    const NEED_PEAK: u8 = 1;
    const IN_PEAK: u8 = 2;

    let mut state = NEED_PEAK;
    let mut peaks: Vec<(usize, usize)> = Vec::new();
    let mut peak_start = 0usize;

    for (i, &b) in hist.iter().enumerate() {
        match state {
            NEED_PEAK => {
                if b >= t2 {
                    peak_start = i;
                    state = IN_PEAK;
                }
            }
            _ => {
                if b < t2 {
                    peaks.push((peak_start, i));
                    state = NEED_PEAK;
                }
            }
        }
    }
    if state == IN_PEAK && peak_start == hist.len().saturating_sub(1) {
        peaks.push((peak_start, peak_start));
    }

    let merge_gap = hist.len() as f64 / 100.0;
    let suppress_gap = hist.len() as f64 / 50.0;

    // Merge adjacent peaks whose gap is below merge_gap.
    let mut merged: Vec<bool> = vec![false; peaks.len()];
    for i in 0..peaks.len().saturating_sub(1) {
        let gap = (peaks[i + 1].0 as f64) - (peaks[i].1 as f64);
        if gap < merge_gap {
            peaks[i + 1].0 = peaks[i].0;
            merged[i] = true;
        }
    }
    let merged_peaks: Vec<(usize, usize)> = peaks
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !merged[*i])
        .map(|(_, p)| p)
        .collect();

    // Suppress the smaller of two peaks whose gap is below suppress_gap.
    let mut suppressed: Vec<bool> = vec![false; merged_peaks.len()];
    for i in 0..merged_peaks.len().saturating_sub(1) {
        let gap = (merged_peaks[i + 1].0 as f64) - (merged_peaks[i].1 as f64);
        if gap < suppress_gap {
            let width_l = merged_peaks[i].1 - merged_peaks[i].0;
            let width_r = merged_peaks[i + 1].1 - merged_peaks[i + 1].0;
            if width_l > width_r {
                suppressed[i + 1] = true;
            } else {
                suppressed[i] = true;
            }
        }
    }

    merged_peaks
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !suppressed[*i])
        .map(|(_, p)| p)
        .collect()
}

/// Find the bottom and top peaks (leftmost/rightmost of the largest two) in
/// a histogram of sample magnitudes. Returns `None` if fewer than two
/// peaks are found even after splitting the histogram in half and retrying
/// on each side.
pub fn find_bot_top_hist_peaks(raw_samples: &[f64], bins: usize, use_kde: bool, kde_bw: f64) -> Result<Option<(f64, f64)>> {
    let (hist, bin_centers) = gen_histogram(raw_samples, bins, use_kde, kde_bw)?;

    let mut peaks = find_hist_peaks(&hist, 1.0);

    if peaks.len() < 2 {
        let half = hist.len() / 2;
        let l_peaks = find_hist_peaks(&hist[..half], 1.0);
        let r_peaks = find_hist_peaks(&hist[half..], 1.0);
        if !l_peaks.is_empty() && !r_peaks.is_empty() {
            let mut combined = l_peaks;
            combined.extend(r_peaks.into_iter().map(|(s, e)| (s + half, e + half)));
            peaks = combined;
        }
    }

    if peaks.len() < 2 {
        return Ok(None);
    }

    let end_peaks = [peaks[0], peaks[peaks.len() - 1]];
    let mut bot_top = Vec::with_capacity(2);
    for (start, end) in end_peaks {
        let hslice = &hist[start..=end];
        let total: f64 = hslice.iter().sum();
        let mid_pop = (total / 2.0).floor();
        let mut cum = 0.0;
        let mut mid_ix = 0usize;
        for (i, &s) in hslice.iter().enumerate() {
            cum += s;
            if cum >= mid_pop {
                mid_ix = i;
                break;
            }
        }
        bot_top.push(bin_centers[start + mid_ix]);
    }
    bot_top.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Ok(Some((bot_top[0], bot_top[1])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bimodal_samples() -> Vec<f64> {
        // Two clusters around 0.0 and 3.3, with small jitter — representative
        // of a logic-low/logic-high voltage population.
        let mut v = Vec::new();
        for i in 0..500 {
            let jitter = (i as f64 * 0.017).sin() * 0.03;
            v.push(0.1 + jitter);
        }
        for i in 0..500 {
            let jitter = (i as f64 * 0.013).cos() * 0.03;
            v.push(3.3 + jitter);
        }
        v
    }

    #[test]
    fn finds_two_peaks_in_bimodal_population() {
        let samples = bimodal_samples();
        let (low, high) = find_bot_top_hist_peaks(&samples, 100, true, 0.05)
            .unwrap()
            .expect("two peaks");
        assert!(low < 1.0, "low peak was {low}");
        assert!(high > 2.5, "high peak was {high}");
    }

    #[test]
    fn constant_samples_have_no_variation() {
        let samples = vec![1.0; 200];
        let err = gen_histogram(&samples, 50, true, 0.05).unwrap_err();
        assert_eq!(err, DecodeError::NoVariation);
    }
}
