//! Auto-calibration of logic levels (spec §4.2).
//!
//! Ground truth: `ripyl.decode.find_logic_levels` / `check_logic_levels`.
//! The Python original tees a sample iterator three ways and streams
//! through a bounded ring buffer; here we collect the bounded prefix (at
//! most `max_samples`, the same bound the original imposes) into memory up
//! front and operate on slices, which is simpler and holds to the same
//! memory discipline spec §5 calls out as an explicit exception for this
//! component.

use crate::error::{DecodeError, Result};
use crate::histogram::{find_bot_top_hist_peaks, find_hist_peaks};
use crate::sample::{flatten_samples, SampleChunk};

const NOISE_FILT_SIZE: usize = 3;
const MVAVG_SIZE: usize = 10;
const DELAY_SAMPLES: usize = 100;

fn causal_moving_average(data: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(data.len());
    for i in 0..data.len() {
        let start = i.saturating_sub(window - 1);
        let slice = &data[start..=i];
        out.push(slice.iter().sum::<f64>() / slice.len() as f64);
    }
    out
}

/// One-sided autocorrelation (lags `0..n`), used as a fallback indicator of
/// periodic activity when the simple noise/edge-threshold test finds
/// nothing (spec §4.2 step 2).
fn autocorrelation(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut out = vec![0.0; n];
    for lag in 0..n {
        let mut sum = 0.0;
        for i in 0..(n - lag) {
            sum += x[i] * x[i + lag];
        }
        out[lag] = sum;
    }
    out
}

/// Determine the `(low, high)` logic levels of a digital signal by
/// buffering up to `max_samples` while searching for a representative
/// edge transition.
///
/// Returns `Ok(None)` if no edge-like activity could be found in the
/// buffered window, or if the resulting buffer's histogram doesn't
/// resolve to two peaks.
pub fn find_logic_levels<I>(samples: I, max_samples: usize, buf_size: usize) -> Result<Option<(f64, f64)>>
where
    I: Iterator<Item = SampleChunk>,
{
    let max_samples = max_samples.max(2 * buf_size);
    let values: Vec<f64> = flatten_samples(samples)
        .take(max_samples + DELAY_SAMPLES + MVAVG_SIZE)
        .map(|(_, v)| v)
        .collect();

    if values.is_empty() {
        return Ok(None);
    }

    let et_buf_size = (buf_size / 10).max(1).min(values.len());
    let et_samples = &values[..et_buf_size];

    let noise_filtered = causal_moving_average(et_samples, NOISE_FILT_SIZE);
    let et_mvavg = causal_moving_average(et_samples, MVAVG_SIZE);

    let mvavg_diff: Vec<f64> = noise_filtered
        .iter()
        .zip(et_mvavg.iter())
        .map(|(a, b)| (a - b).abs())
        .collect();

    let skip = MVAVG_SIZE / 2 - 1;
    let noise_diff: Vec<f64> = if et_mvavg.len() > skip {
        noise_filtered
            .iter()
            .zip(et_mvavg[skip..].iter())
            .map(|(a, b)| (a - b).abs())
            .collect()
    } else {
        Vec::new()
    };
    let noise_threshold = noise_diff.iter().cloned().fold(0.0, f64::max) * 1.5;
    let max_mvavg_diff = mvavg_diff.iter().cloned().fold(0.0, f64::max);
    let edges_present = max_mvavg_diff > noise_threshold;

    let mut acorr_edges_present = false;
    if !edges_present {
        let mean = noise_filtered.iter().sum::<f64>() / noise_filtered.len() as f64;
        let normalized: Vec<f64> = noise_filtered.iter().map(|v| v - mean).collect();
        let auto_corr = autocorrelation(&normalized);
        let ac_max = auto_corr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if ac_max > 0.0 {
            let norm_ac: Vec<f64> = auto_corr.iter().map(|v| v / ac_max * 1000.0).collect();
            let ac_peaks = find_hist_peaks(&norm_ac, 1.0);
            if ac_peaks.len() > 1 {
                let (s, e) = ac_peaks[1];
                let p1_max = norm_ac[s..=e].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if p1_max > 500.0 {
                    acorr_edges_present = true;
                }
            }
        }
    }

    let edge_threshold = if edges_present || acorr_edges_present {
        max_mvavg_diff * 0.6
    } else {
        max_mvavg_diff * 5.0
    }
    .max(1.0e-9);

    let buf: Vec<f64> = if acorr_edges_present {
        values.iter().copied().take(buf_size).collect()
    } else {
        let mut rolling: Vec<f64> = Vec::with_capacity(buf_size);
        let mut mvavg_buf: Vec<f64> = Vec::with_capacity(MVAVG_SIZE);
        let mut dly_buf: Vec<f64> = Vec::with_capacity(MVAVG_SIZE);
        let mut found_edge_at: Option<usize> = None;

        let scan_limit = max_samples.saturating_sub(buf_size).min(values.len());
        for sc in 0..scan_limit {
            if sc + DELAY_SAMPLES >= values.len() {
                break;
            }
            let ns = values[sc];
            rolling.push(ns);
            if rolling.len() > buf_size {
                rolling.remove(0);
            }

            mvavg_buf.push(ns);
            if mvavg_buf.len() > MVAVG_SIZE {
                mvavg_buf.remove(0);
            }
            let mvavg = mvavg_buf.iter().sum::<f64>() / mvavg_buf.len() as f64;

            dly_buf.push(values[sc + DELAY_SAMPLES]);
            if dly_buf.len() > MVAVG_SIZE {
                dly_buf.remove(0);
            }
            let mvavg_dly = dly_buf.iter().sum::<f64>() / dly_buf.len() as f64;

            if (mvavg_dly - mvavg).abs() > edge_threshold {
                found_edge_at = Some(sc);
                break;
            }
        }

        match found_edge_at {
            None => return Ok(None),
            Some(edge_pos) => {
                let buf_remaining = if rolling.len() < buf_size / 2 {
                    buf_size - rolling.len()
                } else {
                    buf_size / 2
                };
                let mut remaining = buf_remaining;
                let mut pos = edge_pos + 1;
                while remaining > 0 && rolling.len() < buf_size && pos < values.len() {
                    rolling.push(values[pos]);
                    pos += 1;
                    remaining -= 1;
                }
                rolling
            }
        }
    };

    if buf.is_empty() {
        return Ok(None);
    }

    find_bot_top_hist_peaks(&buf, 100, true, 0.05)
}

/// Wrapper for [`find_logic_levels`] that raises [`DecodeError::AutoLevel`]
/// on failure instead of returning `None` (`ripyl.decode.check_logic_levels`).
pub fn check_logic_levels<I>(samples: I, max_samples: usize, buf_size: usize) -> Result<(f64, f64)>
where
    I: Iterator<Item = SampleChunk>,
{
    find_logic_levels(samples, max_samples, buf_size)?.ok_or(DecodeError::AutoLevel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleChunk;

    fn square_wave_chunk(period_samples: usize, total: usize, low: f64, high: f64) -> SampleChunk {
        let samples: Vec<f64> = (0..total)
            .map(|i| if (i / period_samples) % 2 == 0 { low } else { high })
            .collect();
        SampleChunk::new(0.0, 1e-6, samples)
    }

    #[test]
    fn finds_levels_of_a_clean_square_wave() {
        let chunk = square_wave_chunk(50, 6000, 0.0, 3.3);
        let levels = find_logic_levels(std::iter::once(chunk), 4000, 2000)
            .unwrap()
            .expect("levels found");
        assert!(levels.0 < 1.0);
        assert!(levels.1 > 2.5);
    }

    #[test]
    fn returns_none_for_flat_signal() {
        let chunk = SampleChunk::new(0.0, 1e-6, vec![1.0; 6000]);
        let levels = find_logic_levels(std::iter::once(chunk), 4000, 2000).unwrap();
        assert!(levels.is_none());
    }
}
