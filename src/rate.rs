//! Symbol-rate estimator (spec §4.5).
//!
//! Ground truth: `ripyl.decode.find_symbol_rate`. Inter-edge spans are
//! turned into a fundamental spectrum via KDE, then combined with
//! time-compressed copies of itself (the Harmonic Product Spectrum) to
//! recover a fundamental baud rate even when low-order harmonics are weak.

use crate::edge::Edge;
use crate::error::{DecodeError, Result};
use crate::histogram::Kde;

const SPECTRUM_POINTS: usize = 1000;

/// Standard UART baud rates, nearest-match snapping table
/// (`ripyl.protocol.uart`).
pub const STANDARD_UART_BAUDS: &[u32] = &[
    110, 300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 28800, 38400, 57600, 115200, 230400,
    460800, 921600,
];

/// Standard CAN bit rates, nearest-match snapping table
/// (`ripyl.protocol.can`).
pub const STANDARD_CAN_BAUDS: &[u32] = &[10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000];

/// Snap `rate` to the nearest entry in `table`, by relative (not absolute)
/// distance, the way callers of §4.5 are expected to (spec.md §4.5 closing
/// note).
pub fn snap_to_standard(rate: f64, table: &[u32]) -> u32 {
    table
        .iter()
        .copied()
        .min_by(|&a, &b| {
            let da = (rate - a as f64).abs() / a as f64;
            let db = (rate - b as f64).abs() / b as f64;
            da.partial_cmp(&db).unwrap()
        })
        .unwrap_or(rate.round() as u32)
}

fn inter_edge_spans(edges: &[Edge]) -> Vec<f64> {
    edges.windows(2).map(|w| w[1].time - w[0].time).filter(|&s| s > 0.0).collect()
}

/// Automatic upper span limit: KDE-smooth the span population with a wide
/// bandwidth and clip to twice the first peak's right edge (spec §4.5 step 2).
fn auto_span_limit(spans: &[f64], max_span: f64) -> Result<f64> {
    let kde = Kde::new(spans, 0.2)?;
    let step = max_span / SPECTRUM_POINTS as f64;
    let xs: Vec<f64> = (0..SPECTRUM_POINTS).map(|i| step * i as f64).collect();
    let ys = kde.eval_many(&xs);

    let peak_thresh = ys.iter().cloned().fold(0.0, f64::max) * 0.1;
    let mut right_edge = max_span;
    let mut in_peak = false;
    for (i, &y) in ys.iter().enumerate() {
        if y >= peak_thresh && !in_peak {
            in_peak = true;
        } else if y < peak_thresh && in_peak {
            right_edge = xs[i];
            break;
        }
    }
    Ok((right_edge * 2.0).min(max_span))
}

fn find_spectrum_peaks(spectrum: &[f64]) -> Vec<(usize, usize)> {
    crate::histogram::find_hist_peaks(spectrum, 1.0)
}

fn peak_centroid(spectrum: &[f64], xs: &[f64], peak: (usize, usize)) -> f64 {
    let (start, end) = peak;
    let slice = &spectrum[start..=end];
    let total: f64 = slice.iter().sum();
    if total <= 0.0 {
        return xs[start];
    }
    let weighted: f64 = slice.iter().zip(xs[start..=end].iter()).map(|(&s, &x)| s * x).sum();
    weighted / total
}

/// Estimate the fundamental baud rate of an edge stream using a Harmonic
/// Product Spectrum over inter-edge spans (spec §4.5).
///
/// `spectra` is the number of harmonics folded into the product (`2` is the
/// usual default; callers retry with `1` if that yields `0`). Returns `0`
/// (not an error) when no reliable fundamental can be isolated, matching
/// `ripyl`'s convention of returning `0` on failure so callers can retry
/// with different parameters.
pub fn find_symbol_rate(edges: &[Edge], spectra: usize, auto_span_limit_enabled: bool) -> Result<u32> {
    let spans = inter_edge_spans(edges);
    if spans.len() < 2 {
        return Ok(0);
    }

    let raw_max = spans.iter().cloned().fold(0.0, f64::max);
    if raw_max <= 0.0 {
        return Ok(0);
    }

    let max_span = if auto_span_limit_enabled {
        auto_span_limit(&spans, raw_max)?
    } else {
        raw_max
    };
    if max_span <= 0.0 {
        return Ok(0);
    }

    let upper = max_span * 1.1;
    let step = upper / SPECTRUM_POINTS as f64;
    let xs: Vec<f64> = (0..SPECTRUM_POINTS).map(|i| step * i as f64).collect();

    let kde = Kde::new(&spans, 0.05)?;
    let h1 = kde.eval_many(&xs);

    let mut hps = h1.clone();
    for k in 2..=spectra.max(1) {
        let compressed_xs: Vec<f64> = xs.iter().map(|&x| x * k as f64).collect();
        let hk = kde.eval_many(&compressed_xs);
        for (p, &v) in hps.iter_mut().zip(hk.iter()) {
            *p *= v;
        }
    }

    let hps_peaks = find_spectrum_peaks(&hps);
    if hps_peaks.is_empty() {
        return Ok(0);
    }
    let leftmost = hps_peaks[0];
    let x_star = peak_centroid(&hps, &xs, leftmost);
    if x_star <= 0.0 {
        return Ok(0);
    }

    let h1_peaks = find_spectrum_peaks(&h1);
    let hps_peak_height = hps[leftmost.0..=leftmost.1].iter().cloned().fold(0.0, f64::max);
    let h1_peak_height = h1_peaks
        .iter()
        .map(|&(s, e)| h1[s..=e].iter().cloned().fold(0.0, f64::max))
        .fold(0.0, f64::max);

    if h1_peak_height > 0.0 && hps_peak_height < h1_peak_height / 1000.0 {
        return Ok(0);
    }

    let third = x_star / 3.0;
    for &(s, e) in &h1_peaks {
        let c = peak_centroid(&h1, &xs, (s, e));
        if c > 0.0 && ((c - third).abs() / third) < 0.01 {
            return Ok(0);
        }
    }

    Ok((1.0 / x_star).round() as u32)
}

/// Like [`find_symbol_rate`] but raises [`DecodeError::AutoRate`] when the
/// rate cannot be determined, instead of returning `0`.
pub fn check_symbol_rate(edges: &[Edge], spectra: usize, auto_span_limit_enabled: bool) -> Result<u32> {
    match find_symbol_rate(edges, spectra, auto_span_limit_enabled)? {
        0 => Err(DecodeError::AutoRate),
        rate => Ok(rate),
    }
}
