//! Edge-to-sample synthesis and waveform shaping (spec §4.7).
//!
//! Ground truth: `ripyl.sigproc` (`edges_to_sample_stream`, `filter_waveform`,
//! `synth_wave`, `noisify`, `amplify`, `dropout`, `invert`, `sum_streams`).
//! These are the building blocks every protocol's `*_synth` function in
//! `protocol::*` composes to produce a realistic sample stream for testing
//! a decoder end to end.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::edge::Edge;
use crate::error::{DecodeError, Result};
use crate::sample::SampleChunk;

/// Render an edge stream to a sample stream at `sample_period`, holding
/// each level for its duration (`ripyl.sigproc.edges_to_sample_stream`,
/// pre band-limiting).
pub fn edges_to_sample_stream<I>(edges: I, sample_period: f64, logic: (f64, f64)) -> SampleChunk
where
    I: IntoIterator<Item = Edge>,
{
    let edges: Vec<Edge> = edges.into_iter().collect();
    if edges.is_empty() {
        return SampleChunk::new(0.0, sample_period, Vec::new());
    }

    let start_time = edges[0].time;
    let end_time = edges.last().unwrap().time;
    let total = ((end_time - start_time) / sample_period).ceil().max(1.0) as usize;

    let mut samples = Vec::with_capacity(total);
    let mut edge_ix = 0usize;
    let level_voltage = |level: i32| if level > 0 { logic.1 } else { logic.0 };
    let mut cur_level = edges[0].level;

    for i in 0..total {
        let t = start_time + sample_period * i as f64;
        while edge_ix + 1 < edges.len() && edges[edge_ix + 1].time <= t {
            edge_ix += 1;
            cur_level = edges[edge_ix].level;
        }
        samples.push(level_voltage(cur_level));
    }

    SampleChunk::new(start_time, sample_period, samples)
}

/// Kaiser-window FIR low-pass, applied in place to band-limit an edge
/// rendering to a realistic rise/fall time (`ripyl.sigproc.filter_waveform`).
///
/// `cutoff_freq` is normalized to `[0, 0.5]` (fraction of the sample rate).
pub fn filter_waveform(chunk: &SampleChunk, cutoff_freq: f64, transition_width: f64) -> Result<SampleChunk> {
    if !(0.0..0.5).contains(&cutoff_freq) {
        return Err(DecodeError::Stream("cutoff_freq must be in (0, 0.5)".into()));
    }

    let taps = kaiser_lowpass_taps(cutoff_freq, transition_width);
    let filtered = convolve_same(&chunk.samples, &taps);
    Ok(SampleChunk::new(chunk.start_time, chunk.sample_period, filtered))
}

fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x_sq = (x / 2.0) * (x / 2.0);
    for k in 1..25 {
        term *= half_x_sq / (k as f64 * k as f64);
        sum += term;
        if term < 1e-15 * sum {
            break;
        }
    }
    sum
}

fn kaiser_lowpass_taps(cutoff: f64, transition_width: f64) -> Vec<f64> {
    let atten_db = 60.0;
    let n = ((atten_db - 7.95) / (2.285 * 2.0 * std::f64::consts::PI * transition_width)).ceil() as usize;
    let n = n.max(4) | 1; // force odd length
    let beta = if atten_db > 50.0 {
        0.1102 * (atten_db - 8.7)
    } else if atten_db >= 21.0 {
        0.5842 * (atten_db - 21.0).powf(0.4) + 0.07886 * (atten_db - 21.0)
    } else {
        0.0
    };

    let m = (n - 1) as f64;
    let i0_beta = bessel_i0(beta);

    (0..n)
        .map(|i| {
            let x = i as f64 - m / 2.0;
            let sinc = if x == 0.0 {
                2.0 * cutoff
            } else {
                (2.0 * std::f64::consts::PI * cutoff * x).sin() / (std::f64::consts::PI * x)
            };
            let ratio = if m > 0.0 { (2.0 * i as f64 / m - 1.0).clamp(-1.0, 1.0) } else { 1.0 };
            let window = bessel_i0(beta * (1.0 - ratio * ratio).max(0.0).sqrt()) / i0_beta;
            sinc * window
        })
        .collect()
}

fn convolve_same(signal: &[f64], taps: &[f64]) -> Vec<f64> {
    let half = taps.len() / 2;
    let mut out = Vec::with_capacity(signal.len());
    for i in 0..signal.len() {
        let mut acc = 0.0;
        for (k, &tap) in taps.iter().enumerate() {
            let idx = i as isize + k as isize - half as isize;
            if idx >= 0 && (idx as usize) < signal.len() {
                acc += signal[idx as usize] * tap;
            }
        }
        out.push(acc);
    }
    out
}

/// Render an edge stream directly to a band-limited sample stream
/// (`ripyl.sigproc.synth_wave`): composition of [`edges_to_sample_stream`]
/// and [`filter_waveform`].
pub fn synth_wave<I>(edges: I, sample_period: f64, logic: (f64, f64), rise_time: f64) -> Result<SampleChunk>
where
    I: IntoIterator<Item = Edge>,
{
    let chunk = edges_to_sample_stream(edges, sample_period, logic);
    // An RC-style rise time maps to a normalized bandwidth of roughly
    // 0.35 / (rise_time / sample_period).
    let cutoff = (0.35 * sample_period / rise_time.max(sample_period)).min(0.45);
    filter_waveform(&chunk, cutoff, 0.2)
}

/// Add Gaussian noise with the given standard deviation (in the same units
/// as the sample values) to every sample (`ripyl.sigproc.noisify`).
pub fn noisify<R: Rng>(chunk: &SampleChunk, snr_db: f64, rng: &mut R) -> Result<SampleChunk> {
    let signal_power: f64 = chunk.samples.iter().map(|s| s * s).sum::<f64>() / chunk.samples.len().max(1) as f64;
    if signal_power <= 0.0 {
        return Err(DecodeError::NoVariation);
    }
    let noise_power = signal_power / 10f64.powf(snr_db / 10.0);
    let std = noise_power.sqrt();
    let normal = Normal::new(0.0, std).map_err(|e| DecodeError::Stream(e.to_string()))?;

    let noisy: Vec<f64> = chunk.samples.iter().map(|&s| s + normal.sample(rng)).collect();
    Ok(SampleChunk::new(chunk.start_time, chunk.sample_period, noisy))
}

/// Scale every sample by `gain` (`ripyl.sigproc.amplify`).
pub fn amplify(chunk: &SampleChunk, gain: f64) -> SampleChunk {
    SampleChunk::new(
        chunk.start_time,
        chunk.sample_period,
        chunk.samples.iter().map(|&s| s * gain).collect(),
    )
}

/// Zero out samples in `[start_time, end_time)`, simulating a dropped
/// connection or loss of signal (`ripyl.sigproc.dropout`).
pub fn dropout(chunk: &SampleChunk, start_time: f64, end_time: f64, level: f64) -> SampleChunk {
    let mut samples = chunk.samples.clone();
    for (i, s) in samples.iter_mut().enumerate() {
        let t = chunk.time_at(i);
        if t >= start_time && t < end_time {
            *s = level;
        }
    }
    SampleChunk::new(chunk.start_time, chunk.sample_period, samples)
}

/// Flip every edge's logic level (`ripyl.sigproc.invert`), used for
/// idle-high/idle-low polarity swaps.
pub fn invert<I>(edges: I) -> impl Iterator<Item = Edge>
where
    I: Iterator<Item = Edge>,
{
    edges.map(|e| Edge::new(e.time, if e.level > 0 { 0 } else { 1 }))
}

/// Sum two sample streams sample-for-sample, truncating to the shorter
/// (`ripyl.sigproc.sum_streams`). Used to mix a synthesized protocol signal
/// with a noise floor or an unrelated carrier.
pub fn sum_streams(a: &SampleChunk, b: &SampleChunk) -> SampleChunk {
    let n = a.samples.len().min(b.samples.len());
    let samples: Vec<f64> = (0..n).map(|i| a.samples[i] + b.samples[i]).collect();
    SampleChunk::new(a.start_time, a.sample_period, samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn renders_a_square_wave_at_the_right_levels() {
        let edges = vec![Edge::new(0.0, 0), Edge::new(5.0, 1), Edge::new(10.0, 0)];
        let chunk = edges_to_sample_stream(edges, 1.0, (0.0, 5.0));
        assert!(chunk.samples[0] < 1.0);
        assert!(chunk.samples[6] > 4.0);
    }

    #[test]
    fn amplify_scales_every_sample() {
        let chunk = SampleChunk::new(0.0, 1.0, vec![1.0, 2.0, 3.0]);
        let out = amplify(&chunk, 2.0);
        assert_eq!(out.samples, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn dropout_zeros_the_window() {
        let chunk = SampleChunk::new(0.0, 1.0, vec![5.0; 10]);
        let out = dropout(&chunk, 3.0, 6.0, 0.0);
        assert_eq!(out.samples[3], 0.0);
        assert_eq!(out.samples[5], 0.0);
        assert_eq!(out.samples[6], 5.0);
    }

    #[test]
    fn invert_flips_binary_levels() {
        let edges = vec![Edge::new(0.0, 0), Edge::new(1.0, 1)];
        let out: Vec<Edge> = invert(edges.into_iter()).collect();
        assert_eq!(out[0].level, 1);
        assert_eq!(out[1].level, 0);
    }

    #[test]
    fn noisify_changes_samples_deterministically_with_a_seeded_rng() {
        let chunk = SampleChunk::new(0.0, 1.0, vec![1.0; 100]);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let noisy = noisify(&chunk, 20.0, &mut rng).unwrap();
        assert_ne!(noisy.samples, chunk.samples);
    }
}
