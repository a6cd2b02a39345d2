//! End-to-end pipeline scenarios from spec.md §8: synthesize a waveform,
//! band-limit it, add noise, and decode it back through the full
//! samples -> edges -> frames path, matching the exact byte sequences and
//! statuses the spec names for the concrete test scenarios.

use protodecode::detect::find_edges;
use protodecode::edge::Edge;
use protodecode::protocol::uart::{decode_uart, Parity, Polarity, UartConfig};
use protodecode::rate::find_symbol_rate;
use protodecode::synth::{noisify, synth_wave};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn uart_byte_edges(bytes: &[u8], baud: u32) -> Vec<Edge> {
    let t = 1.0 / baud as f64;
    let mut edges = vec![Edge::new(0.0, 1)];
    let mut time = 0.0;
    let mut push = |edges: &mut Vec<Edge>, time: f64, level: i32| {
        if edges.last().map(|e: &Edge| e.level) != Some(level) {
            edges.push(Edge::new(time, level));
        }
    };
    for &byte in bytes {
        push(&mut edges, time, 0); // start bit
        time += t;
        for i in 0..8 {
            push(&mut edges, time, ((byte >> i) & 1) as i32);
            time += t;
        }
        push(&mut edges, time, 1); // stop bit
        time += t;
    }
    time += t * 4.0; // trailing idle so the last frame's walker isn't starved
    edges.push(Edge::new(time, 1));
    edges
}

/// spec.md §8: `"Hello, world!"` at 115200 baud, 8-N-1, idle-high, sampled
/// at 11.52 MHz (100x oversampling), 30 dB SNR noise added. Expects 13
/// frames of the exact ASCII bytes, all `Ok`.
#[test]
fn hello_world_round_trips_through_noisy_samples() {
    let message = b"Hello, world!";
    let baud = 115_200u32;
    let bit_period = 1.0 / baud as f64;
    let edges = uart_byte_edges(message, baud);

    let sample_period = bit_period / 100.0;
    let logic = (0.0, 3.3);
    let clean = synth_wave(edges, sample_period, logic, bit_period * 0.05).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let noisy = noisify(&clean, 30.0, &mut rng).unwrap();

    let detected = find_edges(std::iter::once(noisy), logic, 0.4);
    let config = UartConfig {
        bits: 8,
        parity: Parity::None,
        stop_bits: 1.0,
        lsb_first: true,
        polarity: Polarity::IdleHigh,
        baud: Some(baud),
    };
    let decoder = decode_uart(detected, config).unwrap();
    let frames: Vec<_> = decoder.collect();

    assert_eq!(frames.len(), message.len());
    let decoded: Vec<u8> = frames.iter().map(|f| f.data.as_ref().unwrap().data as u8).collect();
    assert_eq!(decoded, message.to_vec());
    for frame in &frames {
        assert!(frame.status.is_ok(), "frame status should be Ok, got {:?}", frame.status);
    }
}

/// spec.md §8 property 5: symbol-rate inversion from a known period must
/// be within 1% relative error.
#[test]
fn symbol_rate_inversion_within_one_percent() {
    let baud = 57_600u32;
    let bit_period = 1.0 / baud as f64;
    let mut edges = vec![Edge::new(0.0, 1)];
    let mut t = 0.0;
    let mut level = 1;
    for _ in 0..400 {
        t += bit_period;
        level = 1 - level;
        edges.push(Edge::new(t, level));
    }
    let rate = find_symbol_rate(&edges, 2, true).unwrap();
    let rel_err = (rate as f64 - baud as f64).abs() / baud as f64;
    assert!(rel_err < 0.01, "rate {rate} too far from {baud} (rel err {rel_err})");
}

/// spec.md §8: auto-baud from 50 random UART frames at 57600 baud with no
/// baud argument supplied should snap to 57600.
#[test]
fn auto_baud_snaps_to_standard_rate() {
    let baud = 57_600u32;
    let mut all = vec![Edge::new(0.0, 1)];
    let mut t = 0.0;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    use rand::Rng;
    for _ in 0..50 {
        let byte: u8 = rng.gen();
        let frame = uart_byte_edges(&[byte], baud);
        for e in frame {
            if e.time == 0.0 && e.level == 1 {
                continue;
            }
            all.push(Edge::new(t + e.time, e.level));
        }
        t += 11.0 / baud as f64 + 2.0 / baud as f64;
    }
    let config = UartConfig::default();
    let decoder = decode_uart(all.into_iter(), config).unwrap();
    assert_eq!(decoder.baud(), baud);
}
