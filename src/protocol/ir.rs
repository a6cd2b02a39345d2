//! Infrared remote-control decoders: NEC, RC-5, RC-6 (+RC6A), SIRC (spec
//! §4.8.5).
//!
//! Ground truth: `ripyl.protocol.infrared.*`. All four protocols ride on a
//! carrier-modulated burst/space envelope; [`demodulate`] strips the
//! sub-carrier (and passes an already-demodulated stream through
//! unchanged) so every protocol decoder below can work purely in terms of
//! burst/space durations. [`modulate`] is the inverse, used by the test
//! synthesizers.

use crate::bitops::join_bits;
use crate::edge::Edge;
use crate::error::Result;
use crate::record::{Status, StreamRecord};
use crate::walker::EdgeSequence;

pub const STATUS_CHECK_ERROR: Status = Status(Status::ERROR.0 + 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IrPolarity {
    IdleHigh,
    IdleLow,
}

fn normalize_polarity(edges: Vec<Edge>, polarity: IrPolarity) -> Vec<Edge> {
    match polarity {
        IrPolarity::IdleLow => edges,
        IrPolarity::IdleHigh => edges.into_iter().map(|e| Edge::new(e.time, 1 - e.level)).collect(),
    }
}

/// Strip a sub-carrier from a burst/space IR edge stream, collapsing each
/// run of on/off toggling within a burst into a single high period. An
/// already-demodulated (envelope-only) stream passes through unchanged,
/// since no gap in it will ever exceed one carrier period.
pub fn demodulate(edges: Vec<Edge>, carrier_freq: f64, polarity: IrPolarity) -> Vec<Edge> {
    let edges = normalize_polarity(edges, polarity);
    let mod_period = 1.0 / carrier_freq;
    if edges.is_empty() {
        return edges;
    }
    let start_time = edges[0].time;
    let mut walker = EdgeSequence::new(edges.into_iter(), start_time);
    let mut out = Vec::new();
    out.push(Edge::new(walker.cur_time(), walker.cur_state()));

    if walker.cur_state() == 0 {
        walker.advance_to_edge();
        out.push(Edge::new(walker.cur_time(), 1));
    }

    let mut prev_state = walker.cur_state();
    let mut last_gap = 0.0;
    while !walker.at_end() {
        let ts = walker.advance_to_edge();
        last_gap = ts;
        if ts > mod_period {
            if walker.cur_state() == 1 {
                out.push(Edge::new(walker.cur_time() - ts, 0));
                out.push(Edge::new(walker.cur_time(), 1));
            }
        }
        prev_state = walker.cur_state();
    }
    if prev_state == 0 {
        out.push(Edge::new(walker.cur_time() - last_gap, 0));
    }
    out.push(Edge::new(walker.cur_time(), walker.cur_state()));
    out
}

/// Re-modulate a burst/space envelope onto a sub-carrier, for building test
/// waveforms that exercise the demodulation step as well as framing.
pub fn modulate(edges: Vec<Edge>, carrier_freq: f64, duty_cycle: f64, polarity: IrPolarity) -> Vec<Edge> {
    let duty_cycle = duty_cycle.clamp(0.0, 1.0);
    let edges = normalize_polarity(edges, polarity);
    let mod_period = 1.0 / carrier_freq;
    let high_time = mod_period * duty_cycle;
    let low_time = mod_period * (1.0 - duty_cycle);
    if edges.is_empty() {
        return edges;
    }
    let start_time = edges[0].time;
    let mut walker = EdgeSequence::new(edges.into_iter(), start_time);
    let mut out = vec![Edge::new(walker.cur_time(), walker.cur_state())];

    while !walker.at_end() {
        walker.advance_to_edge();
        while walker.cur_state() == 1 {
            out.push(Edge::new(walker.cur_time(), 1));
            walker.advance(high_time);
            out.push(Edge::new(walker.cur_time(), 0));
            walker.advance(low_time);
        }
    }
    out.push(Edge::new(walker.cur_time(), walker.cur_state()));
    out
}

fn nearly(t: f64, expected: f64, epsilon: f64) -> bool {
    (t - expected).abs() < epsilon
}

fn at_least(t: f64, expected: f64, epsilon: f64) -> bool {
    t >= expected - epsilon
}

const IR_EPSILON: f64 = 30.0e-6;

// ---------------------------------------------------------------- NEC ----

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum NecFrame {
    Message { addr_low: u8, addr_high: u8, cmd: u8, cmd_inv: u8 },
    Repeat,
}

pub fn decode_nec<I>(edges: I, carrier_freq: f64) -> Result<NecDecoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let demod = demodulate(edges.collect(), carrier_freq, IrPolarity::IdleLow);
    let start_time = demod.first().map(|e| e.time).unwrap_or(0.0);
    Ok(NecDecoder { walker: EdgeSequence::new(demod.into_iter(), start_time) })
}

pub struct NecDecoder {
    walker: EdgeSequence<std::vec::IntoIter<Edge>>,
}

impl Iterator for NecDecoder {
    type Item = StreamRecord<NecFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.walker.at_end() {
            if self.walker.cur_state() == 0 {
                self.walker.advance_to_edge();
            }
            self.walker.advance_to_edge();
            let ts = self.walker.advance_to_edge();

            if !(nearly(ts, 2.25e-3, IR_EPSILON) || nearly(ts, 4.5e-3, IR_EPSILON)) {
                continue;
            }
            let msg_start_time = self.walker.cur_time() - ts - 9.0e-3;

            if at_least(ts, 4.5e-3, IR_EPSILON) {
                let mut bits = Vec::with_capacity(32);
                while bits.len() < 32 {
                    let bit_start = self.walker.cur_time();
                    let ts = self.walker.advance_to_edge();
                    if !nearly(ts, 560.0e-6, IR_EPSILON) {
                        break;
                    }
                    self.walker.advance_to_edge();
                    let bit_period = self.walker.cur_time() - bit_start;
                    if nearly(bit_period, 2.25e-3, IR_EPSILON) {
                        bits.push(1u8);
                    } else if nearly(bit_period, 1.12e-3, IR_EPSILON) {
                        bits.push(0u8);
                    } else {
                        break;
                    }
                }
                if bits.len() == 32 {
                    let ts = self.walker.advance_to_edge();
                    if nearly(ts, 560.0e-6, IR_EPSILON) {
                        let byte = |b: &[u8]| join_bits(&b.iter().rev().copied().collect::<Vec<_>>()) as u8;
                        let addr_low = byte(&bits[0..8]);
                        let addr_high = byte(&bits[8..16]);
                        let cmd = byte(&bits[16..24]);
                        let cmd_inv = byte(&bits[24..32]);
                        let ok = cmd == (!cmd_inv);
                        if !ok {
                            tracing::warn!(cmd, cmd_inv, "nec command check byte mismatch");
                        }
                        let status = if ok { Status::OK } else { STATUS_CHECK_ERROR };
                        return Some(StreamRecord::segment(
                            msg_start_time,
                            self.walker.cur_time(),
                            "NEC message",
                            Some(NecFrame::Message { addr_low, addr_high, cmd, cmd_inv }),
                            status,
                        ));
                    }
                }
            } else {
                let ts = self.walker.advance_to_edge();
                if nearly(ts, 560.0e-6, IR_EPSILON) {
                    return Some(StreamRecord::segment(
                        msg_start_time,
                        self.walker.cur_time(),
                        "NEC message",
                        Some(NecFrame::Repeat),
                        Status::OK,
                    ));
                }
            }
        }
        None
    }
}

/// Build a raw (unmodulated envelope) edge stream for one or more NEC
/// messages, for feeding through [`modulate`] in tests.
pub fn nec_synth(messages: &[NecFrame], message_interval: f64) -> Vec<Edge> {
    let mut t = 0.0;
    let mut out = vec![Edge::new(t, 0)];
    for msg in messages {
        out.push(Edge::new(t, 1));
        t += 9.0e-3;
        out.push(Edge::new(t, 0));
        match msg {
            NecFrame::Repeat => t += 2.25e-3,
            NecFrame::Message { addr_low, addr_high, cmd, cmd_inv } => {
                t += 4.5e-3;
                let mut bits = Vec::with_capacity(32);
                for byte in [addr_low, addr_high, cmd, cmd_inv] {
                    for i in (0..8).rev() {
                        bits.push((byte >> i) & 1);
                    }
                }
                for bit in bits {
                    out.push(Edge::new(t, 1));
                    t += 560.0e-6;
                    out.push(Edge::new(t, 0));
                    t += if bit == 1 { 2.25e-3 - 560.0e-6 } else { 1.12e-3 - 560.0e-6 };
                }
            }
        }
        out.push(Edge::new(t, 1));
        t += 560.0e-6;
        out.push(Edge::new(t, 0));
        t += message_interval;
    }
    out
}

// ---------------------------------------------------------------- RC-5 ----

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rc5Message {
    pub cmd: u8,
    pub addr: u8,
    pub toggle: u8,
}

const RC5_PULSE: f64 = 889.0e-6;

pub fn decode_rc5<I>(edges: I, carrier_freq: f64) -> Result<Rc5Decoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let demod = demodulate(edges.collect(), carrier_freq, IrPolarity::IdleLow);
    let start_time = demod.first().map(|e| e.time).unwrap_or(0.0);
    Ok(Rc5Decoder { walker: EdgeSequence::new(demod.into_iter(), start_time) })
}

pub struct Rc5Decoder {
    walker: EdgeSequence<std::vec::IntoIter<Edge>>,
}

impl Iterator for Rc5Decoder {
    type Item = StreamRecord<Rc5Message>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.walker.at_end() {
            if self.walker.cur_state() == 0 {
                self.walker.advance_to_edge();
            }
            let msg_start_time = self.walker.cur_time() - RC5_PULSE;

            self.walker.advance(RC5_PULSE / 2.0);
            if self.walker.cur_state() != 1 {
                continue;
            }

            let mut coded_bits = vec![0u8, 1u8];
            let mut same_count = 1;
            let mut prev_state = 1;
            loop {
                self.walker.advance(RC5_PULSE);
                let state = self.walker.cur_state() as u8;
                coded_bits.push(state);
                if state as i32 == prev_state {
                    same_count += 1;
                } else {
                    same_count = 1;
                }
                if same_count > 2 {
                    break;
                }
                prev_state = state as i32;
                if self.walker.at_end() {
                    break;
                }
            }
            let msg_end_time = self.walker.cur_time() - RC5_PULSE;

            if coded_bits.len() >= 14 * 2 {
                let msg_bits: Vec<u8> = coded_bits[1..28].iter().step_by(2).copied().collect();
                let toggle = msg_bits[2];
                let addr = join_bits(&msg_bits[3..8]) as u8;
                let mut cmd_bits = vec![if msg_bits[1] != 0 { 0 } else { 1 }];
                cmd_bits.extend_from_slice(&msg_bits[8..14]);
                let cmd = join_bits(&cmd_bits) as u8;
                return Some(StreamRecord::segment(
                    msg_start_time,
                    msg_end_time,
                    "RC-5 message",
                    Some(Rc5Message { cmd, addr, toggle }),
                    Status::OK,
                ));
            }
        }
        None
    }
}

// ---------------------------------------------------------------- RC-6 ----

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rc6Message {
    pub cmd: u8,
    pub addr: u8,
    pub toggle: u8,
    pub mode: u8,
    pub customer: Option<u16>,
}

const RC6_PULSE: f64 = 444.0e-6;

pub fn decode_rc6<I>(edges: I, carrier_freq: f64) -> Result<Rc6Decoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let demod = demodulate(edges.collect(), carrier_freq, IrPolarity::IdleLow);
    let start_time = demod.first().map(|e| e.time).unwrap_or(0.0);
    Ok(Rc6Decoder { walker: EdgeSequence::new(demod.into_iter(), start_time) })
}

pub struct Rc6Decoder {
    walker: EdgeSequence<std::vec::IntoIter<Edge>>,
}

impl Iterator for Rc6Decoder {
    type Item = StreamRecord<Rc6Message>;

    fn next(&mut self) -> Option<Self::Item> {
        'outer: while !self.walker.at_end() {
            if self.walker.cur_state() == 0 {
                self.walker.advance_to_edge();
            }
            let msg_start_time = self.walker.cur_time();

            let ts = self.walker.advance_to_edge();
            if !nearly(ts, 6.0 * RC6_PULSE, IR_EPSILON) {
                continue;
            }
            let ts = self.walker.advance_to_edge();
            if !nearly(ts, 2.0 * RC6_PULSE, IR_EPSILON) {
                continue;
            }

            self.walker.advance(RC6_PULSE / 2.0);
            if self.walker.cur_state() != 1 {
                continue;
            }
            self.walker.advance(RC6_PULSE);

            let mut coded_bits = vec![1u8, 0u8];
            let mut same_count = 1;
            let mut prev_state = 1;
            loop {
                self.walker.advance(RC6_PULSE);
                let state = self.walker.cur_state() as u8;
                coded_bits.push(state);
                if state as i32 == prev_state {
                    same_count += 1;
                } else {
                    same_count = 1;
                }
                if same_count > 3 {
                    break;
                }
                prev_state = state as i32;
                if self.walker.at_end() {
                    break;
                }
            }
            let msg_end_time = self.walker.cur_time() - 2.5 * RC6_PULSE;

            if coded_bits.len() < 22 * 2 {
                continue 'outer;
            }

            let half = |n: usize| -> Vec<u8> { coded_bits[0..n].iter().step_by(2).copied().collect() };
            let mut msg_bits = half(44);
            let mode = join_bits(&msg_bits[1..4]) as u8;
            let toggle = msg_bits[4];

            let (customer, asb) = if mode == 6 {
                if msg_bits.len() > 6 && msg_bits[6] != 0 {
                    msg_bits = half(76);
                    (Some(join_bits(&msg_bits[7..22]) as u16), 22)
                } else {
                    msg_bits = half(60);
                    (Some(join_bits(&msg_bits[7..14]) as u16), 14)
                }
            } else {
                (None, 6)
            };

            if msg_bits.len() < asb + 16 {
                continue 'outer;
            }
            let addr = join_bits(&msg_bits[asb..asb + 8]) as u8;
            let cmd = join_bits(&msg_bits[asb + 8..asb + 16]) as u8;

            return Some(StreamRecord::segment(
                msg_start_time,
                msg_end_time,
                "RC-6 message",
                Some(Rc6Message { cmd, addr, toggle, mode, customer }),
                Status::OK,
            ));
        }
        None
    }
}

// ---------------------------------------------------------------- SIRC ----

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SircMessage {
    pub cmd: u8,
    pub device: u8,
    pub extended: Option<u8>,
}

const SIRC_ONE_T: f64 = 600.0e-6;

pub fn decode_sirc<I>(edges: I, carrier_freq: f64) -> Result<SircDecoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let demod = demodulate(edges.collect(), carrier_freq, IrPolarity::IdleLow);
    let start_time = demod.first().map(|e| e.time).unwrap_or(0.0);
    Ok(SircDecoder { walker: EdgeSequence::new(demod.into_iter(), start_time) })
}

pub struct SircDecoder {
    walker: EdgeSequence<std::vec::IntoIter<Edge>>,
}

impl Iterator for SircDecoder {
    type Item = StreamRecord<SircMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.walker.at_end() {
            if self.walker.cur_state() == 0 {
                self.walker.advance_to_edge();
            }
            let ts = self.walker.advance_to_edge();
            if !nearly(ts, 4.0 * SIRC_ONE_T, IR_EPSILON) {
                continue;
            }
            let msg_start_time = self.walker.cur_time() - ts;

            let mut bits = Vec::new();
            loop {
                let ts = self.walker.advance_to_edge();
                if !nearly(ts, SIRC_ONE_T, IR_EPSILON) {
                    break;
                }
                let ts = self.walker.advance_to_edge();
                if nearly(ts, SIRC_ONE_T, IR_EPSILON) {
                    bits.push(0u8);
                } else if nearly(ts, 2.0 * SIRC_ONE_T, IR_EPSILON) {
                    bits.push(1u8);
                } else {
                    break;
                }
                if self.walker.at_end() {
                    break;
                }
            }

            if matches!(bits.len(), 12 | 15 | 20) {
                let rev = |s: &[u8]| -> Vec<u8> { s.iter().rev().copied().collect() };
                let cmd = join_bits(&rev(&bits[0..7])) as u8;
                let device = if bits.len() == 15 {
                    join_bits(&rev(&bits[7..15])) as u8
                } else {
                    join_bits(&rev(&bits[7..12])) as u8
                };
                let extended = if bits.len() == 20 { Some(join_bits(&rev(&bits[12..20])) as u8) } else { None };
                return Some(StreamRecord::segment(
                    msg_start_time,
                    self.walker.cur_time(),
                    "SIRC message",
                    Some(SircMessage { cmd, device, extended }),
                    Status::OK,
                ));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demodulate_passes_an_already_demodulated_stream_through() {
        let env = vec![Edge::new(0.0, 0), Edge::new(1.0e-3, 1), Edge::new(2.0e-3, 0), Edge::new(3.0e-3, 1)];
        let out = demodulate(env.clone(), 38.0e3, IrPolarity::IdleLow);
        assert_eq!(out.first().unwrap().level, 0);
        assert_eq!(out.last().unwrap().level, 1);
    }

    #[test]
    fn decodes_an_nec_command_message() {
        let carrier = 38.0e3;
        let msg = NecFrame::Message { addr_low: 0x00, addr_high: 0xFF, cmd: 0x12, cmd_inv: 0xED };
        let envelope = nec_synth(std::slice::from_ref(&msg), 42.5e-3);
        let modulated = modulate(envelope, carrier, 0.33, IrPolarity::IdleLow);
        let decoder = decode_nec(modulated.into_iter(), carrier).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert_eq!(frames.len(), 1);
        match frames[0].data.as_ref().unwrap() {
            NecFrame::Message { addr_low, addr_high, cmd, cmd_inv } => {
                assert_eq!(*addr_low, 0x00);
                assert_eq!(*addr_high, 0xFF);
                assert_eq!(*cmd, 0x12);
                assert_eq!(*cmd_inv, 0xED);
            }
            NecFrame::Repeat => panic!("expected a command message"),
        }
        assert!(frames[0].status.is_ok());
    }

    #[test]
    fn flags_an_nec_command_check_byte_mismatch() {
        let carrier = 38.0e3;
        let msg = NecFrame::Message { addr_low: 0x00, addr_high: 0xFF, cmd: 0x12, cmd_inv: 0x00 };
        let envelope = nec_synth(std::slice::from_ref(&msg), 42.5e-3);
        let modulated = modulate(envelope, carrier, 0.33, IrPolarity::IdleLow);
        let decoder = decode_nec(modulated.into_iter(), carrier).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert_eq!(frames[0].status, STATUS_CHECK_ERROR);
    }

    fn rc5_synth_envelope(msg: &Rc5Message) -> Vec<Edge> {
        let mut bits = vec![1u8, if msg.cmd & 0x40 != 0 { 0 } else { 1 }, msg.toggle];
        for i in (0..5).rev() {
            bits.push((msg.addr >> i) & 1);
        }
        for i in (0..6).rev() {
            bits.push((msg.cmd >> i) & 1);
        }
        let mut t = 0.0;
        let mut out = vec![Edge::new(t, 0)];
        let mut prev = 0;
        for b in bits {
            let pair = if b != 0 { [1u8, 0u8] } else { [0u8, 1u8] };
            for lvl in pair {
                if lvl != prev {
                    out.push(Edge::new(t, lvl as i32));
                }
                t += RC5_PULSE;
                prev = lvl;
            }
        }
        if prev == 1 {
            out.push(Edge::new(t, 0));
        }
        out.push(Edge::new(t + 1.0e-3, 0));
        out
    }

    #[test]
    fn decodes_an_rc5_message() {
        let carrier = 36.0e3;
        let msg = Rc5Message { cmd: 0x15, addr: 0x05, toggle: 1 };
        let envelope = rc5_synth_envelope(&msg);
        let modulated = modulate(envelope, carrier, 0.33, IrPolarity::IdleLow);
        let decoder = decode_rc5(modulated.into_iter(), carrier).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert_eq!(frames.len(), 1);
        let decoded = frames[0].data.as_ref().unwrap();
        assert_eq!(decoded.addr, 0x05);
        assert_eq!(decoded.toggle, 1);
        assert_eq!(decoded.cmd & 0x3F, 0x15 & 0x3F);
    }

    fn sirc_synth_envelope(cmd: u8, device: u8) -> Vec<Edge> {
        let mut t = 0.0;
        let mut out = vec![Edge::new(t, 1)];
        t += 4.0 * SIRC_ONE_T;
        out.push(Edge::new(t, 0));
        let mut bits = Vec::new();
        for i in (0..7).rev() {
            bits.push((cmd >> i) & 1);
        }
        for i in (0..5).rev() {
            bits.push((device >> i) & 1);
        }
        for b in bits {
            out.push(Edge::new(t, 1));
            t += SIRC_ONE_T;
            out.push(Edge::new(t, 0));
            t += if b == 1 { 2.0 * SIRC_ONE_T } else { SIRC_ONE_T };
        }
        out.push(Edge::new(t + 1.0e-3, 0));
        out
    }

    #[test]
    fn decodes_a_sirc_twelve_bit_message() {
        let carrier = 40.0e3;
        let envelope = sirc_synth_envelope(0x21, 0x05);
        let modulated = modulate(envelope, carrier, 0.33, IrPolarity::IdleLow);
        let decoder = decode_sirc(modulated.into_iter(), carrier).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert_eq!(frames.len(), 1);
        let decoded = frames[0].data.as_ref().unwrap();
        assert_eq!(decoded.cmd, 0x21);
        assert_eq!(decoded.device, 0x05);
        assert!(decoded.extended.is_none());
    }
}
