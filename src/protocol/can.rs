//! CAN decoder: bit timing, bit-stuffing, CRC-15, error/overload frames
//! (spec §4.8.4).
//!
//! Ground truth: `ripyl.protocol.can`. There is a single differential bus
//! line (already collapsed to a binary dominant/recessive edge stream by
//! the caller); unlike SPI/I2C there is no separate clock, so — as with
//! UART — the bit period comes from auto-rate detection and the decoder
//! free-runs a fixed-period walker once it locks onto a start-of-frame.

use crate::bitops::can_crc15;
use crate::edge::{buffer_prefix, peek_start_time, DynEdges, Edge};
use crate::error::{DecodeError, Result};
use crate::rate::{check_symbol_rate, snap_to_standard, STANDARD_CAN_BAUDS};
use crate::record::{Status, StreamRecord};
use crate::walker::EdgeSequence;
use std::iter::Peekable;

pub const STATUS_CRC_ERROR: Status = Status(Status::ERROR.0 + 1);
pub const STATUS_STUFF_ERROR: Status = Status(Status::ERROR.0 + 2);
pub const STATUS_FORM_ERROR: Status = Status(Status::ERROR.0 + 3);

const AUTOBAUD_EDGES: usize = 50;
/// Fraction of the bit period at which the sample point falls (spec
/// §4.8.4: after `sync+prop+phase1` quanta; 0.75 is a common nominal
/// split with `phase2` the remaining quarter).
const SAMPLE_POINT: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
pub struct CanConfig {
    pub bit_rate: Option<u32>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self { bit_rate: None }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub rtr: bool,
    pub dlc: u8,
    pub data: Vec<u8>,
    pub crc: u16,
    pub crc_ok: bool,
    pub ack: bool,
    pub form_error: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum CanItem {
    Frame(CanFrame),
    ErrorFrame,
    OverloadFrame,
}

pub fn decode_can<I>(edges: I, config: CanConfig) -> Result<CanDecoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let mut boxed: DynEdges = Box::new(edges);
    let bit_rate = match config.bit_rate {
        Some(r) => r,
        None => {
            let (prefix, replay) = buffer_prefix(boxed, AUTOBAUD_EDGES);
            if prefix.len() < 2 {
                return Err(DecodeError::AutoRate);
            }
            let rate = check_symbol_rate(&prefix, 2, true)?;
            boxed = Box::new(replay);
            snap_to_standard(rate as f64, STANDARD_CAN_BAUDS)
        }
    };

    let (start_time, peeked) = peek_start_time(boxed);
    let mut walker = EdgeSequence::new(peeked, start_time);
    while !walker.at_end() && walker.cur_state() != 1 {
        walker.advance_to_edge();
    }

    Ok(CanDecoder {
        walker,
        bit_period: 1.0 / bit_rate as f64,
        just_finished_eof: false,
    })
}

pub struct CanDecoder {
    walker: EdgeSequence<Peekable<DynEdges>>,
    bit_period: f64,
    just_finished_eof: bool,
}

impl CanDecoder {
    fn read_bit(&mut self) -> i32 {
        self.walker.advance(self.bit_period * SAMPLE_POINT);
        let b = self.walker.cur_state();
        self.walker.advance(self.bit_period * (1.0 - SAMPLE_POINT));
        b
    }

    /// Destuff-aware field accumulator: pushes raw bits into `out`,
    /// dropping forced stuff bits and flagging a stuffing violation if a
    /// run of 6 identical bits appears where a stuff bit was due (spec
    /// §4.8.4 unstuffing; bit-stuffing applies SOF..CRC inclusive).
    fn read_stuffed_bit(&mut self, out: &mut Vec<u8>, run_bit: &mut i32, run_len: &mut u32) -> Result<()> {
        let raw = self.read_bit();
        if *run_len >= 5 {
            // This bit must be the forced stuff bit: opposite of the run.
            if raw == *run_bit {
                return Err(DecodeError::Stream("stuffing violation".into()));
            }
            *run_bit = raw;
            *run_len = 1;
            return Ok(());
        }
        if raw == *run_bit {
            *run_len += 1;
        } else {
            *run_bit = raw;
            *run_len = 1;
        }
        out.push(raw as u8);
        Ok(())
    }
}

fn bits_to_u32(bits: &[u8]) -> u32 {
    bits.iter().fold(0u32, |acc, &b| (acc << 1) | b as u32)
}

impl Iterator for CanDecoder {
    type Item = StreamRecord<CanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.walker.at_end() {
            return None;
        }

        // Every falling edge on an idle (recessive) line is a candidate SOF.
        self.walker.advance_to_edge();
        if self.walker.at_end() && self.walker.cur_state() != 0 {
            return None;
        }
        let start_time = self.walker.cur_time();

        // SOF is the first bit of the stuffed region.
        let mut destuffed: Vec<u8> = vec![0];
        let mut run_bit = 0i32;
        let mut run_len = 1u32;
        self.walker.advance(self.bit_period);

        let mut header_len: Option<usize> = None;
        let mut extended = false;
        let mut total_len: Option<usize> = None;

        loop {
            // `destuffed[0]` is SOF, `destuffed[1..12]` the 11-bit base ID,
            // `destuffed[12]` RTR/SRR, `destuffed[13]` IDE.
            if destuffed.len() >= 14 && header_len.is_none() {
                extended = destuffed[13] == 1;
                header_len = Some(if extended { 39 } else { 19 });
            }
            if let (Some(hlen), None) = (header_len, total_len) {
                if destuffed.len() >= hlen {
                    let dlc_bits = &destuffed[hlen - 4..hlen];
                    let dlc = bits_to_u32(dlc_bits).min(8) as usize;
                    total_len = Some(hlen + dlc * 8 + 15);
                }
            }
            if let Some(total) = total_len {
                if destuffed.len() >= total {
                    break;
                }
            }
            if destuffed.len() > 200 {
                // Runaway guard: something is structurally wrong, surface
                // as an error frame rather than looping forever.
                tracing::warn!(start_time, "can frame exceeded sane bit budget");
                self.just_finished_eof = false;
                return Some(StreamRecord::event(start_time, "CAN error frame", Some(CanItem::ErrorFrame), Status::ERROR));
            }
            if self.read_stuffed_bit(&mut destuffed, &mut run_bit, &mut run_len).is_err() {
                tracing::warn!(start_time, "can bit stuffing violation");
                let kind = if self.just_finished_eof { CanItem::OverloadFrame } else { CanItem::ErrorFrame };
                let name = if self.just_finished_eof { "CAN overload frame" } else { "CAN error frame" };
                self.just_finished_eof = false;
                // Resynchronize: skip to the next sustained recessive run.
                while !self.walker.at_end() && self.walker.cur_state() != 1 {
                    self.walker.advance_to_edge();
                }
                return Some(StreamRecord::event(start_time, name, Some(kind), Status::ERROR));
            }
        }

        let hlen = header_len.unwrap();
        let total = total_len.unwrap();
        let dlc = ((total - hlen - 15) / 8) as u8;

        let (id, rtr) = if extended {
            let id_base = bits_to_u32(&destuffed[1..12]);
            let id_ext = bits_to_u32(&destuffed[14..32]);
            let id = (id_base << 18) | id_ext;
            let rtr = destuffed[32] == 1;
            (id, rtr)
        } else {
            let id = bits_to_u32(&destuffed[1..12]);
            let rtr = destuffed[12] == 1;
            (id, rtr)
        };

        let data_bits = &destuffed[hlen..hlen + dlc as usize * 8];
        let data: Vec<u8> = data_bits.chunks(8).map(bits_to_u32).map(|b| b as u8).collect();

        let crc_region = &destuffed[0..hlen + dlc as usize * 8];
        let expected_crc = can_crc15(crc_region);
        let transmitted_crc = bits_to_u32(&destuffed[hlen + dlc as usize * 8..total]) as u16;
        let crc_ok = expected_crc == transmitted_crc;

        // Unstuffed trailer: CRC delimiter, ACK, ACK delimiter, 7-bit EOF.
        let crc_delim = self.read_bit();
        let ack = self.read_bit() == 0;
        let ack_delim = self.read_bit();
        let mut eof_ok = true;
        for _ in 0..7 {
            if self.read_bit() != 1 {
                eof_ok = false;
            }
        }
        let form_error = crc_delim != 1 || ack_delim != 1 || !eof_ok;
        self.just_finished_eof = true;

        if !crc_ok {
            tracing::warn!(id, "can crc mismatch");
        }

        let status = [
            if crc_ok { Status::OK } else { STATUS_CRC_ERROR },
            if form_error { STATUS_FORM_ERROR } else { Status::OK },
        ]
        .into_iter()
        .max()
        .unwrap();

        let frame = CanFrame {
            id,
            extended,
            rtr,
            dlc,
            data,
            crc: expected_crc,
            crc_ok,
            ack,
            form_error,
        };

        Some(StreamRecord::segment(start_time, self.walker.cur_time(), "CAN frame", Some(CanItem::Frame(frame)), status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_bits(id: u32, extended: bool, rtr: bool, data: &[u8]) -> Vec<u8> {
        let mut bits = vec![0u8]; // SOF
        if extended {
            for i in (0..11).rev() {
                bits.push(((id >> (18 + i)) & 1) as u8);
            }
            bits.push(1); // SRR
            bits.push(1); // IDE
            for i in (0..18).rev() {
                bits.push(((id >> i) & 1) as u8);
            }
            bits.push(rtr as u8);
            bits.push(0); // r1
            bits.push(0); // r0
        } else {
            for i in (0..11).rev() {
                bits.push(((id >> i) & 1) as u8);
            }
            bits.push(rtr as u8);
            bits.push(0); // IDE
            bits.push(0); // r0
        }
        for i in (0..4).rev() {
            bits.push(((data.len() as u8 >> i) & 1) as u8);
        }
        for &byte in data {
            for i in (0..8).rev() {
                bits.push((byte >> i) & 1);
            }
        }
        let header_len = bits.len();
        let crc = can_crc15(&bits);
        for i in (0..15).rev() {
            bits.push(((crc >> i) & 1) as u8);
        }
        let _ = header_len;
        bits
    }

    fn stuff(bits: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bits.len());
        let mut run_bit = bits[0];
        let mut run_len = 1u32;
        out.push(bits[0]);
        for &b in &bits[1..] {
            if run_len == 5 {
                out.push(1 - run_bit);
                run_bit = 1 - run_bit;
                run_len = 1;
            }
            out.push(b);
            if b == run_bit {
                run_len += 1;
            } else {
                run_bit = b;
                run_len = 1;
            }
        }
        out
    }

    fn bits_to_edges(bits: &[u8], bit_period: f64, trailer: &[u8]) -> Vec<Edge> {
        let mut edges = vec![Edge::new(0.0, 1)];
        let mut t = bit_period; // one idle bit before SOF
        let mut push = |edges: &mut Vec<Edge>, t: f64, level: i32| {
            if edges.last().map(|e| e.level) != Some(level) {
                edges.push(Edge::new(t, level));
            }
        };
        for &b in bits {
            push(&mut edges, t, b as i32);
            t += bit_period;
        }
        for &b in trailer {
            push(&mut edges, t, b as i32);
            t += bit_period;
        }
        push(&mut edges, t, 1);
        t += bit_period * 4.0;
        edges.push(Edge::new(t, 1));
        edges
    }

    #[test]
    fn decodes_a_standard_frame_round_trip() {
        let bit_period = 1e-6;
        let bits = encode_bits(0x123, false, false, &[0xDE, 0xAD]);
        let stuffed = stuff(&bits);
        let trailer = [1u8, 0, 1, 1, 1, 1, 1, 1, 1]; // crc delim, ack, ack delim, 7x EOF recessive
        let edges = bits_to_edges(&stuffed, bit_period, &trailer);
        let config = CanConfig {
            bit_rate: Some((1.0 / bit_period) as u32),
        };
        let decoder = decode_can(edges.into_iter(), config).unwrap();
        let records: Vec<_> = decoder.collect();
        let frame = match &records[0].data {
            Some(CanItem::Frame(f)) => f,
            _ => panic!("expected a frame"),
        };
        assert_eq!(frame.id, 0x123);
        assert_eq!(frame.dlc, 2);
        assert_eq!(frame.data, vec![0xDE, 0xAD]);
        assert!(frame.crc_ok);
        assert!(records[0].status.is_ok());
    }

    #[test]
    fn decodes_an_extended_frame() {
        let bit_period = 1e-6;
        let bits = encode_bits(0x1ABCDE, true, false, &[0x01]);
        let stuffed = stuff(&bits);
        let trailer = [1u8, 0, 1, 1, 1, 1, 1, 1, 1];
        let edges = bits_to_edges(&stuffed, bit_period, &trailer);
        let config = CanConfig {
            bit_rate: Some((1.0 / bit_period) as u32),
        };
        let decoder = decode_can(edges.into_iter(), config).unwrap();
        let records: Vec<_> = decoder.collect();
        let frame = match &records[0].data {
            Some(CanItem::Frame(f)) => f,
            _ => panic!("expected a frame"),
        };
        assert!(frame.extended);
        assert_eq!(frame.id, 0x1ABCDE);
        assert_eq!(frame.data, vec![0x01]);
    }
}
