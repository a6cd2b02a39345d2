//! J1850 decoder: VPW (Variable Pulse Width) framing (spec §4.8.5).
//!
//! Ground truth: `ripyl.protocol.j1850.j1850_vpw_decode`. A VPW bit is
//! encoded by pulse width and passive/active polarity rather than by a
//! fixed bit period: a short (64us) active pulse or long (128us) passive
//! pulse is a `1`, and vice versa for a `0`. A pulse wider than 163us ends
//! the frame (EOD); a pulse wider than 280us while still high is a break.
//!
//! Non-goal: In-Frame Response (IFR) bytes are not decoded — only the
//! primary frame (header, optional target/source, data, CRC-8).

use crate::bitops::j1850_crc8;
use crate::edge::Edge;
use crate::error::Result;
use crate::record::{Status, StreamRecord};
use crate::walker::EdgeSequence;

pub const STATUS_CRC_ERROR: Status = Status(Status::ERROR.0 + 1);
pub const STATUS_INVALID_FRAME: Status = Status(Status::ERROR.0 + 2);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct J1850Frame {
    pub priority: u8,
    pub msg_type: u8,
    pub target: Option<u8>,
    pub source: Option<u8>,
    pub data: Vec<u8>,
    pub crc: u8,
    pub crc_ok: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum J1850Record {
    Frame(J1850Frame),
    Break,
}

const SOF_MIN: f64 = 163.0e-6;
const SOF_MAX: f64 = 239.0e-6;
const EOD_MIN: f64 = 163.0e-6;
const BIT_MIN: f64 = 34.0e-6;
const SHORT_LONG_SPLIT: f64 = 96.0e-6;
const BREAK_MIN: f64 = 280.0e-6;
const DEFAULT_PULSE: f64 = 500.0e-6;

pub fn decode_j1850_vpw<I>(edges: I) -> Result<J1850Decoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let mut it = edges;
    let first = it.next();
    let start_time = first.map(|e| e.time).unwrap_or(0.0);
    let chained: Box<dyn Iterator<Item = Edge>> = match first {
        Some(e) => Box::new(std::iter::once(e).chain(it)),
        None => Box::new(std::iter::empty()),
    };
    Ok(J1850Decoder { walker: EdgeSequence::new(chained, start_time) })
}

pub struct J1850Decoder {
    walker: EdgeSequence<Box<dyn Iterator<Item = Edge>>>,
}

impl J1850Decoder {
    /// Duration until the next queued edge without moving the cursor there
    /// (`es.next_states[0] - es.cur_time` in the original), or a default
    /// guess if the stream holds at the current level indefinitely.
    fn peek_pulse_width(&self) -> f64 {
        match self.walker.peek_next_time() {
            Some(t) if t > self.walker.cur_time() => t - self.walker.cur_time(),
            _ => DEFAULT_PULSE,
        }
    }

    /// Collect VPW bits until end-of-data (a pulse wider than 163us).
    /// Returns `(bits, last_pulse_width)`. The caller must already be
    /// positioned at the start of the pulse train to classify.
    fn collect_bits(&mut self) -> (Vec<u8>, f64) {
        let mut bits = Vec::new();
        let mut is_passive = true;
        let mut pulse_width = self.peek_pulse_width();

        while pulse_width <= SOF_MAX {
            if pulse_width > BIT_MIN && pulse_width <= EOD_MIN {
                let bit = if pulse_width > SHORT_LONG_SPLIT {
                    if is_passive { 1 } else { 0 }
                } else if is_passive {
                    0
                } else {
                    1
                };
                bits.push(bit);
                is_passive = !is_passive;
            } else {
                break;
            }
            self.walker.advance_to_edge();
            pulse_width = self.peek_pulse_width();
        }
        (bits, pulse_width)
    }
}

impl Iterator for J1850Decoder {
    type Item = StreamRecord<J1850Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.walker.at_end() {
            self.walker.advance_to_edge();
            if self.walker.cur_state() != 1 {
                continue;
            }
            let frame_start = self.walker.cur_time();
            let pulse_width = self.peek_pulse_width();

            if !(pulse_width > SOF_MIN && pulse_width <= SOF_MAX) {
                if pulse_width > BREAK_MIN && self.walker.cur_state() == 1 {
                    return Some(StreamRecord::segment(
                        frame_start,
                        self.walker.cur_time(),
                        "J1850 frame",
                        Some(J1850Record::Break),
                        Status::WARNING,
                    ));
                }
                continue;
            }
            self.walker.advance_to_edge(); // move from SOF to the first bit

            let (frame_bits, pulse_width) = self.collect_bits();
            if pulse_width > BREAK_MIN && self.walker.cur_state() == 1 {
                return Some(StreamRecord::segment(
                    frame_start,
                    self.walker.cur_time(),
                    "J1850 frame",
                    Some(J1850Record::Break),
                    Status::WARNING,
                ));
            }

            if frame_bits.len() % 8 != 0 || frame_bits.len() < 2 * 8 {
                continue;
            }

            let mut bytes = Vec::with_capacity(frame_bits.len() / 8);
            for chunk in frame_bits.chunks(8) {
                let mut byte = 0u8;
                for &b in chunk {
                    byte = (byte << 1) | b;
                }
                bytes.push(byte);
            }

            let header_len = if bytes[0] & 0x10 != 0 { 1 } else { 3 };
            if header_len == 3 && bytes.len() < 4 {
                continue;
            }

            let priority = bytes[0] >> 5;
            let msg_type = bytes[0] & 0x0F;
            let (target, source) = if header_len == 3 { (Some(bytes[1]), Some(bytes[2])) } else { (None, None) };
            let data = bytes[header_len..bytes.len() - 1].to_vec();
            let crc = *bytes.last().unwrap();
            let expected_crc = j1850_crc8(&bytes[..bytes.len() - 1]);
            let crc_ok = crc == expected_crc;
            if !crc_ok {
                tracing::warn!(frame_start, "j1850 crc mismatch");
            }

            let end_time = self.walker.cur_time() + 64.0e-6;
            let status = if crc_ok { Status::OK } else { STATUS_CRC_ERROR };

            return Some(StreamRecord::segment(
                frame_start,
                end_time,
                "J1850 frame",
                Some(J1850Record::Frame(J1850Frame {
                    priority,
                    msg_type,
                    target,
                    source,
                    data,
                    crc,
                    crc_ok,
                })),
                status,
            ));
        }
        None
    }
}

/// Build a VPW edge stream for one frame body (header/target/source/data),
/// appending a freshly computed CRC-8 byte. `idle_gap` precedes the SOF.
pub fn vpw_synth(bytes: &[u8], idle_gap: f64) -> Vec<Edge> {
    let mut all_bytes = bytes.to_vec();
    all_bytes.push(j1850_crc8(bytes));
    vpw_synth_raw(&all_bytes, idle_gap)
}

/// Build a VPW edge stream for an exact sequence of on-wire bytes
/// (including whatever trailing CRC byte the caller chooses), for tests
/// that need to inject a deliberately wrong CRC.
pub fn vpw_synth_raw(all_bytes: &[u8], idle_gap: f64) -> Vec<Edge> {
    let mut edges = vec![Edge::new(0.0, 0)];
    let mut t = idle_gap;
    edges.push(Edge::new(t, 1));
    t += 200.0e-6; // SOF, within (163us, 239us]

    let mut is_passive = true;
    for &byte in &all_bytes {
        for i in (0..8).rev() {
            let bit = (byte >> i) & 1;
            let short = (bit == 1) == !is_passive;
            let width = if short { 64.0e-6 } else { 128.0e-6 };
            edges.push(Edge::new(t, 0));
            t += width;
            edges.push(Edge::new(t, 1));
            is_passive = !is_passive;
        }
    }
    t += 200.0e-6; // EOD idle, within (163us, 239us] gap before next SOF
    edges.push(Edge::new(t, 0));
    t += 1.0e-3;
    edges.push(Edge::new(t, 1));
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_functional_frame_with_valid_crc() {
        let bytes = [0x68u8, 0x6a, 0xf1, 0x01, 0x00];
        let edges = vpw_synth(&bytes, 2.0e-3);
        let decoder = decode_j1850_vpw(edges.into_iter()).unwrap();
        let records: Vec<_> = decoder.collect();
        let frame_record = records
            .into_iter()
            .find(|r| matches!(r.data.as_ref(), Some(J1850Record::Frame(_))))
            .expect("a frame record");
        match frame_record.data.as_ref().unwrap() {
            J1850Record::Frame(frame) => {
                assert_eq!(frame.priority, bytes[0] >> 5);
                assert_eq!(frame.msg_type, bytes[0] & 0x0F);
                assert_eq!(frame.target, Some(bytes[1]));
                assert_eq!(frame.source, Some(bytes[2]));
                assert_eq!(frame.data, vec![bytes[3], bytes[4]]);
                assert!(frame.crc_ok);
            }
            J1850Record::Break => panic!("expected a frame"),
        }
    }

    #[test]
    fn flags_a_corrupted_crc() {
        let bytes = [0x68u8, 0x6a, 0xf1, 0x01, 0x00];
        let mut all_bytes = bytes.to_vec();
        all_bytes.push(j1850_crc8(&bytes) ^ 0xFF);
        let edges = vpw_synth_raw(&all_bytes, 2.0e-3);
        let decoder = decode_j1850_vpw(edges.into_iter()).unwrap();
        let records: Vec<_> = decoder.collect();
        let frame_record = records
            .into_iter()
            .find(|r| matches!(r.data.as_ref(), Some(J1850Record::Frame(_))))
            .expect("a frame record");
        match frame_record.data.as_ref().unwrap() {
            J1850Record::Frame(frame) => {
                assert!(!frame.crc_ok);
                assert_eq!(frame_record.status, STATUS_CRC_ERROR);
            }
            J1850Record::Break => panic!("expected a frame"),
        }
    }
}
