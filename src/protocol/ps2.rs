//! PS/2 decoder: host/device frame arbitration over clk+data (spec §4.8.5).
//!
//! Ground truth: `ripyl.protocol.ps2`. PS/2 has no fixed bit period; the
//! device drives `clk` and both sides sample `data` on clk edges. A
//! device-to-host frame is 10 bits (start, 8 data LSB-first, parity, stop)
//! captured on clk falling edges; a host-to-device frame is 10.5 bits
//! (the extra half being a host-driven ack bit) captured on clk rising
//! edges until the data bits are in, then on the following falling edge.

use std::collections::HashMap;

use crate::edge::Edge;
use crate::error::Result;
use crate::record::{Status, StreamRecord};
use crate::walker::MultiEdgeSequence;

pub const STATUS_FRAMING_ERROR: Status = Status(Status::ERROR.0 + 1);
pub const STATUS_PARITY_ERROR: Status = Status(Status::ERROR.0 + 2);
pub const STATUS_ACK_ERROR: Status = Status(Status::ERROR.0 + 3);
pub const STATUS_TIMING_ERROR: Status = Status(Status::ERROR.0 + 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Ps2Dir {
    DeviceToHost,
    HostToDevice,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Ps2Frame {
    pub data: u8,
    pub direction: Ps2Dir,
    pub parity_error: bool,
    pub framing_error: bool,
    /// Only meaningful for `HostToDevice` frames.
    pub ack_error: bool,
    pub timing_error: bool,
}

/// Minimum PS/2 clock rate is 10kHz; anything slower than half that period
/// between clk edges is flagged as a timing error.
const MIN_PERIOD: f64 = 1.0 / 10.0e3 * 1.05;
const RESYNCH_GAP: f64 = 100.0e-6;

pub fn decode_ps2<ClkI, DataI>(clk: ClkI, data: DataI) -> Result<Ps2Decoder>
where
    ClkI: Iterator<Item = Edge> + 'static,
    DataI: Iterator<Item = Edge> + 'static,
{
    let mut channels: HashMap<String, Box<dyn Iterator<Item = Edge>>> = HashMap::new();
    channels.insert("clk".to_string(), Box::new(clk));
    channels.insert("data".to_string(), Box::new(data));
    let walker = MultiEdgeSequence::new(channels, 0.0);
    Ok(Ps2Decoder {
        walker,
        find_frame_start: true,
        direction: Ps2Dir::DeviceToHost,
        bits_remaining: 10,
        bits: Vec::new(),
        get_ack: false,
        timing_error: false,
        start_time: 0.0,
    })
}

pub struct Ps2Decoder {
    walker: MultiEdgeSequence<Box<dyn Iterator<Item = Edge>>>,
    find_frame_start: bool,
    direction: Ps2Dir,
    bits_remaining: u8,
    bits: Vec<i32>,
    get_ack: bool,
    timing_error: bool,
    start_time: f64,
}

impl Iterator for Ps2Decoder {
    type Item = StreamRecord<Ps2Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.walker.at_end("clk") {
                return None;
            }
            let ts = self.walker.advance_to_edge(Some("clk"));
            if self.walker.at_end("clk") {
                return None;
            }

            let clk_val = self.walker.cur_state("clk").unwrap_or(1);
            let d_val = self.walker.cur_state("data").unwrap_or(1);

            if ts > RESYNCH_GAP && !self.find_frame_start {
                // Framing error: resynchronize on the next frame start.
                self.find_frame_start = true;
                self.bits.clear();
                tracing::warn!(time = self.walker.cur_time(), "ps2 resynch");
            }

            if self.find_frame_start {
                if d_val == 0 {
                    self.bits_remaining = 10;
                    self.bits.clear();
                    self.start_time = self.walker.cur_time();
                    self.timing_error = false;
                    if clk_val == 0 {
                        self.direction = Ps2Dir::DeviceToHost;
                        self.find_frame_start = false;
                    } else if clk_val == 1 && ts > RESYNCH_GAP {
                        self.direction = Ps2Dir::HostToDevice;
                        self.find_frame_start = false;
                        self.get_ack = false;
                    }
                }
                continue;
            }

            if ts > MIN_PERIOD / 2.0 {
                self.timing_error = true;
            }

            let mut byte_complete = false;

            match self.direction {
                Ps2Dir::DeviceToHost => {
                    if clk_val == 0 {
                        if self.bits_remaining > 0 {
                            self.bits.push(d_val);
                            self.bits_remaining -= 1;
                        }
                        if self.bits_remaining == 0 {
                            byte_complete = true;
                        }
                    }
                }
                Ps2Dir::HostToDevice => {
                    if clk_val == 1 && !self.get_ack {
                        if self.bits_remaining > 0 {
                            self.bits.push(d_val);
                            self.bits_remaining -= 1;
                        }
                        if self.bits_remaining == 0 {
                            self.get_ack = true;
                        }
                    } else if clk_val == 0 && self.get_ack {
                        self.bits.push(d_val);
                        byte_complete = true;
                        if d_val == 0 {
                            self.walker.advance_to_edge(Some("data"));
                        }
                    }
                }
            }

            if byte_complete {
                let end_time = self.walker.cur_time();
                let frame = self.build_frame(end_time);
                self.find_frame_start = true;
                self.bits.clear();
                let status = [
                    if frame.framing_error { STATUS_FRAMING_ERROR } else { Status::OK },
                    if frame.parity_error { STATUS_PARITY_ERROR } else { Status::OK },
                    if frame.ack_error { STATUS_ACK_ERROR } else { Status::OK },
                    if frame.timing_error { STATUS_TIMING_ERROR } else { Status::OK },
                ]
                .into_iter()
                .max()
                .unwrap();
                return Some(StreamRecord::segment(self.start_time, end_time, "PS/2 frame", Some(frame), status));
            }
        }
    }
}

impl Ps2Decoder {
    fn build_frame(&self, _end_time: f64) -> Ps2Frame {
        let data = {
            let mut byte = 0u8;
            for (i, &b) in self.bits[0..8].iter().enumerate() {
                byte |= (b as u8) << i;
            }
            byte
        };
        let mut parity = 1u8;
        for &b in &self.bits[0..8] {
            parity ^= b as u8;
        }
        let parity_error = parity != self.bits[8] as u8;
        let framing_error = self.bits[9] != 1; // missing stop bit
        let ack_error = matches!(self.direction, Ps2Dir::HostToDevice) && self.bits[10] != 0;

        Ps2Frame {
            data,
            direction: self.direction,
            parity_error,
            framing_error,
            ack_error,
            timing_error: self.timing_error,
        }
    }
}

/// Build clk/data edge streams for one device-to-host frame (start, 8 data
/// bits LSB-first, odd parity, stop). `bit_period` is the clk low+high
/// period; `gap` precedes the frame. Each bit is sampled on a clk falling
/// edge; data is set at the start of its slot, well before that edge.
pub fn synth_device_to_host(byte: u8, bit_period: f64, gap: f64) -> (Vec<Edge>, Vec<Edge>) {
    let mut bits = vec![0u8]; // start bit, consumed as the sync trigger
    for i in 0..8 {
        bits.push((byte >> i) & 1);
    }
    let mut parity = 1u8;
    for &b in &bits[1..9] {
        parity ^= b;
    }
    bits.push(parity);
    bits.push(1); // stop bit

    let mut clk = vec![Edge::new(0.0, 1)];
    let mut data = vec![Edge::new(0.0, 1)];
    let quarter = bit_period / 4.0;
    let mut slot_start = gap;
    for &b in &bits {
        data.push(Edge::new(slot_start, b as i32));
        clk.push(Edge::new(slot_start + quarter, 0)); // sampled here
        clk.push(Edge::new(slot_start + quarter * 3.0, 1));
        slot_start += bit_period;
    }
    (clk, data)
}

/// Build clk/data edge streams for one host-to-device frame: a clock
/// inhibit period (`gap`, the host holding clk low to request the bus),
/// then start/8 data/parity/stop sampled on clk rising edges, then an ack
/// bit sampled on the following clk falling edge.
pub fn synth_host_to_device(byte: u8, bit_period: f64, gap: f64) -> (Vec<Edge>, Vec<Edge>) {
    let mut bits = vec![0u8]; // start bit, consumed as the sync trigger
    for i in 0..8 {
        bits.push((byte >> i) & 1);
    }
    let mut parity = 1u8;
    for &b in &bits[1..9] {
        parity ^= b;
    }
    bits.push(parity);
    bits.push(1); // stop bit

    let mut clk = vec![Edge::new(0.0, 1)];
    let mut data = vec![Edge::new(0.0, 1)];
    let quarter = bit_period / 4.0;

    // Inhibit period: clk held low for longer than the resynch threshold,
    // with the start bit already asserted before clk is released.
    let inhibit_start = 10.0e-6;
    data.push(Edge::new(inhibit_start, bits[0] as i32));
    clk.push(Edge::new(inhibit_start, 0));
    let mut slot_start = inhibit_start + gap; // clk rises here: the sync edge

    clk.push(Edge::new(slot_start, 1));
    for &b in &bits[1..] {
        slot_start += bit_period;
        data.push(Edge::new(slot_start - bit_period + quarter, b as i32));
        clk.push(Edge::new(slot_start - quarter, 0)); // toggle, not sampled
        clk.push(Edge::new(slot_start, 1)); // sampled here
    }

    // Ack bit, driven low by the device, sampled on the next falling edge.
    let ack_start = slot_start + quarter;
    data.push(Edge::new(ack_start, 0));
    clk.push(Edge::new(ack_start + quarter, 0));

    (clk, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_device_to_host_byte() {
        let bit_period = 60.0e-6;
        let (clk, data) = synth_device_to_host(0x41, bit_period, 500.0e-6);
        let decoder = decode_ps2(clk.into_iter(), data.into_iter()).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert_eq!(frames.len(), 1);
        let frame = frames[0].data.as_ref().unwrap();
        assert_eq!(frame.data, 0x41);
        assert_eq!(frame.direction, Ps2Dir::DeviceToHost);
        assert!(!frame.parity_error);
        assert!(!frame.framing_error);
    }

    #[test]
    fn decodes_a_host_to_device_byte_with_ack() {
        let bit_period = 60.0e-6;
        let (clk, data) = synth_host_to_device(0x10, bit_period, 500.0e-6);
        let decoder = decode_ps2(clk.into_iter(), data.into_iter()).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert_eq!(frames.len(), 1);
        let frame = frames[0].data.as_ref().unwrap();
        assert_eq!(frame.data, 0x10);
        assert_eq!(frame.direction, Ps2Dir::HostToDevice);
        assert!(!frame.ack_error);
    }

    #[test]
    fn flags_a_parity_error() {
        let bit_period = 60.0e-6;
        let (clk, mut data) = synth_device_to_host(0xFF, bit_period, 500.0e-6);
        // data[10] is the parity bit's edge (data[0] is the idle level,
        // data[1] the start bit, data[2..10] the 8 data bits).
        data[10].level = 1 - data[10].level;
        let decoder = decode_ps2(clk.into_iter(), data.into_iter()).unwrap();
        let frames: Vec<_> = decoder.collect();
        assert!(frames[0].data.as_ref().unwrap().parity_error);
    }
}
