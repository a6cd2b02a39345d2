//! USB decoder: NRZI, bit-stuffing, CRC-5/16, three bus speeds (spec
//! §4.8.3). The hardest decoder in the core — about 18% of the budget.
//!
//! Ground truth: `ripyl.protocol.usb`. This operates on an already
//! line-state-derived edge stream (`J`/`K`/`SE0`, spec's J/K/SE0/SE1
//! vocabulary) rather than raw differential voltages — the differential
//! -> line-state mapping is a simple sign comparison the caller performs
//! (spec §4.8.3 "line-state derivation"); the decoder itself is the
//! reusable part: sync detection, NRZI, unstuffing, PID dispatch, CRCs.

use std::iter::Peekable;

use crate::bitops::{usb_crc16, usb_crc5};
use crate::edge::{buffer_prefix, peek_start_time, DynEdges, Edge};
use crate::error::{DecodeError, Result};
use crate::rate::find_symbol_rate;
use crate::record::{Status, StreamRecord};
use crate::walker::EdgeSequence;

/// Line-state encoding for the edge stream `level` field.
pub const SE0: i32 = 0;
pub const K: i32 = 1;
pub const J: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BusSpeed {
    Low,
    Full,
    High,
}

impl BusSpeed {
    pub fn clock_period(self) -> f64 {
        match self {
            BusSpeed::Low => 1.0 / 1_500_000.0,
            BusSpeed::Full => 1.0 / 12_000_000.0,
            BusSpeed::High => 1.0 / 480_000_000.0,
        }
    }

    fn bit_rate(self) -> f64 {
        1.0 / self.clock_period()
    }
}

pub const STATUS_CRC_ERROR: Status = Status(Status::ERROR.0 + 1);
pub const STATUS_STUFF_ERROR: Status = Status(Status::ERROR.0 + 2);
pub const STATUS_INVALID_PID: Status = Status(Status::ERROR.0 + 3);
pub const STATUS_SHORT_PACKET: Status = Status(Status::ERROR.0 + 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TokenPid {
    Out,
    In,
    Setup,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DataPid {
    Data0,
    Data1,
    Data2,
    MData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HandshakePid {
    Ack,
    Nak,
    Stall,
    Nyet,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum UsbItem {
    Token { pid: TokenPid, address: u8, endpoint: u8, crc5_ok: bool },
    Sof { frame_number: u16, crc5_ok: bool },
    Data { pid: DataPid, payload: Vec<u8>, crc16_ok: bool },
    Handshake { pid: HandshakePid },
    /// PRE/ERR/SPLIT: recognized but not field-decoded (spec names them,
    /// gives no field layout).
    Special { pid_nibble: u8 },
    /// Two sub-packets combined into one record (spec §4.8.3 EXT).
    Ext {
        address: u8,
        endpoint: u8,
        crc5_1_ok: bool,
        sub_pid: u8,
        variable: u16,
        crc5_2_ok: bool,
    },
    Invalid { pid_nibble: u8, raw_bits: Vec<u8> },
}

/// Pack bits into an integer, first-received bit as LSB (spec §4.8.3:
/// "USB transmits LSB-first").
fn pack_lsb(bits: &[u8]) -> u32 {
    bits.iter().enumerate().fold(0u32, |acc, (i, &b)| acc | ((b as u32 & 1) << i))
}

const AUTOSPEED_EDGES: usize = 50;

/// Pick the nearest of the three reference bus speeds from an edge
/// prefix, with SE0 glitches removed first (spec §4.8.3 auto-speed).
pub fn auto_speed(edges: &[Edge]) -> Result<BusSpeed> {
    let filtered: Vec<Edge> = edges.iter().copied().filter(|e| e.level != SE0).collect();
    let mut rate = find_symbol_rate(&filtered, 2, true)?;
    if rate == 0 {
        rate = find_symbol_rate(&filtered, 1, true)?;
    }
    if rate == 0 {
        return Err(DecodeError::AutoRate);
    }
    let refs = [(BusSpeed::Low, 1_500_000.0), (BusSpeed::Full, 12_000_000.0), (BusSpeed::High, 480_000_000.0)];
    let log_rate = (rate as f64).log10();
    let speed = refs
        .iter()
        .min_by(|a, b| {
            let da = (log_rate - a.1.log10()).abs();
            let db = (log_rate - b.1.log10()).abs();
            da.partial_cmp(&db).unwrap()
        })
        .unwrap()
        .0;
    tracing::info!(raw_rate = rate, ?speed, "usb auto-speed");
    Ok(speed)
}

pub fn decode_usb<I>(edges: I, speed: Option<BusSpeed>) -> Result<UsbDecoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let mut boxed: DynEdges = Box::new(edges);
    let speed = match speed {
        Some(s) => s,
        None => {
            let (prefix, replay) = buffer_prefix(boxed, AUTOSPEED_EDGES);
            let s = auto_speed(&prefix)?;
            boxed = Box::new(replay);
            s
        }
    };

    let (start_time, peeked) = peek_start_time(boxed);
    let mut walker = EdgeSequence::new(peeked, start_time);
    // Idle is J (Low/Full) — ensure the scanner starts looking from idle.
    if speed != BusSpeed::High {
        while !walker.at_end() && walker.cur_state() != J {
            walker.advance_to_edge();
        }
    }

    Ok(UsbDecoder {
        walker,
        speed,
        bit_period: speed.clock_period(),
    })
}

pub struct UsbDecoder {
    walker: EdgeSequence<Peekable<DynEdges>>,
    speed: BusSpeed,
    bit_period: f64,
}

struct RawPacket {
    start: f64,
    end: f64,
    pid_nibble: u8,
    pid_check_ok: bool,
    bits: Vec<u8>,
    stuff_error: bool,
}

impl UsbDecoder {
    fn sample_symbol(&mut self) -> i32 {
        self.walker.advance(self.bit_period);
        self.walker.cur_state()
    }

    /// Scan for and verify a start-of-packet sync, then NRZI-decode and
    /// unstuff bits until end-of-packet. Returns `None` only once the
    /// upstream edge stream is exhausted; sync mismatches are retried
    /// internally against the next candidate SOP.
    fn decode_one_packet(&mut self) -> Option<RawPacket> {
        loop {
            if self.walker.at_end() {
                return None;
            }

            let sop_start = if self.speed != BusSpeed::High {
                self.scan_low_full_sop()?
            } else {
                self.scan_high_sop()?
            };
            let Some(start_time) = sop_start else {
                continue;
            };

            let (bits, stuff_error, end_time) = self.collect_payload_bits();
            if bits.len() < 8 {
                return Some(RawPacket {
                    start: start_time,
                    end: end_time,
                    pid_nibble: 0,
                    pid_check_ok: false,
                    bits,
                    stuff_error,
                });
            }

            let pid_byte = pack_lsb(&bits[0..8]) as u8;
            let pid_nibble = pid_byte & 0x0F;
            let pid_check = (pid_byte >> 4) & 0x0F;
            let pid_check_ok = pid_check == (!pid_nibble & 0x0F);

            return Some(RawPacket {
                start: start_time,
                end: end_time,
                pid_nibble,
                pid_check_ok,
                bits: bits[8..].to_vec(),
                stuff_error,
            });
        }
    }

    /// `None` = stream exhausted (caller should stop). `Some(None)` = a
    /// J->K transition was found but the 7-symbol sync didn't verify;
    /// caller should retry scanning. `Some(Some(t))` = verified SOP.
    fn scan_low_full_sop(&mut self) -> Option<Option<f64>> {
        let mut prev = self.walker.cur_state();
        loop {
            if self.walker.at_end() {
                return None;
            }
            self.walker.advance_to_edge();
            let cur = self.walker.cur_state();
            if prev == J && cur == K {
                break;
            }
            prev = cur;
            if self.walker.at_end() {
                return None;
            }
        }
        let start = self.walker.cur_time();
        // Land every subsequent sample at the midpoint of its symbol
        // instead of exactly on the next edge boundary (matches the
        // UART/CAN decoders' half-bit-then-full-bit sampling convention).
        self.walker.advance(0.5 * self.bit_period);
        const SYNC_TAIL: [i32; 7] = [J, K, J, K, J, K, K];
        for &expected in SYNC_TAIL.iter() {
            let sym = self.sample_symbol();
            if sym != expected {
                return Some(None);
            }
        }
        Some(Some(start))
    }

    /// High-speed SOP: `SE0 -> K` then a variable-length `J,K,...` run
    /// ending in a `K,K` pair (spec §4.8.3, up to 20 symbols).
    fn scan_high_sop(&mut self) -> Option<Option<f64>> {
        let mut prev = self.walker.cur_state();
        loop {
            if self.walker.at_end() {
                return None;
            }
            self.walker.advance_to_edge();
            let cur = self.walker.cur_state();
            if prev == SE0 && cur == K {
                break;
            }
            prev = cur;
        }
        let start = self.walker.cur_time();
        self.walker.advance(0.5 * self.bit_period);
        let mut last = K;
        for _ in 0..20 {
            let sym = self.sample_symbol();
            if sym == K && last == K {
                return Some(Some(start));
            }
            if sym != J && sym != K {
                return Some(None);
            }
            if sym == last {
                return Some(None);
            }
            last = sym;
        }
        Some(None)
    }

    /// NRZI-decode + unstuff until EOP. Returns `(bits, stuff_error, end_time)`.
    fn collect_payload_bits(&mut self) -> (Vec<u8>, bool, f64) {
        let mut prev_symbol = K;
        let mut bits = Vec::new();
        let mut ones_run = 0u32;
        let mut stuff_error = false;

        loop {
            let sym = self.sample_symbol();
            if self.speed != BusSpeed::High && sym == SE0 {
                break;
            }
            let bit = if sym == prev_symbol { 1u8 } else { 0u8 };
            prev_symbol = sym;

            if ones_run >= 6 {
                if bit == 1 {
                    if self.speed == BusSpeed::High {
                        // Deliberate stuffing violation = High-speed EOP.
                        break;
                    }
                    stuff_error = true;
                    bits.push(bit);
                    ones_run = 0;
                    continue;
                } else {
                    // forced stuff bit: drop it, don't extend the run.
                    ones_run = 0;
                    continue;
                }
            }

            bits.push(bit);
            if bit == 1 {
                ones_run += 1;
            } else {
                ones_run = 0;
            }

            if bits.len() > 8192 {
                break;
            }
        }

        if self.speed != BusSpeed::High {
            // Consume the rest of the EOP (SE0 hold) back to idle J.
            while !self.walker.at_end() && self.walker.cur_state() != J {
                self.walker.advance_to_edge();
            }
        }
        (bits, stuff_error, self.walker.cur_time())
    }

    fn build_token(&self, pid: TokenPid, bits: &[u8]) -> (UsbItem, Status) {
        if bits.len() < 16 {
            return (UsbItem::Invalid { pid_nibble: 0, raw_bits: bits.to_vec() }, STATUS_SHORT_PACKET);
        }
        let address = pack_lsb(&bits[0..7]) as u8;
        let endpoint = pack_lsb(&bits[7..11]) as u8;
        let received = pack_lsb(&bits[11..16]) as u8;
        let expected = usb_crc5(&bits[0..11]);
        let ok = received == expected;
        (UsbItem::Token { pid, address, endpoint, crc5_ok: ok }, if ok { Status::OK } else { STATUS_CRC_ERROR })
    }

    fn build_sof(&self, bits: &[u8]) -> (UsbItem, Status) {
        if bits.len() < 16 {
            return (UsbItem::Invalid { pid_nibble: 0, raw_bits: bits.to_vec() }, STATUS_SHORT_PACKET);
        }
        let frame_number = pack_lsb(&bits[0..11]) as u16;
        let received = pack_lsb(&bits[11..16]) as u8;
        let expected = usb_crc5(&bits[0..11]);
        let ok = received == expected;
        (UsbItem::Sof { frame_number, crc5_ok: ok }, if ok { Status::OK } else { STATUS_CRC_ERROR })
    }

    fn build_data(&self, pid: DataPid, bits: &[u8]) -> (UsbItem, Status) {
        if bits.len() < 16 || (bits.len() - 16) % 8 != 0 {
            return (UsbItem::Invalid { pid_nibble: 0, raw_bits: bits.to_vec() }, STATUS_SHORT_PACKET);
        }
        let n_payload_bytes = (bits.len() - 16) / 8;
        let payload: Vec<u8> = (0..n_payload_bytes).map(|k| pack_lsb(&bits[k * 8..k * 8 + 8]) as u8).collect();
        let crc_bits = &bits[n_payload_bytes * 8..n_payload_bytes * 8 + 16];
        let received = (pack_lsb(&crc_bits[0..8]) as u16) | ((pack_lsb(&crc_bits[8..16]) as u16) << 8);
        let expected = usb_crc16(&payload);
        let ok = received == expected;
        (UsbItem::Data { pid, payload, crc16_ok: ok }, if ok { Status::OK } else { STATUS_CRC_ERROR })
    }

    fn wrap(&self, raw: RawPacket, item: UsbItem, status: Status) -> StreamRecord<UsbItem> {
        let status = if raw.stuff_error { STATUS_STUFF_ERROR.max(status) } else { status };
        StreamRecord::segment(raw.start, raw.end, "USB packet", Some(item), status)
    }
}

impl Iterator for UsbDecoder {
    type Item = StreamRecord<UsbItem>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.decode_one_packet()?;

        if !raw.pid_check_ok {
            tracing::warn!(pid = raw.pid_nibble, "usb invalid pid");
            return Some(StreamRecord::segment(
                raw.start,
                raw.end,
                "USB packet",
                Some(UsbItem::Invalid { pid_nibble: raw.pid_nibble, raw_bits: raw.bits.clone() }),
                STATUS_INVALID_PID,
            ));
        }

        match raw.pid_nibble {
            0x1 => {
                let (item, status) = self.build_token(TokenPid::Out, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0x9 => {
                let (item, status) = self.build_token(TokenPid::In, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0xD => {
                let (item, status) = self.build_token(TokenPid::Setup, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0x4 => {
                let (item, status) = self.build_token(TokenPid::Ping, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0x5 => {
                let (item, status) = self.build_sof(&raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0x3 => {
                let (item, status) = self.build_data(DataPid::Data0, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0xB => {
                let (item, status) = self.build_data(DataPid::Data1, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0x7 => {
                let (item, status) = self.build_data(DataPid::Data2, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0xF => {
                let (item, status) = self.build_data(DataPid::MData, &raw.bits);
                Some(self.wrap(raw, item, status))
            }
            0x2 => Some(self.wrap(raw, UsbItem::Handshake { pid: HandshakePid::Ack }, Status::OK)),
            0xA => Some(self.wrap(raw, UsbItem::Handshake { pid: HandshakePid::Nak }, Status::OK)),
            0xE => Some(self.wrap(raw, UsbItem::Handshake { pid: HandshakePid::Stall }, Status::OK)),
            0x6 => Some(self.wrap(raw, UsbItem::Handshake { pid: HandshakePid::Nyet }, Status::OK)),
            0xC | 0x8 => Some(self.wrap(raw, UsbItem::Special { pid_nibble: raw.pid_nibble }, Status::OK)),
            0x0 => {
                // EXT: combine with a second sub-packet.
                let (addr, endp, crc5_1_ok) = if raw.bits.len() >= 16 {
                    (pack_lsb(&raw.bits[0..7]) as u8, pack_lsb(&raw.bits[7..11]) as u8, pack_lsb(&raw.bits[11..16]) as u8 == usb_crc5(&raw.bits[0..11]))
                } else {
                    (0, 0, false)
                };
                let start = raw.start;
                let Some(sub2) = self.decode_one_packet() else {
                    return Some(StreamRecord::segment(
                        start,
                        raw.end,
                        "USB EXT packet",
                        Some(UsbItem::Ext { address: addr, endpoint: endp, crc5_1_ok, sub_pid: 0, variable: 0, crc5_2_ok: false }),
                        STATUS_SHORT_PACKET,
                    ));
                };
                // `sub2.bits` already excludes the second sub-packet's PID
                // byte (decode_one_packet strips it); `sub2.pid_nibble` IS
                // the sub-PID field.
                let sub_pid = sub2.pid_nibble;
                let (variable, crc5_2_ok) = if sub2.bits.len() >= 16 {
                    let variable = pack_lsb(&sub2.bits[0..11]) as u16;
                    let crc5_ok = pack_lsb(&sub2.bits[11..16]) as u8 == usb_crc5(&sub2.bits[0..11]);
                    (variable, crc5_ok)
                } else {
                    (0, false)
                };
                let status = if crc5_1_ok && crc5_2_ok { Status::OK } else { STATUS_CRC_ERROR };
                Some(StreamRecord::segment(
                    start,
                    sub2.end,
                    "USB EXT packet",
                    Some(UsbItem::Ext { address: addr, endpoint: endp, crc5_1_ok, sub_pid, variable, crc5_2_ok }),
                    status,
                ))
            }
            _ => Some(self.wrap(raw, UsbItem::Invalid { pid_nibble: raw.pid_nibble, raw_bits: raw.bits.clone() }, STATUS_INVALID_PID)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nrzi_encode(bits: &[u8], start_symbol: i32) -> Vec<i32> {
        let mut prev = start_symbol;
        bits.iter()
            .map(|&b| {
                let sym = if b == 1 { prev } else { if prev == J { K } else { J } };
                prev = sym;
                sym
            })
            .collect()
    }

    fn stuff_bits(bits: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut ones_run = 0u32;
        for &b in bits {
            out.push(b);
            if b == 1 {
                ones_run += 1;
            } else {
                ones_run = 0;
            }
            if ones_run == 6 {
                out.push(0);
                ones_run = 0;
            }
        }
        out
    }

    fn build_data0_packet(payload: &[u8]) -> Vec<Edge> {
        let pid_nibble = 0x3u8; // DATA0
        let pid_byte = pid_nibble | ((!pid_nibble & 0x0F) << 4);
        let mut bits = Vec::new();
        for i in 0..8 {
            bits.push((pid_byte >> i) & 1);
        }
        for &byte in payload {
            for i in 0..8 {
                bits.push((byte >> i) & 1);
            }
        }
        let crc16 = usb_crc16(payload);
        for i in 0..16 {
            bits.push(((crc16 >> i) & 1) as u8);
        }

        let stuffed = stuff_bits(&bits);
        // Sync field: KJKJKJKK (NRZI of 00000001, last bit 1 -> stays K).
        let sync_bits = [0u8, 0, 0, 0, 0, 0, 0, 1];
        let mut symbols = nrzi_encode(&sync_bits, J);
        symbols.extend(nrzi_encode(&stuffed, *symbols.last().unwrap()));

        let half = 1e-9;
        let bit_period = 1.0 / 12_000_000.0;
        let mut edges = vec![Edge::new(0.0, J)];
        let mut t = bit_period;
        for &sym in &symbols {
            if edges.last().map(|e| e.level) != Some(sym) {
                edges.push(Edge::new(t, sym));
            }
            t += bit_period;
        }
        // EOP: 2 bit periods of SE0, then back to J.
        edges.push(Edge::new(t, SE0));
        t += bit_period * 2.0;
        edges.push(Edge::new(t, J));
        t += bit_period * 4.0;
        edges.push(Edge::new(t, J));
        let _ = half;
        edges
    }

    #[test]
    fn decodes_a_full_speed_data0_packet() {
        let payload = b"Ripyl".to_vec();
        let edges = build_data0_packet(&payload);
        let decoder = decode_usb(edges.into_iter(), Some(BusSpeed::Full)).unwrap();
        let records: Vec<_> = decoder.collect();
        assert!(!records.is_empty());
        let item = records[0].data.as_ref().unwrap();
        match item {
            UsbItem::Data { pid, payload: p, crc16_ok } => {
                assert_eq!(*pid, DataPid::Data0);
                assert_eq!(p, &payload);
                assert!(*crc16_ok);
            }
            other => panic!("expected a DATA0 packet, got {other:?}"),
        }
        assert!(records[0].status.is_ok());
    }

    #[test]
    fn flags_a_pid_check_mismatch() {
        // Build a packet whose PID check nibble is wrong.
        let mut bits = vec![1u8, 1, 0, 0, 1, 1, 0, 0]; // bad PID byte (check != ~nibble)
        for _ in 0..16 {
            bits.push(0);
        }
        let stuffed = stuff_bits(&bits);
        let sync_bits = [0u8, 0, 0, 0, 0, 0, 0, 1];
        let mut symbols = nrzi_encode(&sync_bits, J);
        symbols.extend(nrzi_encode(&stuffed, *symbols.last().unwrap()));
        let bit_period = 1.0 / 12_000_000.0;
        let mut edges = vec![Edge::new(0.0, J)];
        let mut t = bit_period;
        for &sym in &symbols {
            if edges.last().map(|e| e.level) != Some(sym) {
                edges.push(Edge::new(t, sym));
            }
            t += bit_period;
        }
        edges.push(Edge::new(t, SE0));
        t += bit_period * 2.0;
        edges.push(Edge::new(t, J));
        t += bit_period * 4.0;
        edges.push(Edge::new(t, J));

        let decoder = decode_usb(edges.into_iter(), Some(BusSpeed::Full)).unwrap();
        let records: Vec<_> = decoder.collect();
        assert_eq!(records[0].status, STATUS_INVALID_PID);
    }
}
