//! ISO K-line decoder: ISO9141 / ISO14230 (KWP2000) automotive bus framing
//! (spec §4.8.5).
//!
//! Ground truth: `ripyl.protocol.iso_k_line`. K-line rides on the same
//! asynchronous UART framing as [`crate::protocol::uart`] at a fixed
//! 10400 baud, 8-N-1, LSB-first — this decoder drives [`decode_uart`] and
//! regroups its byte-frame stream into messages using a minimum
//! inter-byte gap (ISO9141, which carries no length field) or an explicit
//! length byte (ISO14230). A run of UART framing errors on an all-zero
//! byte is the wakeup/break pattern that precedes the init sequence
//! rather than message data, so it is filtered out before message
//! framing begins.

use crate::edge::Edge;
use crate::error::Result;
use crate::record::{Status, StreamRecord};
use crate::protocol::uart::{decode_uart, Parity, Polarity, UartConfig};

pub const STATUS_CHECKSUM_ERROR: Status = Status(Status::ERROR.0 + 1);
pub const STATUS_INVALID_MESSAGE: Status = Status(Status::ERROR.0 + 2);

/// K-line messages run at a fixed 10400 baud regardless of protocol
/// variant (spec §4.8.5 / `ripyl.protocol.iso_k_line.iso_k_line_decode`).
pub const K_LINE_BAUD: u32 = 10400;

/// Default minimum gap between bytes, in seconds, used to detect the end
/// of an ISO9141 message (no length field exists to bound it otherwise).
pub const DEFAULT_MIN_MESSAGE_INTERVAL: f64 = 7.0e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KLineProtocolKind {
    Iso9141,
    Iso14230,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KLineMessage {
    pub protocol: KLineProtocolKind,
    /// Full header bytes in wire order (option, [length], target, source).
    pub header: Vec<u8>,
    pub data: Vec<u8>,
    pub checksum: u8,
    pub checksum_ok: bool,
    /// `true` when the service-ID (first data byte) marks a request
    /// (`<= 0x3F`) rather than a response (`>= 0x40`).
    pub is_request: bool,
}

/// The sum-with-wraparound checksum every K-line message ends with:
/// all preceding bytes summed modulo 256.
pub fn kline_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

pub fn decode_kline<I>(edges: I, min_message_interval: f64) -> Result<KLineDecoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    let config = UartConfig {
        bits: 8,
        parity: Parity::None,
        stop_bits: 1.0,
        lsb_first: true,
        polarity: Polarity::IdleHigh,
        baud: Some(K_LINE_BAUD),
    };
    let uart = decode_uart(edges, config)?;
    Ok(KLineDecoder {
        uart,
        min_message_interval,
        msg_bytes: Vec::new(),
        prev_byte_end: 0.0,
        pending_wakeup: None,
    })
}

pub struct KLineDecoder {
    uart: crate::protocol::uart::UartDecoder,
    min_message_interval: f64,
    msg_bytes: Vec<(f64, f64, u8)>,
    prev_byte_end: f64,
    /// Start time of an in-progress wakeup (all-zero framing-error run).
    pending_wakeup: Option<f64>,
}

fn msg_total_length(msg_bytes: &[(f64, f64, u8)]) -> Option<usize> {
    let first = msg_bytes.first()?.2;
    if first & 0x80 == 0 {
        return None; // ISO9141 carries no length field
    }
    let length = (first & 0x3F) as usize;
    if length != 0 {
        return Some(3 + length + 1);
    }
    let second = msg_bytes.get(1)?.2 as usize;
    Some(4 + second + 1)
}

fn header_length(protocol: KLineProtocolKind, msg_bytes: &[(f64, f64, u8)]) -> usize {
    if protocol == KLineProtocolKind::Iso14230 && msg_bytes[0].2 == 0x80 {
        4
    } else {
        3
    }
}

fn build_message(msg_bytes: Vec<(f64, f64, u8)>) -> StreamRecord<KLineMessage> {
    let start_time = msg_bytes.first().map(|b| b.0).unwrap_or(0.0);
    let end_time = msg_bytes.last().map(|b| b.1).unwrap_or(start_time);
    let protocol = if msg_bytes[0].2 & 0x80 != 0 {
        KLineProtocolKind::Iso14230
    } else {
        KLineProtocolKind::Iso9141
    };
    let hlen = header_length(protocol, &msg_bytes);

    if msg_bytes.len() < hlen + 2 {
        let raw: Vec<u8> = msg_bytes.iter().map(|b| b.2).collect();
        let msg = KLineMessage {
            protocol,
            header: raw.clone(),
            data: Vec::new(),
            checksum: 0,
            checksum_ok: false,
            is_request: false,
        };
        return StreamRecord::segment(start_time, end_time, "K-line message", Some(msg), STATUS_INVALID_MESSAGE);
    }

    let header: Vec<u8> = msg_bytes[..hlen].iter().map(|b| b.2).collect();
    let body: Vec<u8> = msg_bytes[hlen..msg_bytes.len() - 1].iter().map(|b| b.2).collect();
    let checksum = msg_bytes.last().unwrap().2;
    let mut whole: Vec<u8> = header.clone();
    whole.extend_from_slice(&body);
    let checksum_ok = kline_checksum(&whole) == checksum;
    let sid = body.first().copied().unwrap_or(0);

    let status = if checksum_ok { Status::OK } else { STATUS_CHECKSUM_ERROR };
    if !checksum_ok {
        tracing::warn!(start_time, "kline checksum error");
    }

    let msg = KLineMessage {
        protocol,
        header,
        data: body,
        checksum,
        checksum_ok,
        is_request: sid <= 0x3F,
    };

    StreamRecord::segment(start_time, end_time, "K-line message", Some(msg), status)
}

impl Iterator for KLineDecoder {
    type Item = StreamRecord<KLineMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = match self.uart.next() {
                Some(f) => f,
                None => {
                    if !self.msg_bytes.is_empty() {
                        let msg_bytes = std::mem::take(&mut self.msg_bytes);
                        return Some(build_message(msg_bytes));
                    }
                    if let Some(wstart) = self.pending_wakeup.take() {
                        return Some(wakeup_record(wstart, self.prev_byte_end));
                    }
                    return None;
                }
            };
            let data = frame.data.as_ref().unwrap();
            let is_break = data.framing_error && data.data == 0;

            if is_break {
                if self.pending_wakeup.is_none() {
                    self.pending_wakeup = Some(frame.start_time);
                }
                self.prev_byte_end = frame.end_time;
                continue;
            }

            if let Some(wstart) = self.pending_wakeup.take() {
                return Some(wakeup_record(wstart, frame.start_time));
            }

            let byte = data.data as u8;
            let total_length = if self.msg_bytes.len() == 2 { msg_total_length(&self.msg_bytes) } else { None };
            let gap_ended = !self.msg_bytes.is_empty() && frame.start_time - self.prev_byte_end > self.min_message_interval;
            let length_ended = total_length.is_some() && self.msg_bytes.len() == total_length.unwrap();

            self.prev_byte_end = frame.end_time;

            if gap_ended || length_ended {
                let msg_bytes = std::mem::replace(&mut self.msg_bytes, vec![(frame.start_time, frame.end_time, byte)]);
                return Some(build_message(msg_bytes));
            }

            self.msg_bytes.push((frame.start_time, frame.end_time, byte));
        }
    }
}

fn wakeup_record(start: f64, end: f64) -> StreamRecord<KLineMessage> {
    StreamRecord::segment(start, end, "K-line wakeup", None, Status::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(edges: &mut Vec<Edge>, t: f64, level: i32) {
        if edges.last().map(|e: &Edge| e.level) != Some(level) {
            edges.push(Edge::new(t, level));
        }
    }

    fn synth_byte(edges: &mut Vec<Edge>, t: &mut f64, byte: u8, bit_period: f64) {
        push(edges, *t, 0);
        *t += bit_period;
        for i in 0..8 {
            push(edges, *t, ((byte >> i) & 1) as i32);
            *t += bit_period;
        }
        push(edges, *t, 1);
        *t += bit_period;
    }

    fn synth_message(bytes: &[u8], bit_period: f64, start: f64) -> (Vec<Edge>, f64) {
        let mut edges = vec![Edge::new(start, 1)];
        let mut t = start + bit_period;
        for &b in bytes {
            synth_byte(&mut edges, &mut t, b, bit_period);
        }
        (edges, t)
    }

    #[test]
    fn decodes_an_iso9141_message_with_good_checksum() {
        let bit_period = 1.0 / K_LINE_BAUD as f64;
        let header = [0x68u8, 0x6a, 0xf1];
        let body = [0x01u8, 0x02];
        let mut whole = header.to_vec();
        whole.extend_from_slice(&body);
        let cs = kline_checksum(&whole);
        let mut bytes = whole.clone();
        bytes.push(cs);

        let (mut edges, end) = synth_message(&bytes, bit_period, 0.0);
        edges.push(Edge::new(end + bit_period * 20.0, 1));

        let decoder = decode_kline(edges.into_iter(), DEFAULT_MIN_MESSAGE_INTERVAL).unwrap();
        let messages: Vec<_> = decoder.collect();
        assert_eq!(messages.len(), 1);
        let msg = messages[0].data.as_ref().unwrap();
        assert_eq!(msg.protocol, KLineProtocolKind::Iso9141);
        assert_eq!(msg.header, header);
        assert_eq!(msg.data, body);
        assert!(msg.checksum_ok);
        assert!(messages[0].status.is_ok());
    }

    #[test]
    fn detects_bad_checksum() {
        let bit_period = 1.0 / K_LINE_BAUD as f64;
        let header = [0x68u8, 0x6a, 0xf1];
        let body = [0x01u8];
        let mut whole = header.to_vec();
        whole.extend_from_slice(&body);
        let cs = kline_checksum(&whole).wrapping_add(1);
        let mut bytes = whole.clone();
        bytes.push(cs);

        let (mut edges, end) = synth_message(&bytes, bit_period, 0.0);
        edges.push(Edge::new(end + bit_period * 20.0, 1));

        let decoder = decode_kline(edges.into_iter(), DEFAULT_MIN_MESSAGE_INTERVAL).unwrap();
        let messages: Vec<_> = decoder.collect();
        assert!(!messages[0].data.as_ref().unwrap().checksum_ok);
        assert_eq!(messages[0].status, STATUS_CHECKSUM_ERROR);
    }

    #[test]
    fn two_messages_separated_by_gap_decode_independently() {
        let bit_period = 1.0 / K_LINE_BAUD as f64;
        let header = [0x68u8, 0x6a, 0xf1];
        let body1 = [0x01u8];
        let body2 = [0x02u8, 0x03];

        let mut whole1 = header.to_vec();
        whole1.extend_from_slice(&body1);
        let cs1 = kline_checksum(&whole1);
        let mut bytes1 = whole1.clone();
        bytes1.push(cs1);

        let mut whole2 = header.to_vec();
        whole2.extend_from_slice(&body2);
        let cs2 = kline_checksum(&whole2);
        let mut bytes2 = whole2.clone();
        bytes2.push(cs2);

        let (edges1, end1) = synth_message(&bytes1, bit_period, 0.0);
        let gap_start = end1 + DEFAULT_MIN_MESSAGE_INTERVAL * 2.0;
        let (edges2, end2) = synth_message(&bytes2, bit_period, gap_start);

        let mut all = edges1;
        all.extend(edges2);
        all.push(Edge::new(end2 + bit_period * 20.0, 1));

        let decoder = decode_kline(all.into_iter(), DEFAULT_MIN_MESSAGE_INTERVAL).unwrap();
        let messages: Vec<_> = decoder.collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data.as_ref().unwrap().data, body1);
        assert_eq!(messages[1].data.as_ref().unwrap().data, body2);
    }
}
