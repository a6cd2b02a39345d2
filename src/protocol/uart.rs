//! UART decoder: asynchronous framing with auto-baud (spec §4.8.1).
//!
//! Ground truth: `ripyl.protocol.uart`. A UART frame is `start bit, bits
//! data bits, optional parity bit, stop bit(s)`, all at a fixed bit period
//! once the line is synchronized on the falling edge of the start bit —
//! there's no shared clock line, so timing is recovered per-frame from the
//! walker alone.

use std::iter::Peekable;

use crate::edge::{buffer_prefix, peek_start_time, DynEdges, Edge};
use crate::error::{DecodeError, Result};
use crate::rate::{check_symbol_rate, snap_to_standard, STANDARD_UART_BAUDS};
use crate::record::{Status, StreamRecord};
use crate::synth;
use crate::walker::EdgeSequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Polarity {
    IdleHigh,
    IdleLow,
}

#[derive(Debug, Clone, Copy)]
pub struct UartConfig {
    /// 5..=9 per spec §4.8.1.
    pub bits: u8,
    pub parity: Parity,
    /// Fractional stop count permitted, >= 0.5 (e.g. 1.0, 1.5, 2.0).
    pub stop_bits: f64,
    pub lsb_first: bool,
    pub polarity: Polarity,
    /// Explicit baud; `None` triggers auto-baud via §4.5.
    pub baud: Option<u32>,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            bits: 8,
            parity: Parity::None,
            stop_bits: 1.0,
            lsb_first: true,
            polarity: Polarity::IdleHigh,
            baud: None,
        }
    }
}

/// `Status` codes specific to UART, contiguous with [`Status::ERROR`].
pub const STATUS_PARITY_ERROR: Status = Status(Status::ERROR.0 + 1);
pub const STATUS_FRAMING_ERROR: Status = Status(Status::ERROR.0 + 2);
pub const STATUS_BREAK: Status = Status(Status::ERROR.0 + 3);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UartFrame {
    pub data: u32,
    pub bits: u8,
    pub parity_bit: Option<u8>,
    pub parity_error: bool,
    pub framing_error: bool,
    /// All-zero data with the stop region held low the whole frame.
    pub break_condition: bool,
}

const AUTOBAUD_EDGES: usize = 50;

/// Auto-detect baud (if `config.baud` is `None`), normalize polarity, and
/// return a ready-to-pull decoder.
pub fn decode_uart<I>(edges: I, config: UartConfig) -> Result<UartDecoder>
where
    I: Iterator<Item = Edge> + 'static,
{
    assert!((5..=9).contains(&config.bits), "UART data bits must be 5..=9");
    assert!(config.stop_bits >= 0.5, "UART stop bits must be >= 0.5");

    let mut boxed: DynEdges = Box::new(edges);
    let baud = match config.baud {
        Some(b) => b,
        None => {
            let (prefix, replay) = buffer_prefix(boxed, AUTOBAUD_EDGES);
            if prefix.len() < 2 {
                return Err(DecodeError::AutoRate);
            }
            let rate = check_symbol_rate(&prefix, 2, true)?;
            boxed = Box::new(replay);
            let snapped = snap_to_standard(rate as f64, STANDARD_UART_BAUDS);
            tracing::info!(raw_rate = rate, snapped_baud = snapped, "uart auto-baud");
            snapped
        }
    };

    let boxed: DynEdges = match config.polarity {
        Polarity::IdleHigh => boxed,
        Polarity::IdleLow => Box::new(synth::invert(boxed)),
    };

    let (start_time, peeked) = peek_start_time(boxed);
    let mut walker = EdgeSequence::new(peeked, start_time);
    // Ensure the first `advance_to_edge` lands on a real start-bit falling
    // edge: if the capture begins mid-space, skip forward to the next
    // mark first (spec §4.8.1: "skip to first space to begin").
    while !walker.at_end() && walker.cur_state() != 1 {
        walker.advance_to_edge();
    }

    Ok(UartDecoder {
        walker,
        config,
        bit_period: 1.0 / baud as f64,
        baud,
    })
}

pub struct UartDecoder {
    walker: EdgeSequence<Peekable<DynEdges>>,
    config: UartConfig,
    bit_period: f64,
    baud: u32,
}

impl UartDecoder {
    pub fn baud(&self) -> u32 {
        self.baud
    }
}

impl Iterator for UartDecoder {
    type Item = StreamRecord<UartFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.walker.at_end() {
            return None;
        }

        // 1. Advance to the start-bit falling edge.
        self.walker.advance_to_edge();
        if self.walker.at_end() && self.walker.cur_state() != 0 {
            return None;
        }
        let start_time = self.walker.cur_time();
        let t = self.bit_period;

        // 2. Center of the first data bit.
        self.walker.advance(1.5 * t);

        let bits = self.config.bits;
        let mut data: u32 = 0;
        let mut running_parity: u32 = 0;
        for i in 0..bits {
            let b = self.walker.cur_state() as u32;
            if self.config.lsb_first {
                data |= b << i;
            } else {
                data = (data << 1) | b;
            }
            running_parity ^= b;
            self.walker.advance(t);
        }
        let mut parity_error = false;
        let mut sampled_parity_bit = None;
        if self.config.parity != Parity::None {
            let parity_bit = self.walker.cur_state() as u8;
            let expected = match self.config.parity {
                Parity::Even => running_parity as u8,
                Parity::Odd => 1 - running_parity as u8,
                Parity::None => unreachable!(),
            };
            parity_error = parity_bit != expected;
            sampled_parity_bit = Some(parity_bit);
            self.walker.advance(t);
        }

        // Stop region: the line must be at mark.
        let stop_level = self.walker.cur_state();
        let framing_error = stop_level != 1;
        let break_condition = framing_error && data == 0;
        let stop_status = if break_condition {
            STATUS_BREAK
        } else if framing_error {
            STATUS_FRAMING_ERROR
        } else {
            Status::OK
        };

        if framing_error {
            if break_condition {
                tracing::warn!(start_time, "uart break condition");
            } else {
                tracing::warn!(start_time, "uart framing error");
            }
        }

        let end_time = start_time + (1.0 + bits as f64 + if self.config.parity != Parity::None { 1.0 } else { 0.0 } + self.config.stop_bits) * t;
        let frame_status = [
            if parity_error { STATUS_PARITY_ERROR } else { Status::OK },
            stop_status,
        ]
        .into_iter()
        .max()
        .unwrap_or(Status::OK);

        let frame_data = UartFrame {
            data,
            bits,
            parity_bit: sampled_parity_bit,
            parity_error,
            framing_error,
            break_condition,
        };

        Some(StreamRecord::segment(start_time, end_time, "UART frame", Some(frame_data), frame_status))
    }
}
