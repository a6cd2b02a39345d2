//! I2C decoder: multi-line state machine with start/stop/ack (spec §4.8.5).
//!
//! Ground truth: `ripyl.protocol.i2c`. SDA only ever changes state while
//! SCL is low, *except* for the start (SDA falls while SCL is high) and
//! stop (SDA rises while SCL is high) conditions, which is what makes
//! those two transitions unambiguous framing markers.

use std::collections::HashMap;

use crate::edge::Edge;
use crate::error::Result;
use crate::record::{Status, StreamRecord};
use crate::walker::MultiEdgeSequence;

pub const STATUS_ACK_ERROR: Status = Status(Status::ERROR.0 + 1);

const SCL: &str = "scl";
const SDA: &str = "sda";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct I2cAddress {
    pub address: u8,
    pub read: bool,
    pub ack: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct I2cByte {
    pub value: u8,
    pub ack: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum I2cItem {
    Start,
    Stop,
    Address(I2cAddress),
    Data(I2cByte),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingAddress,
    AwaitingData,
}

pub fn decode_i2c<Iscl, Isda>(scl: Iscl, sda: Isda) -> Result<I2cDecoder>
where
    Iscl: Iterator<Item = Edge> + 'static,
    Isda: Iterator<Item = Edge> + 'static,
{
    let mut channels: HashMap<String, Box<dyn Iterator<Item = Edge>>> = HashMap::new();
    channels.insert(SCL.to_string(), Box::new(scl));
    channels.insert(SDA.to_string(), Box::new(sda));
    let walker = MultiEdgeSequence::new(channels, 0.0);

    Ok(I2cDecoder {
        walker,
        phase: Phase::Idle,
        bit_count: 0,
        acc: 0,
        byte_start: 0.0,
        pending: Vec::new(),
    })
}

pub struct I2cDecoder {
    walker: MultiEdgeSequence<Box<dyn Iterator<Item = Edge>>>,
    phase: Phase,
    bit_count: u8,
    acc: u16,
    byte_start: f64,
    pending: Vec<StreamRecord<I2cItem>>,
}

impl Iterator for I2cDecoder {
    type Item = StreamRecord<I2cItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(r) = self.pending.pop() {
                return Some(r);
            }

            let (channel, t) = self.walker.next_event()?;
            let scl_high = self.walker.cur_state(SCL) == Some(1);

            if channel == SDA && scl_high {
                let sda_level = self.walker.cur_state(SDA).unwrap_or(1);
                if sda_level == 0 {
                    // START (or repeated START)
                    self.phase = Phase::AwaitingAddress;
                    self.bit_count = 0;
                    self.acc = 0;
                    tracing::info!(time = t, "i2c start condition");
                    return Some(StreamRecord::event(t, "I2C start", Some(I2cItem::Start), Status::OK));
                } else {
                    self.phase = Phase::Idle;
                    tracing::info!(time = t, "i2c stop condition");
                    return Some(StreamRecord::event(t, "I2C stop", Some(I2cItem::Stop), Status::OK));
                }
            }

            if channel == SCL && scl_high && self.phase != Phase::Idle {
                let sda_bit = self.walker.cur_state(SDA).unwrap_or(1) as u16;
                if self.bit_count == 0 {
                    self.byte_start = t;
                }

                if self.bit_count < 8 {
                    self.acc = (self.acc << 1) | sda_bit;
                    self.bit_count += 1;
                } else {
                    // 9th clock: ACK/NACK.
                    let ack = sda_bit == 0;
                    let byte = self.acc as u8;
                    let status = if ack { Status::OK } else { STATUS_ACK_ERROR };

                    let item = if self.phase == Phase::AwaitingAddress {
                        self.phase = Phase::AwaitingData;
                        I2cItem::Address(I2cAddress {
                            address: byte >> 1,
                            read: byte & 0x01 == 1,
                            ack,
                        })
                    } else {
                        I2cItem::Data(I2cByte { value: byte, ack })
                    };
                    let kind = if matches!(item, I2cItem::Address(_)) { "I2C address" } else { "I2C data" };

                    self.bit_count = 0;
                    self.acc = 0;
                    if !ack {
                        tracing::warn!(time = t, byte, "i2c nack");
                    }
                    return Some(StreamRecord::segment(self.byte_start, t, kind, Some(item), status));
                }
            }
        }
    }
}

/// A whole I2C read/write transfer: a start condition, an address byte,
/// and the data bytes up to the next stop/repeated-start (`ripyl.protocol
/// .i2c.reconstruct_i2c_transfers`, spec.md SPEC_FULL §3 supplement).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct I2cTransfer {
    pub address: u8,
    pub read: bool,
    pub bytes: Vec<u8>,
    pub acks: Vec<bool>,
}

/// Fold a flat I2C record stream back into whole transfers.
pub fn reconstruct_transfers(records: impl IntoIterator<Item = StreamRecord<I2cItem>>) -> Vec<I2cTransfer> {
    let mut transfers = Vec::new();
    let mut current: Option<I2cTransfer> = None;

    for record in records {
        match record.data {
            Some(I2cItem::Start) => {
                if let Some(t) = current.take() {
                    transfers.push(t);
                }
            }
            Some(I2cItem::Address(addr)) => {
                current = Some(I2cTransfer {
                    address: addr.address,
                    read: addr.read,
                    bytes: Vec::new(),
                    acks: vec![addr.ack],
                });
            }
            Some(I2cItem::Data(b)) => {
                if let Some(t) = current.as_mut() {
                    t.bytes.push(b.value);
                    t.acks.push(b.ack);
                }
            }
            Some(I2cItem::Stop) | None => {
                if let Some(t) = current.take() {
                    transfers.push(t);
                }
            }
        }
    }
    if let Some(t) = current.take() {
        transfers.push(t);
    }
    transfers
}
