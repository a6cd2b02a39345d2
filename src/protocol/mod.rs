//! Protocol decoders (spec §4.8).
//!
//! Every decoder follows the same shape: a constructor function validates
//! its configuration and performs any fatal auto-detection (logic levels,
//! baud/bit rate) up front, returning a `Result<Decoder>`; the returned
//! decoder is then an `Iterator<Item = StreamRecord<...>>` that yields one
//! frame/packet/transfer per pull, matching the generator style of the
//! source this was ported from (spec §9).
//!
//! Non-fatal per-frame conditions (framing, parity, CRC, stuffing, ack
//! errors) are never `Result::Err` — they're `Status` values on the
//! yielded record, and the decoder resynchronizes on the next frame
//! boundary (spec §7).

pub mod can;
pub mod ethernet;
pub mod i2c;
pub mod i2s;
pub mod ir;
pub mod j1850;
pub mod kline;
pub mod lin;
pub mod ps2;
pub mod spi;
pub mod uart;
pub mod usb;
