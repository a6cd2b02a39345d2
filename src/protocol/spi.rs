//! SPI decoder: multi-line synchronous framing (spec §4.8.2).
//!
//! Ground truth: `ripyl.protocol.spi`. Unlike UART there is no intrinsic
//! bit period — the clock line *is* the timing reference, so words are
//! delimited by a gap in active clock edges rather than a fixed count.

use std::collections::HashMap;

use crate::edge::Edge;
use crate::error::Result;
use crate::record::{Status, StreamRecord};
use crate::walker::MultiEdgeSequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiConfig {
    pub cpol: u8,
    pub cpha: u8,
    pub lsb_first: bool,
    /// Gap-to-running-bit-period ratio that ends a word (spec: 1.5).
    pub word_gap_ratio: f64,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            cpol: 0,
            cpha: 0,
            lsb_first: false,
            word_gap_ratio: 1.5,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpiWord {
    pub value: u32,
    pub bits: u8,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CsEvent {
    pub asserted: bool,
}

/// Either a decoded data word or a chip-select transition event — SPI's
/// stream carries both segment and event records (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SpiItem {
    Word(SpiWord),
    Cs(CsEvent),
}

const CLK: &str = "clk";
const DATA: &str = "data";
const CS: &str = "cs";

pub fn decode_spi<Ic, Id, Ics>(clk: Ic, data: Id, cs: Option<Ics>, config: SpiConfig) -> Result<SpiDecoder>
where
    Ic: Iterator<Item = Edge> + 'static,
    Id: Iterator<Item = Edge> + 'static,
    Ics: Iterator<Item = Edge> + 'static,
{
    let mut channels: HashMap<String, Box<dyn Iterator<Item = Edge>>> = HashMap::new();
    channels.insert(CLK.to_string(), Box::new(clk));
    channels.insert(DATA.to_string(), Box::new(data));
    let has_cs = cs.is_some();
    if let Some(cs) = cs {
        channels.insert(CS.to_string(), Box::new(cs));
    }
    let walker = MultiEdgeSequence::new(channels, 0.0);
    let active_rising = (config.cpol ^ config.cpha) == 0;

    Ok(SpiDecoder {
        walker,
        config,
        active_rising,
        bits: Vec::new(),
        word_start: None,
        last_active_edge: None,
        running_period: None,
        pending: Vec::new(),
        has_cs,
    })
}

pub struct SpiDecoder {
    walker: MultiEdgeSequence<Box<dyn Iterator<Item = Edge>>>,
    config: SpiConfig,
    active_rising: bool,
    bits: Vec<u8>,
    word_start: Option<f64>,
    last_active_edge: Option<f64>,
    running_period: Option<f64>,
    pending: Vec<StreamRecord<SpiItem>>,
    has_cs: bool,
}

impl SpiDecoder {
    fn pack_word(&self, bits: &[u8]) -> u32 {
        let mut v = 0u32;
        if self.config.lsb_first {
            for (i, &b) in bits.iter().enumerate() {
                v |= (b as u32) << i;
            }
        } else {
            for &b in bits {
                v = (v << 1) | b as u32;
            }
        }
        v
    }

    fn flush_word(&mut self, end_time: f64) {
        if self.bits.is_empty() {
            return;
        }
        let start = self.word_start.unwrap_or(end_time);
        let value = self.pack_word(&self.bits);
        let word = SpiWord {
            value,
            bits: self.bits.len() as u8,
        };
        self.pending.push(StreamRecord::segment(start, end_time, "SPI word", Some(SpiItem::Word(word)), Status::OK));
        self.bits.clear();
        self.word_start = None;
    }
}

impl Iterator for SpiDecoder {
    type Item = StreamRecord<SpiItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(r) = self.pending.pop() {
                return Some(r);
            }

            let (channel, t) = match self.walker.next_event() {
                Some(e) => e,
                None => {
                    if !self.bits.is_empty() {
                        self.flush_word(self.walker.cur_time());
                        continue;
                    }
                    return None;
                }
            };

            if channel == CS && self.has_cs {
                let level = self.walker.cur_state(CS).unwrap_or(1);
                self.flush_word(t);
                self.pending.push(StreamRecord::event(t, "SPI CS", Some(SpiItem::Cs(CsEvent { asserted: level == 0 })), Status::OK));
                continue;
            }

            if channel == CLK {
                let clk_level = self.walker.cur_state(CLK).unwrap_or(0);
                let is_active = (clk_level == 1) == self.active_rising;
                if !is_active {
                    continue;
                }

                if let Some(last) = self.last_active_edge {
                    let gap = t - last;
                    let period = self.running_period.unwrap_or(gap);
                    if gap > period * self.config.word_gap_ratio && !self.bits.is_empty() {
                        self.flush_word(last);
                    }
                    self.running_period = Some(if self.bits.is_empty() { gap } else { (period * 3.0 + gap) / 4.0 });
                }
                self.last_active_edge = Some(t);

                if self.word_start.is_none() {
                    self.word_start = Some(t);
                }
                let bit = self.walker.cur_state(DATA).unwrap_or(0) as u8;
                self.bits.push(bit);
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_edges(n: usize, half_period: f64, cpol: u8) -> Vec<Edge> {
        let mut edges = vec![Edge::new(0.0, cpol as i32)];
        let mut t = 0.0;
        let mut level = cpol as i32;
        for _ in 0..(n * 2) {
            t += half_period;
            level = 1 - level;
            edges.push(Edge::new(t, level));
        }
        edges
    }

    fn data_edges_for_bits(bits: &[u8], half_period: f64, cpha: u8) -> Vec<Edge> {
        // one data edge per bit, placed before the active clk edge (CPHA=0)
        // or right at it (CPHA=1) — keep simple: set data half a bit early.
        let mut edges = vec![Edge::new(0.0, bits.first().copied().unwrap_or(0) as i32)];
        let offset = if cpha == 0 { -half_period * 0.5 } else { half_period * 0.5 };
        for (i, &b) in bits.iter().enumerate() {
            let active_edge_time = half_period * (2 * i + 1) as f64;
            let t = (active_edge_time + offset).max(0.0001 + i as f64 * 1e-9);
            edges.push(Edge::new(t, b as i32));
        }
        edges
    }

    #[test]
    fn decodes_one_word_cpol0_cpha0_msb_first() {
        let bits = [1u8, 0, 1, 1, 0, 0, 1, 0];
        let half = 1e-6;
        let clk = clock_edges(8, half, 0);
        let data = data_edges_for_bits(&bits, half, 0);
        let config = SpiConfig {
            cpol: 0,
            cpha: 0,
            lsb_first: false,
            ..SpiConfig::default()
        };
        let decoder = decode_spi(clk.into_iter(), data.into_iter(), None::<std::vec::IntoIter<Edge>>, config).unwrap();
        let items: Vec<_> = decoder.collect();
        let words: Vec<_> = items
            .iter()
            .filter_map(|r| match r.data.as_ref() {
                Some(SpiItem::Word(w)) => Some(w.value),
                _ => None,
            })
            .collect();
        assert_eq!(words, vec![0b1011_0010]);
    }

    #[test]
    fn cs_toggling_emits_events_and_flushes_pending_bits() {
        let bits = [1u8, 1, 0, 0];
        let half = 1e-6;
        let clk = clock_edges(4, half, 0);
        let data = data_edges_for_bits(&bits, half, 0);
        let cs = vec![Edge::new(0.0, 1), Edge::new(0.0001, 0), Edge::new(0.0002, 1)];
        let config = SpiConfig::default();
        let decoder = decode_spi(clk.into_iter(), data.into_iter(), Some(cs.into_iter()), config).unwrap();
        let items: Vec<_> = decoder.collect();
        let cs_events = items.iter().filter(|r| matches!(r.data, Some(SpiItem::Cs(_)))).count();
        assert_eq!(cs_events, 2);
    }
}
