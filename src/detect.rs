//! Edge detectors: binary (spec §4.3) and multi-level (spec §4.4).
//!
//! Ground truth: `ripyl.decode.find_edges` / `find_multi_edges` /
//! `remove_transitional_states` / `expand_logic_levels` / `gen_hyst_thresholds`.

use crate::edge::Edge;
use crate::error::{DecodeError, Result};
use crate::sample::SampleChunk;

/// Convert a sample stream into a binary edge stream using two-threshold
/// hysteresis (spec §4.3).
///
/// `logic` is `(low, high)`. `hysteresis` is in `[0.0, 1.0]`.
pub fn find_edges<I>(samples: I, logic: (f64, f64), hysteresis: f64) -> impl Iterator<Item = Edge>
where
    I: Iterator<Item = SampleChunk>,
{
    let span = logic.1 - logic.0;
    let thresh = (logic.1 + logic.0) / 2.0;
    let hyst_top = span * (0.5 + hysteresis / 2.0) + logic.0;
    let hyst_bot = span * (0.5 - hysteresis / 2.0) + logic.0;

    FindEdges {
        chunks: samples,
        hyst_top,
        hyst_bot,
        thresh,
        state: EdgeState::Start,
        prev_stable: Zone::Logic0,
        pending: std::collections::VecDeque::new(),
        cur_chunk: None,
        chunk_idx: 0,
        t: 0.0,
        started: false,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Zone {
    Logic1,
    Transition,
    Logic0,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Start,
    Stable(Zone),
    Transition,
}

struct FindEdges<I> {
    chunks: I,
    hyst_top: f64,
    hyst_bot: f64,
    thresh: f64,
    state: EdgeState,
    prev_stable: Zone,
    pending: std::collections::VecDeque<Edge>,
    cur_chunk: Option<SampleChunk>,
    chunk_idx: usize,
    t: f64,
    started: bool,
}

impl<I> FindEdges<I>
where
    I: Iterator<Item = SampleChunk>,
{
    fn zone(&self, sample: f64) -> Zone {
        if sample > self.hyst_top {
            Zone::Logic1
        } else if sample > self.hyst_bot {
            Zone::Transition
        } else {
            Zone::Logic0
        }
    }

    fn zone_level(zone: Zone) -> i32 {
        match zone {
            Zone::Logic1 => 1,
            Zone::Logic0 => 0,
            Zone::Transition => unreachable!("transition zone has no logic level"),
        }
    }

    fn advance(&mut self) -> bool {
        loop {
            if self.cur_chunk.is_none() {
                match self.chunks.next() {
                    Some(c) => {
                        self.t = c.start_time;
                        self.cur_chunk = Some(c);
                        self.chunk_idx = 0;
                    }
                    None => return false,
                }
            }

            let chunk = self.cur_chunk.as_ref().unwrap();
            if self.chunk_idx >= chunk.samples.len() {
                self.cur_chunk = None;
                continue;
            }

            if !self.started {
                self.started = true;
                let initial_level = if chunk.samples[0] > self.thresh { 1 } else { 0 };
                self.pending.push_back(Edge::new(chunk.start_time, initial_level));
            }

            let sample = chunk.samples[self.chunk_idx];
            let period = chunk.sample_period;
            let t = self.t;
            self.chunk_idx += 1;
            self.t += period;

            let zone = self.zone(sample);
            match self.state {
                EdgeState::Start => {
                    if zone != Zone::Transition {
                        self.state = EdgeState::Stable(zone);
                    }
                }
                EdgeState::Stable(cur) => {
                    if zone != Zone::Transition {
                        if zone != cur {
                            self.state = EdgeState::Stable(zone);
                            self.pending.push_back(Edge::new(t, Self::zone_level(zone)));
                            return true;
                        }
                    } else {
                        self.prev_stable = cur;
                        self.state = EdgeState::Transition;
                    }
                }
                EdgeState::Transition => {
                    if zone != Zone::Transition {
                        if zone != self.prev_stable {
                            self.pending.push_back(Edge::new(t, Self::zone_level(zone)));
                            self.state = EdgeState::Stable(zone);
                            return true;
                        }
                        self.state = EdgeState::Stable(zone);
                    }
                }
            }

            if !self.pending.is_empty() {
                return true;
            }
        }
    }
}

impl<I> Iterator for FindEdges<I>
where
    I: Iterator<Item = SampleChunk>,
{
    type Item = Edge;

    fn next(&mut self) -> Option<Edge> {
        loop {
            if let Some(e) = self.pending.pop_front() {
                return Some(e);
            }
            if !self.advance() {
                return self.pending.pop_front();
            }
        }
    }
}

/// Generate `count` evenly spaced logic levels spanning `logic_levels`
/// (spec §4.4 / `ripyl.decode.expand_logic_levels`).
pub fn expand_logic_levels(logic_levels: (f64, f64), count: usize) -> Vec<f64> {
    if count < 3 {
        return vec![logic_levels.0, logic_levels.1];
    }
    let step = (logic_levels.1 - logic_levels.0) / (count - 1) as f64;
    (0..count).map(|i| logic_levels.0 + step * i as f64).collect()
}

/// Generate the `2*(N-1)` hysteresis thresholds for N logic states
/// (`ripyl.decode.gen_hyst_thresholds`).
pub fn gen_hyst_thresholds(logic_levels: &[f64], hysteresis: f64) -> Vec<f64> {
    assert!(logic_levels.len() >= 2, "at least two logic levels required");
    let hysteresis = hysteresis.clamp(0.0, 1.0);

    let centers: Vec<f64> = logic_levels.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();

    let mut hyst = Vec::with_capacity(centers.len() * 2);
    for (level, &c) in logic_levels.iter().zip(centers.iter()) {
        let h_top = (c - level) * (1.0 + hysteresis) + level;
        let h_bot = (c - level) * (1.0 - hysteresis) + level;
        hyst.push(h_bot);
        hyst.push(h_top);
    }
    hyst
}

/// Generalized multi-level edge detector (spec §4.4).
///
/// `hyst_thresholds` must have an even length (`2*(N-1)` thresholds for N
/// states), sorted ascending. Logic state coding is centered: for 3 states
/// it is `{-1, 0, 1}`; for 4 states `{-1, 0, 1, 2}`.
pub fn find_multi_edges<I>(samples: I, hyst_thresholds: Vec<f64>) -> Result<impl Iterator<Item = Edge>>
where
    I: Iterator<Item = SampleChunk>,
{
    if hyst_thresholds.len() % 2 != 0 {
        return Err(DecodeError::Stream(
            "hyst_thresholds must have an even length".into(),
        ));
    }
    let zone_offset = (hyst_thresholds.len() / 4) as i32;
    let center_thresholds: Vec<f64> = hyst_thresholds
        .chunks(2)
        .map(|p| (p[0] + p[1]) / 2.0)
        .collect();

    Ok(FindMultiEdges {
        chunks: samples,
        hyst_thresholds,
        center_thresholds,
        zone_offset,
        state: None,
        prev_stable: 0,
        pending: std::collections::VecDeque::new(),
        cur_chunk: None,
        chunk_idx: 0,
        t: 0.0,
        started: false,
    })
}

struct FindMultiEdges<I> {
    chunks: I,
    hyst_thresholds: Vec<f64>,
    center_thresholds: Vec<f64>,
    zone_offset: i32,
    /// `None` = START state. `Some(zone)` otherwise; even zones are stable.
    state: Option<usize>,
    prev_stable: usize,
    pending: std::collections::VecDeque<Edge>,
    cur_chunk: Option<SampleChunk>,
    chunk_idx: usize,
    t: f64,
    started: bool,
}

impl<I> FindMultiEdges<I>
where
    I: Iterator<Item = SampleChunk>,
{
    fn sample_zone(&self, sample: f64) -> usize {
        for (i, &th) in self.hyst_thresholds.iter().enumerate() {
            if sample <= th {
                return i;
            }
        }
        self.hyst_thresholds.len()
    }

    fn zone_to_logic(&self, zone: usize) -> i32 {
        (zone / 2) as i32 - self.zone_offset
    }

    fn advance(&mut self) -> bool {
        loop {
            if self.cur_chunk.is_none() {
                match self.chunks.next() {
                    Some(c) => {
                        self.t = c.start_time;
                        self.cur_chunk = Some(c);
                        self.chunk_idx = 0;
                    }
                    None => return false,
                }
            }

            let chunk = self.cur_chunk.as_ref().unwrap();
            if self.chunk_idx >= chunk.samples.len() {
                self.cur_chunk = None;
                continue;
            }

            if !self.started {
                self.started = true;
                let mut center_ix = self.center_thresholds.len();
                for (i, &c) in self.center_thresholds.iter().enumerate() {
                    if chunk.samples[0] <= c {
                        center_ix = i;
                        break;
                    }
                }
                let level = center_ix as i32 - self.zone_offset;
                self.pending.push_back(Edge::new(chunk.start_time, level));
            }

            let sample = chunk.samples[self.chunk_idx];
            let period = chunk.sample_period;
            let t = self.t;
            self.chunk_idx += 1;
            self.t += period;

            let zone = self.sample_zone(sample);
            let zone_is_stable = zone % 2 == 0;

            match self.state {
                None => {
                    if zone_is_stable {
                        self.state = Some(zone);
                    }
                }
                Some(cur) if cur % 2 == 0 => {
                    if zone_is_stable {
                        if zone != cur {
                            self.state = Some(zone);
                            self.pending.push_back(Edge::new(t, self.zone_to_logic(zone)));
                            return true;
                        }
                    } else {
                        self.prev_stable = cur;
                        self.state = Some(zone);
                    }
                }
                Some(_) => {
                    // last zone was transitional
                    if zone_is_stable {
                        if zone != self.prev_stable {
                            self.pending.push_back(Edge::new(t, self.zone_to_logic(zone)));
                        }
                    }
                    self.state = Some(zone);
                }
            }

            if !self.pending.is_empty() {
                return true;
            }
        }
    }
}

impl<I> Iterator for FindMultiEdges<I>
where
    I: Iterator<Item = SampleChunk>,
{
    type Item = Edge;

    fn next(&mut self) -> Option<Edge> {
        loop {
            if let Some(e) = self.pending.pop_front() {
                return Some(e);
            }
            if !self.advance() {
                return self.pending.pop_front();
            }
        }
    }
}

/// Merge adjacent edges whose time gap is below `min_state_period`,
/// replacing a transient spurious state (e.g. an SE0 glitch) with a single
/// edge at the midpoint (spec §4.4 companion filter).
pub fn remove_transitional_states<I>(mut edges: I, min_state_period: f64) -> Result<Vec<Edge>>
where
    I: Iterator<Item = Edge>,
{
    let mut prev_edge = edges.next().ok_or_else(|| DecodeError::Stream("unable to initialize edge stream".into()))?;

    let mut in_transition = false;
    let mut tran_start: Option<Edge> = None;
    let mut out = Vec::new();

    for edge in edges {
        let mut ts = edge.time - prev_edge.time;
        if in_transition {
            ts += prev_edge.time - tran_start.unwrap().time;
        }

        if ts >= min_state_period {
            if in_transition {
                let start = tran_start.unwrap();
                out.push(Edge::new((start.time + prev_edge.time) / 2.0, prev_edge.level));
                in_transition = false;
            } else {
                out.push(prev_edge);
            }
        } else if !in_transition {
            in_transition = true;
            tran_start = Some(prev_edge);
        }

        prev_edge = edge;
    }
    out.push(prev_edge);

    Ok(out)
}
