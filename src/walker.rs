//! Time-addressable cursors over edge streams (spec §4.6).
//!
//! Ground truth: `ripyl.streaming.EdgeSequence` / `MultiEdgeSequence`. A
//! decoder drives one of these forward in fixed or edge-aligned steps and
//! asks it for the logic level at the current cursor time.

use std::collections::HashMap;

use crate::edge::Edge;

/// A time-addressable cursor over a single edge stream.
pub struct EdgeSequence<I> {
    edges: I,
    current: Edge,
    next: Option<Edge>,
    cursor_time: f64,
    ended: bool,
}

impl<I> EdgeSequence<I>
where
    I: Iterator<Item = Edge>,
{
    /// `time_step` seeds the cursor at the first edge's time if `start_time`
    /// is not separately known; pass the stream's own start time as
    /// `start_time` when available.
    pub fn new(mut edges: I, start_time: f64) -> Self {
        let current = edges.next().unwrap_or(Edge::new(start_time, 0));
        let next = edges.next();
        Self {
            edges,
            current,
            next,
            cursor_time: start_time,
            ended: next.is_none(),
        }
    }

    /// Move `cursor_time` forward by `dt`, promoting edges as the cursor
    /// passes them.
    pub fn advance(&mut self, dt: f64) {
        self.cursor_time += dt;
        while let Some(n) = self.next {
            if self.cursor_time > n.time {
                self.current = n;
                self.next = self.edges.next();
            } else {
                break;
            }
        }
        if self.next.is_none() {
            self.ended = true;
        }
    }

    /// Move the cursor to the next edge whose level differs from the
    /// current level, skipping spurious same-level repeats. Returns the
    /// time delta covered, or `0.0` if the stream is exhausted first.
    pub fn advance_to_edge(&mut self) -> f64 {
        let start = self.cursor_time;
        loop {
            match self.next {
                Some(n) => {
                    if n.level != self.current.level {
                        self.cursor_time = n.time;
                        self.current = n;
                        self.next = self.edges.next();
                        if self.next.is_none() {
                            self.ended = true;
                        }
                        return self.cursor_time - start;
                    } else {
                        self.current = n;
                        self.next = self.edges.next();
                    }
                }
                None => {
                    self.ended = true;
                    return 0.0;
                }
            }
        }
    }

    pub fn cur_state(&self) -> i32 {
        self.current.level
    }

    pub fn cur_time(&self) -> f64 {
        self.cursor_time
    }

    pub fn at_end(&self) -> bool {
        self.ended
    }

    /// Peek the queued edge's time without moving the cursor (`ripyl`'s
    /// direct `es.next_states[0]` access). Protocols whose bit encoding
    /// depends on measuring a pulse width *before* deciding whether to
    /// consume it — J1850 VPW is the one in this crate — need this to
    /// avoid conflating "measure" with "advance".
    pub fn peek_next_time(&self) -> Option<f64> {
        self.next.map(|e| e.time)
    }
}

/// A named collection of [`EdgeSequence`]s sharing one time cursor (spec
/// §4.6 multi-edge variant), for decoders that must watch several lines at
/// once (SPI clock+data+chip-select, I2C SDA+SCL, CAN differential pair).
pub struct MultiEdgeSequence<I> {
    channels: HashMap<String, EdgeSequence<I>>,
    cursor_time: f64,
}

impl<I> MultiEdgeSequence<I>
where
    I: Iterator<Item = Edge>,
{
    pub fn new(channels: HashMap<String, I>, start_time: f64) -> Self {
        let seqs = channels
            .into_iter()
            .map(|(name, edges)| (name, EdgeSequence::new(edges, start_time)))
            .collect();
        Self {
            channels: seqs,
            cursor_time: start_time,
        }
    }

    /// Current level of a named channel. O(1).
    pub fn cur_state(&self, channel: &str) -> Option<i32> {
        self.channels.get(channel).map(|c| c.cur_state())
    }

    pub fn at_end(&self, channel: &str) -> bool {
        self.channels.get(channel).map(|c| c.at_end()).unwrap_or(true)
    }

    pub fn all_ended(&self) -> bool {
        self.channels.values().all(|c| c.at_end())
    }

    /// Advance every channel's cursor by `dt`.
    pub fn advance(&mut self, dt: f64) {
        self.cursor_time += dt;
        for seq in self.channels.values_mut() {
            seq.advance(dt);
        }
    }

    /// Advance to the earliest next edge across all still-live channels
    /// (or a single named channel if `channel` is `Some`), then
    /// fast-forward every other channel by the same `dt` to keep the
    /// shared cursor synchronized.
    pub fn advance_to_edge(&mut self, channel: Option<&str>) -> f64 {
        let target = match channel {
            Some(name) => {
                let Some(seq) = self.channels.get_mut(name) else {
                    return 0.0;
                };
                let dt = seq.advance_to_edge();
                dt
            }
            None => {
                let mut best: Option<(String, f64)> = None;
                for (name, seq) in self.channels.iter() {
                    if seq.at_end() {
                        continue;
                    }
                    if let Some(n) = seq.next {
                        if n.level != seq.current.level {
                            let gap = n.time - self.cursor_time;
                            if best.as_ref().map(|(_, b)| gap < *b).unwrap_or(true) {
                                best = Some((name.clone(), gap));
                            }
                        }
                    }
                }
                match best {
                    Some((name, _)) => self.channels.get_mut(&name).unwrap().advance_to_edge(),
                    None => 0.0,
                }
            }
        };

        if target > 0.0 {
            self.cursor_time += target;
            for (name, seq) in self.channels.iter_mut() {
                if Some(name.as_str()) != channel {
                    seq.advance(target);
                }
            }
        }
        target
    }

    pub fn cur_time(&self) -> f64 {
        self.cursor_time
    }

    /// Like [`Self::advance_to_edge`] with `channel = None`, but also
    /// reports which channel's edge the cursor landed on — needed by
    /// decoders (SPI, I2C, CAN) that must dispatch differently depending
    /// on *which* line just transitioned.
    pub fn next_event(&mut self) -> Option<(String, f64)> {
        let mut best: Option<(String, f64)> = None;
        for (name, seq) in self.channels.iter() {
            if seq.at_end() {
                continue;
            }
            if let Some(n) = seq.next {
                if n.level != seq.current.level {
                    let gap = n.time - self.cursor_time;
                    if best.as_ref().map(|(_, b)| gap < *b).unwrap_or(true) {
                        best = Some((name.clone(), gap));
                    }
                }
            }
        }
        let (name, dt) = best?;
        self.channels.get_mut(&name).unwrap().advance_to_edge();
        self.cursor_time += dt;
        for (n, seq) in self.channels.iter_mut() {
            if n != &name {
                seq.advance(dt);
            }
        }
        Some((name, self.cursor_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_to_edge_skips_repeated_levels() {
        let edges = vec![
            Edge::new(0.0, 0),
            Edge::new(1.0, 1),
            Edge::new(2.0, 1),
            Edge::new(3.0, 0),
        ];
        let mut seq = EdgeSequence::new(edges.into_iter(), 0.0);
        assert_eq!(seq.cur_state(), 0);
        let dt = seq.advance_to_edge();
        assert_eq!(dt, 1.0);
        assert_eq!(seq.cur_state(), 1);
        let dt2 = seq.advance_to_edge();
        assert_eq!(dt2, 2.0);
        assert_eq!(seq.cur_state(), 0);
        assert!(seq.at_end());
    }

    #[test]
    fn advance_moves_cursor_without_consuming_future_edges() {
        let edges = vec![Edge::new(0.0, 0), Edge::new(10.0, 1)];
        let mut seq = EdgeSequence::new(edges.into_iter(), 0.0);
        seq.advance(5.0);
        assert_eq!(seq.cur_state(), 0);
        assert_eq!(seq.cur_time(), 5.0);
        seq.advance(6.0);
        assert_eq!(seq.cur_state(), 1);
    }

    #[test]
    fn next_event_reports_the_triggering_channel() {
        let mut channels = HashMap::new();
        channels.insert("clk".to_string(), vec![Edge::new(0.0, 0), Edge::new(1.0, 1), Edge::new(2.0, 0)].into_iter());
        channels.insert("data".to_string(), vec![Edge::new(0.0, 1), Edge::new(5.0, 0)].into_iter());
        let mut mseq = MultiEdgeSequence::new(channels, 0.0);
        let (chan, t) = mseq.next_event().unwrap();
        assert_eq!(chan, "clk");
        assert_eq!(t, 1.0);
        let (chan2, t2) = mseq.next_event().unwrap();
        assert_eq!(chan2, "clk");
        assert_eq!(t2, 2.0);
    }

    #[test]
    fn multi_edge_sequence_tracks_named_channels() {
        let mut channels = HashMap::new();
        channels.insert("clk".to_string(), vec![Edge::new(0.0, 0), Edge::new(1.0, 1)].into_iter());
        channels.insert("data".to_string(), vec![Edge::new(0.0, 1), Edge::new(5.0, 0)].into_iter());
        let mut mseq = MultiEdgeSequence::new(channels, 0.0);
        assert_eq!(mseq.cur_state("clk"), Some(0));
        assert_eq!(mseq.cur_state("data"), Some(1));
        mseq.advance_to_edge(None);
        assert_eq!(mseq.cur_state("clk"), Some(1));
        assert_eq!(mseq.cur_time(), 1.0);
    }
}
