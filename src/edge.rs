//! Edge stream data model (spec §3, §6).
//!
//! A finite, lazy, forward-only sequence of `(time, level)` pairs. For
//! binary signals `level` is 0 or 1; for multi-level signals it is
//! symmetric around zero. The first element is always the initial state
//! at `time = start_of_capture`. Subsequent elements mark strict level
//! changes. Times are strictly increasing.

/// A single edge: a strict change of line state (or the initial state).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub time: f64,
    pub level: i32,
}

impl Edge {
    pub fn new(time: f64, level: i32) -> Self {
        Self { time, level }
    }
}

/// Remove consecutive edges that repeat the same level.
///
/// Multi-channel synthesizers yield a new tuple on *any* channel
/// changing, so any one channel's projection contains spurious
/// same-level repeats. This is `ripyl.sigproc.remove_excess_edges`.
pub fn remove_excess_edges<I>(edges: I) -> RemoveExcessEdges<I>
where
    I: Iterator<Item = Edge>,
{
    RemoveExcessEdges {
        inner: edges,
        prev_state: None,
        pending: None,
        done: false,
    }
}

pub struct RemoveExcessEdges<I> {
    inner: I,
    prev_state: Option<i32>,
    pending: Option<Edge>,
    done: bool,
}

impl<I: Iterator<Item = Edge>> Iterator for RemoveExcessEdges<I> {
    type Item = Edge;

    fn next(&mut self) -> Option<Edge> {
        loop {
            match self.inner.next() {
                Some(e) => {
                    if self.prev_state.is_none() {
                        self.prev_state = Some(e.level);
                        return Some(e);
                    } else if Some(e.level) != self.prev_state {
                        self.prev_state = Some(e.level);
                        self.pending = None;
                        return Some(e);
                    } else {
                        self.pending = Some(e);
                        continue;
                    }
                }
                None => {
                    if self.done {
                        return None;
                    }
                    self.done = true;
                    return self.pending.take();
                }
            }
        }
    }
}

/// A type-erased edge stream. Protocol decoders chain several combinators
/// (invert, tee via [`buffer_prefix`], transition removal) ahead of a
/// [`crate::walker::EdgeSequence`); boxing keeps their struct definitions
/// readable instead of naming every combinator in the type.
pub type DynEdges = Box<dyn Iterator<Item = Edge>>;

/// Peek the first edge's time (the spec's "initial state at
/// `time = start_of_capture`") without losing it, for seeding an
/// [`crate::walker::EdgeSequence`].
pub fn peek_start_time<I>(edges: I) -> (f64, std::iter::Peekable<I>)
where
    I: Iterator<Item = Edge>,
{
    let mut p = edges.peekable();
    let t = p.peek().map(|e| e.time).unwrap_or(0.0);
    (t, p)
}

/// Buffer the first `n` edges of a stream, then hand back both the buffer
/// and an iterator that replays the buffer followed by the remainder of
/// the original stream.
///
/// This is the `tee` helper spec §9 calls for: a decoder that needs to
/// look at a prefix of edges for auto-baud/auto-speed detection (§4.5)
/// without losing them for the actual decode takes the prefix, inspects
/// it, then continues decoding from the replayed + remaining stream. The
/// buffer is bounded (`n`, usually 50 per spec §4.5/§4.8.1/§4.8.3/§4.8.4)
/// and dropped once both iterators have been consumed past it.
pub fn buffer_prefix<I>(mut edges: I, n: usize) -> (Vec<Edge>, std::iter::Chain<std::vec::IntoIter<Edge>, I>)
where
    I: Iterator<Item = Edge>,
{
    let mut buf = Vec::with_capacity(n);
    while buf.len() < n {
        match edges.next() {
            Some(e) => buf.push(e),
            None => break,
        }
    }
    let replay = buf.clone().into_iter().chain(edges);
    (buf, replay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_prefix_replays_everything() {
        let edges = vec![
            Edge::new(0.0, 0),
            Edge::new(1.0, 1),
            Edge::new(2.0, 0),
            Edge::new(3.0, 1),
        ];
        let (prefix, replayed) = buffer_prefix(edges.clone().into_iter(), 2);
        assert_eq!(prefix, vec![Edge::new(0.0, 0), Edge::new(1.0, 1)]);
        assert_eq!(replayed.collect::<Vec<_>>(), edges);
    }

    #[test]
    fn drops_repeated_levels_but_keeps_last() {
        let edges = vec![
            Edge::new(0.0, 1),
            Edge::new(1.0, 1),
            Edge::new(2.0, 0),
            Edge::new(3.0, 0),
            Edge::new(4.0, 0),
            Edge::new(5.0, 1),
        ];
        let out: Vec<_> = remove_excess_edges(edges.into_iter()).collect();
        assert_eq!(
            out,
            vec![Edge::new(0.0, 1), Edge::new(2.0, 0), Edge::new(5.0, 1)]
        );
    }
}
