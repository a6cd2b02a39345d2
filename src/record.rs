//! Hierarchical decoded-output record model (spec §3, §6).
//!
//! Records are produced by decoders and never mutated once yielded. The
//! `subrecords` tree is owned by the root record; consumers traverse
//! top-down (spec §9 — no parent back-references).

use serde::{Deserialize, Serialize};

/// Ordered error severity. `Ok < Warning < Error < protocol-specific`.
///
/// Protocol-specific codes are contiguous with, and greater than, `Error`
/// (spec §6). Each protocol decoder defines its own codes starting at
/// [`Status::ERROR`] `+ 1` and implements [`Status::describe`] to give
/// them a human-readable name without the caller needing to know which
/// protocol produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Status(pub u32);

impl Status {
    pub const OK: Status = Status(0);
    pub const WARNING: Status = Status(100);
    pub const ERROR: Status = Status(200);

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    pub fn is_error(self) -> bool {
        self >= Status::ERROR
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::OK
    }
}

/// A single hierarchical output unit from a decoder.
///
/// Unifies the source's `StreamSegment` (time-bounded) and `StreamEvent`
/// (point-in-time) variants: an event is modeled as a segment whose
/// `start_time == end_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord<D> {
    pub start_time: f64,
    pub end_time: f64,
    /// Free-form tag, e.g. `"UART frame"`, `"I2C start"`, `"start bit"`.
    pub kind: &'static str,
    pub data: Option<D>,
    pub status: Status,
    pub subrecords: Vec<StreamRecord<D>>,
}

impl<D> StreamRecord<D> {
    /// A time-bounded record (spec's `Segment`).
    pub fn segment(start_time: f64, end_time: f64, kind: &'static str, data: Option<D>, status: Status) -> Self {
        Self {
            start_time,
            end_time,
            kind,
            data,
            status,
            subrecords: Vec::new(),
        }
    }

    /// A point-in-time record (spec's `Event`).
    pub fn event(time: f64, kind: &'static str, data: Option<D>, status: Status) -> Self {
        Self::segment(time, time, kind, data, status)
    }

    pub fn with_subrecords(mut self, subrecords: Vec<StreamRecord<D>>) -> Self {
        self.subrecords = subrecords;
        self
    }

    pub fn push_subrecord(&mut self, sub: StreamRecord<D>) {
        self.subrecords.push(sub);
    }

    /// The maximum status of this record and all of its descendants.
    pub fn nested_status(&self) -> Status {
        self.subrecords
            .iter()
            .map(|s| s.nested_status())
            .fold(self.status, Status::max)
    }

    pub fn is_event(&self) -> bool {
        self.start_time == self.end_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_status_bubbles_worst_descendant() {
        let mut root: StreamRecord<u8> = StreamRecord::segment(0.0, 10.0, "frame", Some(0), Status::OK);
        let mut child = StreamRecord::segment(0.0, 5.0, "field", Some(0), Status::OK);
        let grandchild = StreamRecord::segment(1.0, 2.0, "bit", None, Status(250));
        child.push_subrecord(grandchild);
        root.push_subrecord(child);

        assert_eq!(root.nested_status(), Status(250));
        assert_eq!(root.status, Status::OK);
    }

    #[test]
    fn event_has_equal_bounds() {
        let e: StreamRecord<()> = StreamRecord::event(3.0, "I2C start", None, Status::OK);
        assert!(e.is_event());
        assert_eq!(e.start_time, e.end_time);
    }
}
