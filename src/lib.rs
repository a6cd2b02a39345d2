//! `protodecode` — decode serial communication protocols from sampled
//! waveforms or pre-processed edge-transition lists.
//!
//! The crate is a pull-based pipeline of lazy sequences, lowest level
//! first:
//!
//! ```text
//! samples -> (levels)  -> thresholds
//! samples -> (detect)  -> edges
//! edges   -> (rate)    -> baud
//! edges   -> (walker)  -> positioned state queries
//! edges   -> (protocol decoders) -> stream records
//! ```
//!
//! `synth` provides the inverse path (records -> edges -> samples) used by
//! every decoder's tests. See `DESIGN.md` in the crate root for the
//! grounding of each module.

pub mod bitops;
pub mod detect;
pub mod edge;
pub mod error;
pub mod histogram;
pub mod levels;
pub mod protocol;
pub mod rate;
pub mod record;
pub mod sample;
pub mod stats;
pub mod synth;
pub mod walker;

pub use error::{DecodeError, Result};
