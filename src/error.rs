//! Error taxonomy for the decode pipeline (spec §7).
//!
//! Fatal conditions abort a decoder and surface here. Non-fatal conditions
//! (framing, parity, CRC, stuffing, ack errors) never produce an `Err` —
//! they're attached to the affected [`crate::record::StreamRecord`] as a
//! [`crate::record::Status`] and the decoder resynchronizes on the next
//! frame boundary.

use thiserror::Error;

/// Fatal error from the shared signal-processing / decode substrate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// The logic-level detector could not find two histogram peaks.
    #[error("unable to auto-detect logic levels")]
    AutoLevel,

    /// The symbol-rate estimator could not establish a baud/bit rate.
    #[error("unable to auto-detect symbol rate")]
    AutoRate,

    /// A generic pipeline contract violation (e.g. too few edges to start
    /// a walker, or an empty upstream iterator).
    #[error("stream error: {0}")]
    Stream(String),

    /// A histogram/KDE could not be built because the input samples had no
    /// variation.
    #[error("no variation in sample population")]
    NoVariation,
}

pub type Result<T> = std::result::Result<T, DecodeError>;
