//! RangeLink wire layer: frame codec and message fragmentation.
//!
//! Framing only, no behavior: the session layer decides what to do with a
//! decoded frame, this layer decides only what the bytes mean.

mod fragment;
mod frame;

pub use fragment::{Reassembler, fragment};
pub use frame::{AckFrame, AckTimeFrame, DataFrame, Frame, FrameHeader, FrameKind, scan_marker};
