//! RangeLink session layer: per-device ranging over one established link.
//!
//! Implements:
//! - Outstanding-packet tracking with software and hardware timestamp sets
//! - The send path (fragment, stamp, transmit, record)
//! - The receive path (duplicate guard, ack synthesis, sample emission)
//! - Capture-log event folding for hardware-grade samples

mod pending;
mod ranging;

pub use pending::{ExchangeKey, PendingOutbound, RangeSample, SampleSource, distance_m};
pub use ranging::{FrameEffects, RangingState};

#[cfg(feature = "transport")]
pub use ranging::{RangingSession, SessionEvent};
