//! RangeLink snoop layer: capture stream parsing and the log correlator.
//!
//! The radio stack timestamps every frame it moves in a lower-layer
//! capture log. Re-reading those timestamps bounds OS scheduling jitter
//! out of the range estimate; a sample built from capture timestamps is
//! preferred over its software twin.

mod correlator;
mod record;

pub use correlator::{SnoopEvent, classify};
pub use record::{CaptureRecord, StreamHeader};

#[cfg(feature = "transport")]
pub use correlator::SnoopCorrelator;
