//! RangeLink core: constants, error taxonomy, and device identity.
//!
//! Everything here is independent of the async transport layer and always
//! compiled.

pub mod constants;
mod device;
mod error;

pub use device::{DeviceId, now_ns};
pub use error::{
    EstablishError, FragmentError, FrameError, RangeLinkError, SessionError, SnoopError,
};
