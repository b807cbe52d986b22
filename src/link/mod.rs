//! RangeLink link layer: transport streams, establishment, and the
//! connection manager.
//!
//! - **Stream wrapper**: [`LinkStream`] with framed reads and marker
//!   resynchronization
//! - **Establishment race**: [`establish`] runs an accept worker against a
//!   connect worker over the well-known service list
//! - **Manager**: [`ConnectionManager`] owns one establisher + session per
//!   remote device and fans out [`LinkEvent`]s

mod establish;
mod manager;
mod stream;

pub use establish::{
    AddressFilter, EstablishConfig, Established, PeerDirectory, ServiceId, default_services,
    establish,
};
pub use manager::{
    ConnectionManager, ConnectionManagerBuilder, LinkEvent, LinkState, ManagerConfig,
};
pub use stream::{FrameReader, FrameWriter, LinkStream};
