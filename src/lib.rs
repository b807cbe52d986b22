//! # RangeLink
//!
//! RangeLink estimates the distance between mobile radios by timing round
//! trips of small framed packets over a short-range, connection-oriented
//! byte-stream link, and by independently re-measuring the same round
//! trips with hardware-level timestamps pulled from the radio stack's
//! packet-capture log, so that OS scheduling jitter can be bounded out of
//! the estimate.
//!
//! A round trip yields four timestamps - data sent (`t1`), data received
//! (`t2`), ack sent (`t3`), ack received (`t4`) - and one sample:
//!
//! ```text
//! distance = c * ((t4 - t1) - (t3 - t2)) / 2
//! ```
//!
//! Every subtraction stays within one device's clock, so the estimate
//! needs no clock synchronization between devices.
//!
//! ## Feature Flags
//!
//! - `transport` (default): streams, establishment, live sessions, and
//!   capture-log tailing (requires tokio). Without it the crate still
//!   provides the wire codec, fragmentation, and the pure ranging state
//!   machine.
//!
//! ## Modules
//!
//! - [`core`]: Constants, error taxonomy, device identity
//! - [`wire`]: Frame codec and message fragmentation
//! - [`session`]: Per-device ranging state machine and session loops
//! - [`link`]: Transport streams, the establishment race, and the
//!   connection manager (requires `transport`)
//! - [`snoop`]: Capture stream parsing and the log correlator
//!
//! ## Example Usage
//!
//! ```no_run
//! use rangelink::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut directory = PeerDirectory::new();
//! directory.insert("192.168.4.17".parse()?, "ranger-2");
//!
//! let config = ConnectionManagerBuilder::new()
//!     .local_device(DeviceId(1))
//!     .directory(directory)
//!     .reconnect(true)
//!     .build();
//! let (manager, mut events) = ConnectionManager::new(config);
//!
//! manager.connect(DeviceId(2), Some("192.168.4.17".parse()?)).await;
//! manager.attach_snoop("/var/log/radio/btsnoop_hci.log").await;
//! manager.send_text(DeviceId(2), "hi").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let LinkEvent::Sample(sample) = event {
//!         println!("{} is {:.2} m away ({:?})",
//!             sample.device, sample.distance_m, sample.source);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire codec and fragmentation (always included)
pub mod wire;

// Ranging session layer (pure state machine always included; IO loops
// require the transport feature)
pub mod session;

// Capture stream parsing and correlation (tailing requires transport)
pub mod snoop;

// Link layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod link;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{DeviceId, RangeLinkError};
    pub use crate::session::{RangeSample, RangingState, SampleSource};
    pub use crate::snoop::SnoopEvent;
    pub use crate::wire::{Frame, FrameKind};

    #[cfg(feature = "transport")]
    pub use crate::link::{
        ConnectionManager, ConnectionManagerBuilder, LinkEvent, LinkState, ManagerConfig,
        PeerDirectory, ServiceId,
    };
    #[cfg(feature = "transport")]
    pub use crate::session::{RangingSession, SessionEvent};
}

// Re-export commonly used items at crate root
pub use crate::core::{DeviceId, RangeLinkError};
pub use crate::session::{RangeSample, SampleSource};
pub use crate::wire::{Frame, FrameKind};

#[cfg(feature = "transport")]
pub use crate::link::{ConnectionManager, LinkEvent, LinkState};
