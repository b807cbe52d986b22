//! Error types for the RangeLink protocol.

use thiserror::Error;

/// Errors decoding a frame from bytes.
///
/// A malformed frame is dropped by the receive path; it is never fatal to
/// the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame marker is absent at the expected offset.
    #[error("frame marker absent at offset {0}")]
    MissingMarker(usize),

    /// The buffer ends before the declared frame size.
    #[error("frame truncated: declared {declared} bytes, {available} available")]
    Truncated {
        /// Bytes the size field declared after itself.
        declared: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Declared size is below the minimum for the frame kind.
    #[error("frame size {size} below minimum {min} for kind {kind}")]
    SizeBelowMinimum {
        /// Declared size.
        size: usize,
        /// Minimum size for the kind.
        min: usize,
        /// The frame kind byte.
        kind: u8,
    },

    /// Unrecognized frame kind byte.
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Fragment index is not below the fragment count.
    #[error("fragment index {index} out of range for count {count}")]
    FragmentIndexOutOfRange {
        /// The fragment index.
        index: u8,
        /// The fragment count.
        count: u8,
    },
}

/// Errors splitting a message into fragments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// The message would need more fragments than the count byte can carry.
    /// Nothing is transmitted.
    #[error("message of {len} bytes needs {needed} fragments, limit is {limit}")]
    TooManyFragments {
        /// Message length in bytes.
        len: usize,
        /// Fragments the message would need.
        needed: usize,
        /// Maximum fragments per message.
        limit: usize,
    },

    /// A zero maximum payload cannot carry anything.
    #[error("max payload must be nonzero")]
    ZeroPayload,
}

/// Errors in a ranging session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A frame with this correlation identity was already recorded.
    #[error("duplicate frame: src {src} dest {dest} packet {packet_index}")]
    DuplicateFrame {
        /// Source device id.
        src: u8,
        /// Destination device id.
        dest: u8,
        /// Packet index.
        packet_index: u32,
    },

    /// Fragmentation failed before any transmission.
    #[error(transparent)]
    Fragment(#[from] FragmentError),

    /// The underlying transport closed; the session transitions to
    /// `Disconnected`.
    #[error("transport closed")]
    TransportClosed,

    /// I/O error on the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors establishing a connection to a remote device.
#[derive(Debug, Error)]
pub enum EstablishError {
    /// Both workers exhausted the service-identifier list.
    #[error("no service identifier yielded a connection")]
    Exhausted,

    /// More service identifiers than the radio supports concurrent links.
    #[error("service list of {0} exceeds the link limit")]
    ServiceListTooLong(usize),

    /// The peer address has no advertised name in the directory.
    #[error("no advertised name known for {0}")]
    UnknownPeer(std::net::IpAddr),

    /// The advertised name carries no parsable device id suffix.
    #[error("no device id suffix in advertised name {0:?}")]
    IdentityParse(String),

    /// I/O error while accepting or connecting.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reading a snoop capture stream.
#[derive(Debug, Error)]
pub enum SnoopError {
    /// The stream header magic or version is wrong. The only fatal
    /// correlator error; everything else is retried.
    #[error("not a capture stream: {0}")]
    BadHeader(String),

    /// Fewer bytes available than a complete header or record; the
    /// producer has not flushed yet. Transient.
    #[error("short read: wanted {wanted}, got {got}")]
    ShortRead {
        /// Bytes wanted.
        wanted: usize,
        /// Bytes available.
        got: usize,
    },

    /// I/O error on the capture file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level RangeLink errors.
#[derive(Debug, Error)]
pub enum RangeLinkError {
    /// Frame codec error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Fragmentation error.
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Establishment error.
    #[error("establish error: {0}")]
    Establish(#[from] EstablishError),

    /// Capture stream error.
    #[error("snoop error: {0}")]
    Snoop(#[from] SnoopError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
