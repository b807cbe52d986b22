//! Protocol constants for the RangeLink wire format and link management.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// ASCII marker preceding every frame, used for stream resynchronization.
pub const FRAME_MARKER: [u8; 4] = *b"RGLK";

/// Size of the frame marker.
pub const FRAME_MARKER_SIZE: usize = 4;

/// Size of the `size` field following the marker.
pub const FRAME_SIZE_FIELD: usize = 2;

/// Common header after the size field:
/// kind + src + dest + packet_index + message_index
/// + fragment_index + fragment_count + attempt.
pub const FRAME_HEADER_SIZE: usize = 1 + 1 + 1 + 4 + 4 + 1 + 1 + 1;

/// Data frames append four 8-byte software timestamps before the payload.
pub const DATA_TIMESTAMP_BLOCK: usize = 4 * 8;

/// Ack frames append two 8-byte software timestamps (t2, t3).
pub const ACK_TIMESTAMP_BLOCK: usize = 2 * 8;

/// AckTime frames append one 8-byte capture timestamp.
pub const ACK_TIME_TIMESTAMP_BLOCK: usize = 8;

/// Frame kind: data frame carrying a message fragment.
pub const KIND_DATA: u8 = 1;

/// Frame kind: acknowledgment of a data frame.
pub const KIND_ACK: u8 = 2;

/// Frame kind: capture-clock send time of a previously sent ack.
pub const KIND_ACK_TIME: u8 = 3;

// =============================================================================
// FRAGMENTATION
// =============================================================================

/// Maximum fragments per message (`fragment_count` fits a signed byte).
pub const MAX_FRAGMENT_COUNT: usize = 127;

/// Byte-stream link MTU the payload bound is derived from.
pub const TRANSPORT_MTU: usize = 672;

/// Default maximum data-frame payload: MTU minus marker, size field,
/// common header, and timestamp block.
pub const DEFAULT_MAX_PAYLOAD: usize = TRANSPORT_MTU
    - FRAME_MARKER_SIZE
    - FRAME_SIZE_FIELD
    - FRAME_HEADER_SIZE
    - DATA_TIMESTAMP_BLOCK;

// =============================================================================
// RANGING
// =============================================================================

/// Speed of light in vacuum, meters per second.
pub const SPEED_OF_LIGHT_M_PER_S: f64 = 299_792_458.0;

// =============================================================================
// ESTABLISHMENT
// =============================================================================

/// Maximum concurrent point-to-point links of the radio (piconet limit);
/// bounds the service-identifier list.
pub const PICONET_LINK_LIMIT: usize = 7;

/// Well-known service ports, iterated in order by both establishment workers.
pub const SERVICE_PORTS: [u16; PICONET_LINK_LIMIT] =
    [42801, 42802, 42803, 42804, 42805, 42806, 42807];

/// Outbound connection attempts per service identifier.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Backoff between failed outbound connection attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

// =============================================================================
// MANAGER
// =============================================================================

/// Delay before a reconnect attempt after an unexpected disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Depth of the manager's fan-out event channel.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// Depth of a session's outbound write queue.
pub const SEND_QUEUE_DEPTH: usize = 64;

// =============================================================================
// SNOOP CAPTURE STREAM
// =============================================================================

/// Capture stream header magic.
pub const SNOOP_MAGIC: [u8; 8] = *b"btsnoop\0";

/// Capture stream header size: magic + version + datalink.
pub const SNOOP_HEADER_SIZE: usize = 16;

/// Supported capture stream version.
pub const SNOOP_VERSION: u32 = 1;

/// Capture record header size.
pub const SNOOP_RECORD_HEADER_SIZE: usize = 24;

/// Poll interval while waiting for the capture producer to flush more bytes.
pub const SNOOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_fits_mtu() {
        let overhead =
            FRAME_MARKER_SIZE + FRAME_SIZE_FIELD + FRAME_HEADER_SIZE + DATA_TIMESTAMP_BLOCK;
        assert_eq!(DEFAULT_MAX_PAYLOAD + overhead, TRANSPORT_MTU);
    }

    #[test]
    fn test_service_list_within_link_limit() {
        assert!(SERVICE_PORTS.len() <= PICONET_LINK_LIMIT);
    }
}
