//! Capture stream parsing.
//!
//! The radio stack's snoop log is a binary stream: a 16-byte header
//! (magic, version, datalink), then records of a 24-byte header and a
//! variable payload. Record payload length sits at byte offset 4 of the
//! record header and the capture timestamp at offset 16; all integers
//! are big-endian.
//!
//! Capture timestamps are microseconds on the capture clock. They are
//! never compared against software timestamps, only against each other.

use crate::core::SnoopError;
use crate::core::constants::{
    SNOOP_HEADER_SIZE, SNOOP_MAGIC, SNOOP_RECORD_HEADER_SIZE, SNOOP_VERSION,
};

/// The capture stream's fixed-size file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Format version; only [`SNOOP_VERSION`] is accepted.
    pub version: u32,
    /// Link-layer type the capture was taken on.
    pub datalink: u32,
}

impl StreamHeader {
    /// Parse and validate the stream header.
    pub fn parse(buf: &[u8]) -> Result<Self, SnoopError> {
        if buf.len() < SNOOP_HEADER_SIZE {
            return Err(SnoopError::ShortRead {
                wanted: SNOOP_HEADER_SIZE,
                got: buf.len(),
            });
        }
        if buf[..8] != SNOOP_MAGIC {
            return Err(SnoopError::BadHeader("magic mismatch".into()));
        }
        let version = u32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice"));
        if version != SNOOP_VERSION {
            return Err(SnoopError::BadHeader(format!(
                "unsupported version {version}"
            )));
        }
        let datalink = u32::from_be_bytes(buf[12..16].try_into().expect("4-byte slice"));
        Ok(Self { version, datalink })
    }

    /// Encode the header (capture producers and test fixtures).
    pub fn to_bytes(&self) -> [u8; SNOOP_HEADER_SIZE] {
        let mut buf = [0u8; SNOOP_HEADER_SIZE];
        buf[..8].copy_from_slice(&SNOOP_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.datalink.to_be_bytes());
        buf
    }
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self {
            version: SNOOP_VERSION,
            datalink: 0,
        }
    }
}

/// One capture record: a timestamped copy of a frame that crossed the
/// radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// Length of the frame as seen on the air.
    pub original_length: u32,
    /// Direction and status flags.
    pub flags: u32,
    /// Frames dropped by the capture engine before this record.
    pub cumulative_drops: u32,
    /// Capture-clock timestamp, microseconds.
    pub timestamp_us: u64,
    /// Captured payload (`included_length` bytes).
    pub payload: Vec<u8>,
}

impl CaptureRecord {
    /// Parse one record from the start of `buf`.
    ///
    /// Returns the record and the bytes consumed, or
    /// [`SnoopError::ShortRead`] when the producer has not flushed the
    /// whole record yet; the caller waits and retries from the same mark.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), SnoopError> {
        if buf.len() < SNOOP_RECORD_HEADER_SIZE {
            return Err(SnoopError::ShortRead {
                wanted: SNOOP_RECORD_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let original_length = u32::from_be_bytes(buf[0..4].try_into().expect("4-byte slice"));
        let included_length =
            u32::from_be_bytes(buf[4..8].try_into().expect("4-byte slice")) as usize;
        let flags = u32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let cumulative_drops = u32::from_be_bytes(buf[12..16].try_into().expect("4-byte slice"));
        let timestamp_us = u64::from_be_bytes(buf[16..24].try_into().expect("8-byte slice"));

        let total = SNOOP_RECORD_HEADER_SIZE + included_length;
        if buf.len() < total {
            return Err(SnoopError::ShortRead {
                wanted: total,
                got: buf.len(),
            });
        }
        let payload = buf[SNOOP_RECORD_HEADER_SIZE..total].to_vec();
        Ok((
            Self {
                original_length,
                flags,
                cumulative_drops,
                timestamp_us,
                payload,
            },
            total,
        ))
    }

    /// Encode the record (capture producers and test fixtures).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SNOOP_RECORD_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.original_length.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.cumulative_drops.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Convenience constructor for a fully-captured frame.
    pub fn of(payload: Vec<u8>, timestamp_us: u64, flags: u32) -> Self {
        Self {
            original_length: payload.len() as u32,
            flags,
            cumulative_drops: 0,
            timestamp_us,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_roundtrip() {
        let header = StreamHeader {
            version: SNOOP_VERSION,
            datalink: 1002,
        };
        let parsed = StreamHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_stream_header_bad_magic() {
        let mut bytes = StreamHeader::default().to_bytes();
        bytes[0] = b'x';
        assert!(matches!(
            StreamHeader::parse(&bytes),
            Err(SnoopError::BadHeader(_))
        ));
    }

    #[test]
    fn test_stream_header_bad_version() {
        let mut bytes = StreamHeader::default().to_bytes();
        bytes[11] = 9;
        assert!(matches!(
            StreamHeader::parse(&bytes),
            Err(SnoopError::BadHeader(_))
        ));
    }

    #[test]
    fn test_stream_header_short() {
        assert!(matches!(
            StreamHeader::parse(&[0u8; 10]),
            Err(SnoopError::ShortRead { wanted: 16, got: 10 })
        ));
    }

    #[test]
    fn test_record_roundtrip() {
        let record = CaptureRecord::of(b"frame bytes".to_vec(), 123_456_789, 1);
        let bytes = record.to_bytes();
        let (parsed, consumed) = CaptureRecord::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_field_offsets() {
        // Payload length at offset 4, timestamp at offset 16.
        let record = CaptureRecord::of(vec![0xAB; 3], 0x0102030405060708, 0);
        let bytes = record.to_bytes();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        assert_eq!(&bytes[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_record_short_header() {
        let result = CaptureRecord::parse(&[0u8; 20]);
        assert!(matches!(
            result,
            Err(SnoopError::ShortRead { wanted: 24, got: 20 })
        ));
    }

    #[test]
    fn test_record_short_payload() {
        let record = CaptureRecord::of(vec![1, 2, 3, 4], 0, 0);
        let bytes = record.to_bytes();
        let result = CaptureRecord::parse(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(SnoopError::ShortRead { .. })));
    }

    #[test]
    fn test_two_records_sequential() {
        let first = CaptureRecord::of(b"one".to_vec(), 10, 0);
        let second = CaptureRecord::of(b"two".to_vec(), 20, 1);
        let mut bytes = first.to_bytes();
        bytes.extend_from_slice(&second.to_bytes());

        let (a, used) = CaptureRecord::parse(&bytes).unwrap();
        let (b, _) = CaptureRecord::parse(&bytes[used..]).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
    }
}
