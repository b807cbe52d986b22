//! Frame encoding and decoding.
//!
//! Every frame starts with a constant ASCII marker (stream
//! resynchronization), a 2-byte size field covering everything after
//! itself, and a 14-byte common header. The three kinds differ only in
//! their timestamp block and, for data frames, a payload:
//!
//! ```text
//! +--------+------+------+-----+------+--------+--------+------+-------+---------+
//! | marker | size | kind | src | dest | packet | message| frag | frag  | attempt |
//! | "RGLK" | u16  | u8   | u8  | u8   | index  | index  | index| count | u8      |
//! |        |      |      |     |      | u32    | u32    | u8   | u8    |         |
//! +--------+------+------+-----+------+--------+--------+------+-------+---------+
//! | Data:    t1 t2 t3 t4 (4 x u64) + payload                                     |
//! | Ack:     t2 t3 (2 x u64)                                                     |
//! | AckTime: radio_ack_sent (u64)                                                |
//! +------------------------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. Encoding is pure except
//! [`DataFrame::encode_for_send`], which stamps `t1_sent` immediately
//! before serialization so the timestamp reflects wire-send time rather
//! than queueing time.

use crate::core::DeviceId;
use crate::core::FrameError;
use crate::core::constants::{
    ACK_TIME_TIMESTAMP_BLOCK, ACK_TIMESTAMP_BLOCK, DATA_TIMESTAMP_BLOCK, FRAME_HEADER_SIZE,
    FRAME_MARKER, FRAME_MARKER_SIZE, FRAME_SIZE_FIELD, KIND_ACK, KIND_ACK_TIME, KIND_DATA,
};

/// Frame kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Data frame carrying one message fragment.
    Data = KIND_DATA,
    /// Acknowledgment of a data frame.
    Ack = KIND_ACK,
    /// Capture-clock send time of a previously sent ack.
    AckTime = KIND_ACK_TIME,
}

impl FrameKind {
    /// Parse a kind from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            KIND_DATA => Some(Self::Data),
            KIND_ACK => Some(Self::Ack),
            KIND_ACK_TIME => Some(Self::AckTime),
            _ => None,
        }
    }

    /// Wire byte of this kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Common header shared by all three frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sending device.
    pub src: DeviceId,
    /// Receiving device.
    pub dest: DeviceId,
    /// 0-based sender-local packet counter, per source device.
    pub packet_index: u32,
    /// 0-based message counter the carried fragment belongs to.
    pub message_index: u32,
    /// 0-based index of this fragment within its message.
    pub fragment_index: u8,
    /// 1-based total fragments of the message.
    pub fragment_count: u8,
    /// 1-based retry counter.
    pub attempt: u8,
}

impl FrameHeader {
    fn write_to(&self, kind: FrameKind, buf: &mut Vec<u8>) {
        buf.push(kind.as_byte());
        buf.push(self.src.as_u8());
        buf.push(self.dest.as_u8());
        buf.extend_from_slice(&self.packet_index.to_be_bytes());
        buf.extend_from_slice(&self.message_index.to_be_bytes());
        buf.push(self.fragment_index);
        buf.push(self.fragment_count);
        buf.push(self.attempt);
    }

    /// Parse the common header from a complete frame body.
    fn read_from(body: &[u8]) -> Result<Self, FrameError> {
        let header = Self {
            src: DeviceId(body[1]),
            dest: DeviceId(body[2]),
            packet_index: u32::from_be_bytes([body[3], body[4], body[5], body[6]]),
            message_index: u32::from_be_bytes([body[7], body[8], body[9], body[10]]),
            fragment_index: body[11],
            fragment_count: body[12],
            attempt: body[13],
        };
        if header.fragment_index >= header.fragment_count {
            return Err(FrameError::FragmentIndexOutOfRange {
                index: header.fragment_index,
                count: header.fragment_count,
            });
        }
        Ok(header)
    }
}

/// A data frame: one fragment of an application message plus the four
/// software timestamps accumulated over the frame's round trip.
///
/// `t1_sent` is stamped by [`DataFrame::encode_for_send`]; the remaining
/// timestamps start unset (zero) and are filled in by later events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Common header.
    pub header: FrameHeader,
    /// Software time the source put the frame on the wire.
    pub t1_sent: u64,
    /// Software time the destination received the frame.
    pub t2_received: u64,
    /// Software time the destination sent its ack.
    pub t3_ack_sent: u64,
    /// Software time the source received the ack.
    pub t4_ack_received: u64,
    /// Fragment bytes.
    pub payload: Vec<u8>,
}

impl DataFrame {
    /// Create a data frame with unset timestamps.
    pub fn new(header: FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            t1_sent: 0,
            t2_received: 0,
            t3_ack_sent: 0,
            t4_ack_received: 0,
            payload,
        }
    }

    /// Stamp `t1_sent` with the given clock reading, then encode.
    ///
    /// The one impure spot of the codec: the stamp happens immediately
    /// before serialization so it reflects true wire-send time.
    pub fn encode_for_send(&mut self, now_ns: u64) -> Vec<u8> {
        self.t1_sent = now_ns;
        Frame::Data(self.clone()).encode()
    }

    fn body_size(&self) -> usize {
        FRAME_HEADER_SIZE + DATA_TIMESTAMP_BLOCK + self.payload.len()
    }
}

/// Acknowledgment of a data frame, carrying the destination's two
/// software timestamps.
///
/// An ack may be re-sent if the correlating timing information later
/// changes (the capture log supplies a hardware-grade `t2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    /// Common header; `src`/`dest` are reversed relative to the data
    /// frame, correlation fields are copied from it.
    pub header: FrameHeader,
    /// Time the destination received the data frame.
    pub t2_received: u64,
    /// Time the destination sent this ack.
    pub t3_ack_sent: u64,
}

impl AckFrame {
    /// Build the ack for a received data frame.
    pub fn for_data(data: &DataFrame, t2_received: u64, t3_ack_sent: u64) -> Self {
        Self {
            header: FrameHeader {
                src: data.header.dest,
                dest: data.header.src,
                ..data.header
            },
            t2_received,
            t3_ack_sent,
        }
    }
}

/// Capture-clock send time of a previously sent ack, produced only by the
/// snoop log correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckTimeFrame {
    /// Common header; same orientation as the ack it reports on.
    pub header: FrameHeader,
    /// Capture timestamp of the ack leaving the destination's radio.
    pub radio_ack_sent: u64,
}

/// A decoded frame of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Data frame.
    Data(DataFrame),
    /// Acknowledgment frame.
    Ack(AckFrame),
    /// Acknowledgment-timing frame.
    AckTime(AckTimeFrame),
}

impl Frame {
    /// Kind discriminant of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data(_) => FrameKind::Data,
            Frame::Ack(_) => FrameKind::Ack,
            Frame::AckTime(_) => FrameKind::AckTime,
        }
    }

    /// Common header of this frame.
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Data(f) => &f.header,
            Frame::Ack(f) => &f.header,
            Frame::AckTime(f) => &f.header,
        }
    }

    /// Bytes following the size field.
    pub fn body_size(&self) -> usize {
        match self {
            Frame::Data(f) => f.body_size(),
            Frame::Ack(_) => FRAME_HEADER_SIZE + ACK_TIMESTAMP_BLOCK,
            Frame::AckTime(_) => FRAME_HEADER_SIZE + ACK_TIME_TIMESTAMP_BLOCK,
        }
    }

    /// Total encoded size including marker and size field.
    pub fn wire_size(&self) -> usize {
        FRAME_MARKER_SIZE + FRAME_SIZE_FIELD + self.body_size()
    }

    /// Encode to wire bytes. Pure; see [`DataFrame::encode_for_send`] for
    /// the stamping variant used on the send path.
    pub fn encode(&self) -> Vec<u8> {
        let body_size = self.body_size();
        let mut buf = Vec::with_capacity(FRAME_MARKER_SIZE + FRAME_SIZE_FIELD + body_size);
        buf.extend_from_slice(&FRAME_MARKER);
        buf.extend_from_slice(&(body_size as u16).to_be_bytes());
        match self {
            Frame::Data(f) => {
                f.header.write_to(FrameKind::Data, &mut buf);
                buf.extend_from_slice(&f.t1_sent.to_be_bytes());
                buf.extend_from_slice(&f.t2_received.to_be_bytes());
                buf.extend_from_slice(&f.t3_ack_sent.to_be_bytes());
                buf.extend_from_slice(&f.t4_ack_received.to_be_bytes());
                buf.extend_from_slice(&f.payload);
            }
            Frame::Ack(f) => {
                f.header.write_to(FrameKind::Ack, &mut buf);
                buf.extend_from_slice(&f.t2_received.to_be_bytes());
                buf.extend_from_slice(&f.t3_ack_sent.to_be_bytes());
            }
            Frame::AckTime(f) => {
                f.header.write_to(FrameKind::AckTime, &mut buf);
                buf.extend_from_slice(&f.radio_ack_sent.to_be_bytes());
            }
        }
        buf
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// Returns the frame and the bytes consumed. Fails if the marker is
    /// absent at offset 0, the declared size exceeds the available bytes,
    /// or the kind is unrecognized.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        if buf.len() < FRAME_MARKER_SIZE || buf[..FRAME_MARKER_SIZE] != FRAME_MARKER {
            return Err(FrameError::MissingMarker(0));
        }
        let after_marker = &buf[FRAME_MARKER_SIZE..];
        if after_marker.len() < FRAME_SIZE_FIELD {
            return Err(FrameError::Truncated {
                declared: FRAME_SIZE_FIELD,
                available: after_marker.len(),
            });
        }
        let declared = u16::from_be_bytes([after_marker[0], after_marker[1]]) as usize;
        let body = &after_marker[FRAME_SIZE_FIELD..];
        if body.len() < declared {
            return Err(FrameError::Truncated {
                declared,
                available: body.len(),
            });
        }
        let body = &body[..declared];
        if declared < FRAME_HEADER_SIZE {
            return Err(FrameError::SizeBelowMinimum {
                size: declared,
                min: FRAME_HEADER_SIZE,
                kind: 0,
            });
        }
        let kind_byte = body[0];
        let kind = FrameKind::from_byte(kind_byte).ok_or(FrameError::UnknownKind(kind_byte))?;
        let min = match kind {
            FrameKind::Data => FRAME_HEADER_SIZE + DATA_TIMESTAMP_BLOCK,
            FrameKind::Ack => FRAME_HEADER_SIZE + ACK_TIMESTAMP_BLOCK,
            FrameKind::AckTime => FRAME_HEADER_SIZE + ACK_TIME_TIMESTAMP_BLOCK,
        };
        if declared < min {
            return Err(FrameError::SizeBelowMinimum {
                size: declared,
                min,
                kind: kind_byte,
            });
        }
        let header = FrameHeader::read_from(body)?;
        let tail = &body[FRAME_HEADER_SIZE..];
        let frame = match kind {
            FrameKind::Data => Frame::Data(DataFrame {
                header,
                t1_sent: read_u64(tail, 0),
                t2_received: read_u64(tail, 8),
                t3_ack_sent: read_u64(tail, 16),
                t4_ack_received: read_u64(tail, 24),
                payload: tail[DATA_TIMESTAMP_BLOCK..].to_vec(),
            }),
            FrameKind::Ack => Frame::Ack(AckFrame {
                header,
                t2_received: read_u64(tail, 0),
                t3_ack_sent: read_u64(tail, 8),
            }),
            FrameKind::AckTime => Frame::AckTime(AckTimeFrame {
                header,
                radio_ack_sent: read_u64(tail, 0),
            }),
        };
        Ok((frame, FRAME_MARKER_SIZE + FRAME_SIZE_FIELD + declared))
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(buf[at..at + 8].try_into().expect("8-byte slice"))
}

/// Offset of the next frame marker in `buf`, if any.
///
/// Used both for resynchronizing a corrupted byte stream and for locating
/// an embedded frame inside a capture-record payload.
pub fn scan_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MARKER_SIZE)
        .position(|w| w == &FRAME_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(src: u8, dest: u8, packet: u32) -> FrameHeader {
        FrameHeader {
            src: DeviceId(src),
            dest: DeviceId(dest),
            packet_index: packet,
            message_index: 3,
            fragment_index: 0,
            fragment_count: 1,
            attempt: 1,
        }
    }

    #[test]
    fn test_kind_roundtrip() {
        for k in [FrameKind::Data, FrameKind::Ack, FrameKind::AckTime] {
            assert_eq!(FrameKind::from_byte(k.as_byte()), Some(k));
        }
        assert_eq!(FrameKind::from_byte(0x00), None);
        assert_eq!(FrameKind::from_byte(0xFF), None);
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let mut frame = DataFrame::new(header(1, 2, 9), b"hello".to_vec());
        frame.t1_sent = 1_000;
        frame.t2_received = 2_000;

        let encoded = Frame::Data(frame.clone()).encode();
        assert_eq!(encoded.len(), Frame::Data(frame.clone()).wire_size());

        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, Frame::Data(frame));
    }

    #[test]
    fn test_ack_frame_roundtrip() {
        let data = DataFrame::new(header(1, 2, 9), b"x".to_vec());
        let ack = AckFrame::for_data(&data, 5_000, 6_000);
        assert_eq!(ack.header.src, DeviceId(2));
        assert_eq!(ack.header.dest, DeviceId(1));
        assert_eq!(ack.header.packet_index, 9);

        let encoded = Frame::Ack(ack).encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, Frame::Ack(ack));
    }

    #[test]
    fn test_ack_time_frame_roundtrip() {
        let frame = AckTimeFrame {
            header: header(2, 1, 9),
            radio_ack_sent: 77_000,
        };
        let encoded = Frame::AckTime(frame).encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, Frame::AckTime(frame));
    }

    #[test]
    fn test_encode_for_send_stamps_t1() {
        let mut frame = DataFrame::new(header(1, 2, 0), b"hi".to_vec());
        assert_eq!(frame.t1_sent, 0);

        let encoded = frame.encode_for_send(42_000);
        assert_eq!(frame.t1_sent, 42_000);

        let (decoded, _) = Frame::decode(&encoded).unwrap();
        let Frame::Data(d) = decoded else {
            panic!("expected data frame");
        };
        assert_eq!(d.t1_sent, 42_000);
    }

    #[test]
    fn test_wire_layout() {
        // Fixed fields land at fixed offsets: kind at 6, src 7, dest 8.
        let encoded = Frame::Ack(AckFrame {
            header: header(0x0A, 0x0B, 0x01020304),
            t2_received: 0,
            t3_ack_sent: 0,
        })
        .encode();
        assert_eq!(&encoded[..4], b"RGLK");
        assert_eq!(hex::encode(&encoded[4..9]), "001e020a0b");
        assert_eq!(&encoded[9..13], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_missing_marker() {
        let mut encoded = Frame::Ack(AckFrame {
            header: header(1, 2, 0),
            t2_received: 0,
            t3_ack_sent: 0,
        })
        .encode();
        encoded[0] = b'X';
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::MissingMarker(0))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = Frame::Data(DataFrame::new(header(1, 2, 0), b"payload".to_vec())).encode();
        let result = Frame::decode(&encoded[..encoded.len() - 3]);
        assert!(matches!(result, Err(FrameError::Truncated { .. })));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut encoded = Frame::Ack(AckFrame {
            header: header(1, 2, 0),
            t2_received: 0,
            t3_ack_sent: 0,
        })
        .encode();
        encoded[6] = 0x7F;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn test_decode_bad_fragment_index() {
        let mut frame = DataFrame::new(header(1, 2, 0), vec![]);
        frame.header.fragment_index = 4;
        frame.header.fragment_count = 4;
        let encoded = Frame::Data(frame).encode();
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::FragmentIndexOutOfRange { index: 4, count: 4 })
        ));
    }

    #[test]
    fn test_scan_marker_resync() {
        let encoded = Frame::AckTime(AckTimeFrame {
            header: header(1, 2, 0),
            radio_ack_sent: 1,
        })
        .encode();
        let mut noisy = vec![0xAA, 0xBB, b'R', b'G', 0xCC];
        noisy.extend_from_slice(&encoded);

        let offset = scan_marker(&noisy).unwrap();
        assert_eq!(offset, 5);
        let (decoded, _) = Frame::decode(&noisy[offset..]).unwrap();
        assert_eq!(decoded.kind(), FrameKind::AckTime);
    }

    #[test]
    fn test_scan_marker_absent() {
        assert_eq!(scan_marker(b"no frames in here"), None);
    }
}
