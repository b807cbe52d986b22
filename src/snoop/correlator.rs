//! Snoop log correlator.
//!
//! Tails a capture stream being written concurrently by the radio stack,
//! picks out records whose payload embeds a RangeLink frame, and turns
//! them into [`SnoopEvent`]s carrying the record's capture timestamp.
//! The owning connection manager routes each event into the ranging
//! session for the involved peer.
//!
//! Short reads mean the producer has not flushed a whole record yet; the
//! reader keeps its mark, waits, and retries. Only a bad stream header is
//! fatal.

use crate::core::DeviceId;
use crate::wire::{Frame, FrameKind, scan_marker};

use super::record::CaptureRecord;

/// A hardware timestamp extracted from the capture stream, classified by
/// frame kind and direction relative to the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopEvent {
    /// Our data frame left the radio.
    DataSent {
        /// The device the frame was addressed to.
        peer: DeviceId,
        /// Packet index of the frame.
        packet_index: u32,
        /// Capture timestamp, microseconds.
        capture_ts: u64,
    },
    /// A peer's data frame reached the radio.
    DataReceived {
        /// The device that sent the frame.
        peer: DeviceId,
        /// Packet index of the frame.
        packet_index: u32,
        /// Capture timestamp, microseconds.
        capture_ts: u64,
    },
    /// Our ack left the radio.
    AckSent {
        /// The device the ack was addressed to.
        peer: DeviceId,
        /// Packet index of the acknowledged data frame.
        packet_index: u32,
        /// Capture timestamp, microseconds.
        capture_ts: u64,
    },
    /// A peer's ack reached the radio.
    AckReceived {
        /// The device that sent the ack.
        peer: DeviceId,
        /// Packet index of the acknowledged data frame.
        packet_index: u32,
        /// Capture timestamp, microseconds.
        capture_ts: u64,
    },
}

impl SnoopEvent {
    /// The remote device this event belongs to.
    pub fn peer(&self) -> DeviceId {
        match *self {
            SnoopEvent::DataSent { peer, .. }
            | SnoopEvent::DataReceived { peer, .. }
            | SnoopEvent::AckSent { peer, .. }
            | SnoopEvent::AckReceived { peer, .. } => peer,
        }
    }
}

/// Classify one capture record against the local device id.
///
/// Returns `None` for records without an embedded frame, frames not
/// involving the local device, and timing frames (which never
/// re-correlate). Other radio traffic shares the log, so `None` is the
/// common case.
pub fn classify(record: &CaptureRecord, local: DeviceId) -> Option<SnoopEvent> {
    let offset = scan_marker(&record.payload)?;
    let (frame, _) = Frame::decode(&record.payload[offset..]).ok()?;
    let header = *frame.header();
    let ts = record.timestamp_us;

    match frame.kind() {
        FrameKind::Data if header.src == local => Some(SnoopEvent::DataSent {
            peer: header.dest,
            packet_index: header.packet_index,
            capture_ts: ts,
        }),
        FrameKind::Data if header.dest == local => Some(SnoopEvent::DataReceived {
            peer: header.src,
            packet_index: header.packet_index,
            capture_ts: ts,
        }),
        FrameKind::Ack if header.src == local => Some(SnoopEvent::AckSent {
            peer: header.dest,
            packet_index: header.packet_index,
            capture_ts: ts,
        }),
        FrameKind::Ack if header.dest == local => Some(SnoopEvent::AckReceived {
            peer: header.src,
            packet_index: header.packet_index,
            capture_ts: ts,
        }),
        _ => None,
    }
}

#[cfg(feature = "transport")]
pub use io::SnoopCorrelator;

#[cfg(feature = "transport")]
mod io {
    use std::path::PathBuf;

    use tokio::fs::File;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::{debug, trace, warn};

    use super::{SnoopEvent, classify};
    use crate::core::constants::{SNOOP_HEADER_SIZE, SNOOP_POLL_INTERVAL};
    use crate::core::{DeviceId, SnoopError};
    use crate::snoop::record::{CaptureRecord, StreamHeader};

    /// Tails one capture stream and feeds classified events to the
    /// manager.
    #[derive(Debug)]
    pub struct SnoopCorrelator {
        task: JoinHandle<()>,
    }

    impl SnoopCorrelator {
        /// Spawn the tail worker over the capture file at `path`.
        ///
        /// The worker waits for the file to appear and for the producer
        /// to flush, retrying indefinitely; it stops when the event
        /// receiver is dropped, the correlator is dropped, or the stream
        /// header turns out not to be a capture stream.
        pub fn spawn(path: PathBuf, local: DeviceId, events: mpsc::Sender<SnoopEvent>) -> Self {
            let task = tokio::spawn(async move {
                if let Err(err) = tail(path, local, events).await {
                    warn!(%err, "capture stream unusable");
                }
            });
            Self { task }
        }

        /// Stop tailing.
        pub fn abort(&self) {
            self.task.abort();
        }
    }

    impl Drop for SnoopCorrelator {
        fn drop(&mut self) {
            self.abort();
        }
    }

    async fn tail(
        path: PathBuf,
        local: DeviceId,
        events: mpsc::Sender<SnoopEvent>,
    ) -> Result<(), SnoopError> {
        let mut file = loop {
            match File::open(&path).await {
                Ok(file) => break file,
                Err(err) => {
                    trace!(%err, "capture file not ready");
                    tokio::time::sleep(SNOOP_POLL_INTERVAL).await;
                }
            }
        };

        let mut buf: Vec<u8> = Vec::with_capacity(4096);

        // The stream header must validate before any record is trusted.
        while buf.len() < SNOOP_HEADER_SIZE {
            if fill(&mut file, &mut buf).await? == 0 {
                tokio::time::sleep(SNOOP_POLL_INTERVAL).await;
            }
        }
        StreamHeader::parse(&buf)?;
        buf.drain(..SNOOP_HEADER_SIZE);

        loop {
            match CaptureRecord::parse(&buf) {
                Ok((record, consumed)) => {
                    buf.drain(..consumed);
                    if let Some(event) = classify(&record, local) {
                        debug!(?event, "capture record correlated");
                        if events.send(event).await.is_err() {
                            // Receiver gone; the manager shut down.
                            return Ok(());
                        }
                    }
                }
                Err(SnoopError::ShortRead { .. }) => {
                    // Producer mid-write: keep the mark, wait, retry.
                    if fill(&mut file, &mut buf).await? == 0 {
                        if events.is_closed() {
                            return Ok(());
                        }
                        tokio::time::sleep(SNOOP_POLL_INTERVAL).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fill(file: &mut File, buf: &mut Vec<u8>) -> Result<usize, SnoopError> {
        let mut chunk = [0u8; 4096];
        let n = file.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}


#[cfg(all(test, feature = "transport"))]
mod io_tests {
    use super::*;
    use crate::core::constants::SNOOP_HEADER_SIZE;
    use crate::snoop::record::StreamHeader;
    use crate::wire::{DataFrame, FrameHeader};
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LOCAL: DeviceId = DeviceId(1);
    const PEER: DeviceId = DeviceId(2);

    fn data_frame(packet: u32) -> Frame {
        Frame::Data(DataFrame::new(
            FrameHeader {
                src: LOCAL,
                dest: PEER,
                packet_index: packet,
                message_index: 0,
                fragment_index: 0,
                fragment_count: 1,
                attempt: 1,
            },
            b"payload".to_vec(),
        ))
    }

    fn capture_bytes(frames: &[(Frame, u64)]) -> Vec<u8> {
        let mut bytes = StreamHeader::default().to_bytes().to_vec();
        for (frame, ts) in frames {
            bytes.extend_from_slice(&CaptureRecord::of(frame.encode(), *ts, 0).to_bytes());
        }
        bytes
    }

    #[tokio::test]
    async fn test_tail_complete_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&capture_bytes(&[(data_frame(0), 50), (data_frame(1), 60)]))
            .unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let correlator = SnoopCorrelator::spawn(file.path().to_path_buf(), LOCAL, tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(
            first,
            SnoopEvent::DataSent {
                peer: PEER,
                packet_index: 0,
                capture_ts: 50
            }
        );
        assert_eq!(
            second,
            SnoopEvent::DataSent {
                peer: PEER,
                packet_index: 1,
                capture_ts: 60
            }
        );
        correlator.abort();
    }

    #[tokio::test]
    async fn test_tail_waits_for_producer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes = capture_bytes(&[(data_frame(0), 70)]);

        // Flush only half the stream; the correlator must wait, not fail.
        let (head, tail) = bytes.split_at(SNOOP_HEADER_SIZE + 10);
        file.write_all(head).unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let correlator = SnoopCorrelator::spawn(file.path().to_path_buf(), LOCAL, tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        file.write_all(tail).unwrap();
        file.flush().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SnoopEvent::DataSent { capture_ts: 70, .. }));
        correlator.abort();
    }

    #[tokio::test]
    async fn test_bad_header_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a capture stream....").unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _correlator = SnoopCorrelator::spawn(file.path().to_path_buf(), LOCAL, tx);

        // The worker drops the sender on the fatal header error.
        assert!(rx.recv().await.is_none());
    }
}
