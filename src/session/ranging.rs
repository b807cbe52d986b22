//! Per-remote-device ranging session.
//!
//! [`RangingState`] is the pure state machine: it owns the outbound
//! counters, the pending-outbound map, the receiver-side duplicate guard
//! and ack log, and the reassembler. Every method takes explicit clock
//! readings (`_at` suffix) so behavior is fully testable without IO.
//!
//! `RangingSession` wraps one established `LinkStream` around a
//! shared `RangingState`: a reader task decodes inbound frames and a
//! writer task drains the outbound queue, both serializing state changes
//! through one mutex. Software timestamp stamping is therefore strictly
//! ordered by arrival order of the underlying I/O events.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::pending::{ExchangeKey, PendingOutbound, RangeSample};
use crate::core::{DeviceId, SessionError};
use crate::wire::{AckFrame, AckTimeFrame, DataFrame, Frame, FrameHeader, Reassembler, fragment};

/// What handling one inbound frame produced.
#[derive(Debug, Default)]
pub struct FrameEffects {
    /// Frames to transmit in response (acks, timing refinements).
    pub responses: Vec<Frame>,
    /// A completed reassembled message, if this frame filled the last slot.
    pub message: Option<Vec<u8>>,
    /// A completed range sample, if this frame finished a timestamp set.
    pub sample: Option<RangeSample>,
}

/// Ranging state for one remote device.
#[derive(Debug)]
pub struct RangingState {
    local: DeviceId,
    peer: DeviceId,
    max_payload: usize,
    next_packet_index: u32,
    next_message_index: u32,
    /// Outstanding sent data frames by packet index.
    pending: HashMap<u32, PendingOutbound>,
    /// Receiver-side duplicate-delivery guard; the sent-at stamp in the
    /// key disambiguates packet-index reuse across reconnects.
    seen: HashSet<ExchangeKey>,
    /// Receiver-side log of sent acks by acked packet index, kept for
    /// timing refinement re-sends and AckTime synthesis.
    sent_acks: HashMap<u32, AckFrame>,
    reassembler: Reassembler,
}

impl RangingState {
    /// Create the state for a fresh session.
    pub fn new(local: DeviceId, peer: DeviceId, max_payload: usize) -> Self {
        Self {
            local,
            peer,
            max_payload,
            next_packet_index: 0,
            next_message_index: 0,
            pending: HashMap::new(),
            seen: HashSet::new(),
            sent_acks: HashMap::new(),
            reassembler: Reassembler::new(),
        }
    }

    /// The remote device this session ranges against.
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// The local device id.
    pub fn local(&self) -> DeviceId {
        self.local
    }

    /// Outstanding sent packets not yet fully resolved.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fragment a message and encode its data frames for transmission.
    ///
    /// Each frame's `t1_sent` is stamped with `now_ns` at serialization
    /// and a [`PendingOutbound`] entry is recorded. Returns the encoded
    /// frames in transmission order; on [`SessionError::Fragment`]
    /// nothing is recorded or transmitted.
    pub fn encode_message_at(
        &mut self,
        message: &[u8],
        now_ns: u64,
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        let fragments = fragment(message, self.max_payload)?;
        let fragment_count = fragments.len() as u8;
        let message_index = self.next_message_index;
        self.next_message_index += 1;

        let mut encoded = Vec::with_capacity(fragments.len());
        for (i, payload) in fragments.into_iter().enumerate() {
            let packet_index = self.next_packet_index;
            self.next_packet_index += 1;
            let mut frame = DataFrame::new(
                FrameHeader {
                    src: self.local,
                    dest: self.peer,
                    packet_index,
                    message_index,
                    fragment_index: i as u8,
                    fragment_count,
                    attempt: 1,
                },
                payload,
            );
            encoded.push(frame.encode_for_send(now_ns));
            self.pending.insert(packet_index, PendingOutbound::new(frame));
        }
        Ok(encoded)
    }

    /// Handle one decoded inbound frame at the given clock reading.
    ///
    /// [`SessionError::DuplicateFrame`] means the frame was dropped by
    /// the duplicate-delivery guard; the caller logs it and moves on.
    pub fn on_frame_at(&mut self, frame: Frame, now_ns: u64) -> Result<FrameEffects, SessionError> {
        match frame {
            Frame::Data(data) => self.on_data_at(data, now_ns),
            Frame::Ack(ack) => Ok(self.on_ack_at(ack, now_ns)),
            Frame::AckTime(at) => Ok(self.on_ack_time_at(at, now_ns)),
        }
    }

    fn on_data_at(&mut self, mut data: DataFrame, now_ns: u64) -> Result<FrameEffects, SessionError> {
        let key = ExchangeKey::of(&data);
        if !self.seen.insert(key) {
            return Err(SessionError::DuplicateFrame {
                src: key.src.as_u8(),
                dest: key.dest.as_u8(),
                packet_index: key.packet_index,
            });
        }

        data.t2_received = now_ns;
        let ack = AckFrame::for_data(&data, now_ns, now_ns);
        self.sent_acks.insert(data.header.packet_index, ack);

        let message = self.reassembler.insert(
            data.header.src,
            data.header.message_index,
            data.header.fragment_index,
            data.header.fragment_count,
            data.payload,
        );

        Ok(FrameEffects {
            responses: vec![Frame::Ack(ack)],
            message,
            sample: None,
        })
    }

    fn on_ack_at(&mut self, ack: AckFrame, now_ns: u64) -> FrameEffects {
        if ack.header.dest != self.local {
            debug!(dest = %ack.header.dest, "ack not addressed to this device");
            return FrameEffects::default();
        }
        let Some(pending) = self.pending.get_mut(&ack.header.packet_index) else {
            debug!(
                packet = ack.header.packet_index,
                "ack without matching pending packet"
            );
            return FrameEffects::default();
        };

        // A second ack for a completed exchange is the timing-refinement
        // re-send: its t2 is the capture time the peer's radio received
        // the data frame.
        let sample = if pending.software_complete() {
            pending.on_refined_t2(ack.t2_received, now_ns)
        } else {
            pending.on_ack(ack.t2_received, ack.t3_ack_sent, now_ns)
        };
        self.prune(ack.header.packet_index);
        FrameEffects {
            responses: vec![],
            message: None,
            sample,
        }
    }

    fn on_ack_time_at(&mut self, at: AckTimeFrame, now_ns: u64) -> FrameEffects {
        let Some(pending) = self.pending.get_mut(&at.header.packet_index) else {
            debug!(
                packet = at.header.packet_index,
                "ack-time without matching pending packet"
            );
            return FrameEffects::default();
        };
        let sample = pending.on_radio_ack_sent(at.radio_ack_sent, now_ns);
        self.prune(at.header.packet_index);
        FrameEffects {
            responses: vec![],
            message: None,
            sample,
        }
    }

    /// Local capture record: our data frame left the radio.
    pub fn on_capture_data_sent(
        &mut self,
        packet_index: u32,
        capture_ts: u64,
        now_ns: u64,
    ) -> Option<RangeSample> {
        let sample = self
            .pending
            .get_mut(&packet_index)?
            .on_radio_data_sent(capture_ts, now_ns);
        self.prune(packet_index);
        sample
    }

    /// Local capture record: the peer's ack reached the radio.
    pub fn on_capture_ack_received(
        &mut self,
        packet_index: u32,
        capture_ts: u64,
        now_ns: u64,
    ) -> Option<RangeSample> {
        let sample = self
            .pending
            .get_mut(&packet_index)?
            .on_radio_ack_received(capture_ts, now_ns);
        self.prune(packet_index);
        sample
    }

    /// Local capture record: the peer's data frame reached the radio.
    ///
    /// Returns the refined ack to re-send, its `t2` replaced by the
    /// capture timestamp.
    pub fn on_capture_data_received(
        &mut self,
        packet_index: u32,
        capture_ts: u64,
    ) -> Option<Frame> {
        let ack = self.sent_acks.get_mut(&packet_index)?;
        ack.t2_received = capture_ts;
        Some(Frame::Ack(*ack))
    }

    /// Local capture record: our ack left the radio.
    ///
    /// Returns the AckTime frame to transmit to the data sender.
    pub fn on_capture_ack_sent(&mut self, packet_index: u32, capture_ts: u64) -> Option<Frame> {
        let ack = self.sent_acks.get(&packet_index)?;
        Some(Frame::AckTime(AckTimeFrame {
            header: ack.header,
            radio_ack_sent: capture_ts,
        }))
    }

    fn prune(&mut self, packet_index: u32) {
        if self
            .pending
            .get(&packet_index)
            .is_some_and(PendingOutbound::fully_resolved)
        {
            self.pending.remove(&packet_index);
        }
    }
}

#[cfg(feature = "transport")]
pub use io::{RangingSession, SessionEvent};

#[cfg(feature = "transport")]
mod io {
    use std::sync::Arc;

    use tokio::sync::{Mutex, mpsc};
    use tokio::task::JoinHandle;
    use tracing::{debug, warn};

    use super::{RangeSample, RangingState};
    use crate::core::constants::SEND_QUEUE_DEPTH;
    use crate::core::{DeviceId, SessionError, now_ns};
    use crate::link::LinkStream;
    use crate::wire::Frame;

    /// Event emitted by a session's receive loop.
    #[derive(Debug)]
    pub enum SessionEvent {
        /// A frame arrived and was accepted.
        Frame(Frame),
        /// A message completed reassembly.
        Message(Vec<u8>),
        /// A timestamp set completed into a range sample.
        Sample(RangeSample),
        /// The transport closed; the session is done.
        Closed,
    }

    /// A live ranging session bound to one established transport.
    ///
    /// Owns a reader task and a writer task; both share the
    /// [`RangingState`] under one mutex. Dropping the session (or calling
    /// [`RangingSession::abort`]) tears both down.
    #[derive(Debug)]
    pub struct RangingSession {
        peer: DeviceId,
        state: Arc<Mutex<RangingState>>,
        outbound: mpsc::Sender<Vec<u8>>,
        reader_task: JoinHandle<()>,
        writer_task: JoinHandle<()>,
    }

    impl RangingSession {
        /// Spawn the session loops over an established stream.
        pub fn spawn(
            stream: LinkStream,
            local: DeviceId,
            peer: DeviceId,
            max_payload: usize,
            events: mpsc::Sender<SessionEvent>,
        ) -> Self {
            let (mut reader, mut writer) = stream.into_split();
            let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_DEPTH);
            let state = Arc::new(Mutex::new(RangingState::new(local, peer, max_payload)));

            let writer_task = tokio::spawn(async move {
                while let Some(bytes) = outbound_rx.recv().await {
                    if let Err(err) = writer.write_bytes(&bytes).await {
                        debug!(%err, "write side closed");
                        break;
                    }
                }
            });

            let reader_state = state.clone();
            let reader_outbound = outbound.clone();
            let reader_task = tokio::spawn(async move {
                loop {
                    let frame = match reader.next_frame().await {
                        Ok(frame) => frame,
                        Err(SessionError::TransportClosed) => break,
                        Err(err) => {
                            debug!(%err, "read side failed");
                            break;
                        }
                    };

                    let effects = {
                        let mut state = reader_state.lock().await;
                        match state.on_frame_at(frame.clone(), now_ns()) {
                            Ok(effects) => effects,
                            Err(err) => {
                                warn!(%err, "frame dropped");
                                continue;
                            }
                        }
                    };

                    for response in &effects.responses {
                        if reader_outbound.send(response.encode()).await.is_err() {
                            break;
                        }
                    }
                    let _ = events.send(SessionEvent::Frame(frame)).await;
                    if let Some(message) = effects.message {
                        let _ = events.send(SessionEvent::Message(message)).await;
                    }
                    if let Some(sample) = effects.sample {
                        let _ = events.send(SessionEvent::Sample(sample)).await;
                    }
                }
                let _ = events.send(SessionEvent::Closed).await;
            });

            Self {
                peer,
                state,
                outbound,
                reader_task,
                writer_task,
            }
        }

        /// The remote device this session ranges against.
        pub fn peer(&self) -> DeviceId {
            self.peer
        }

        /// Fragment and transmit an application message.
        ///
        /// Frames are stamped and recorded under the session lock, then
        /// queued; the caller never blocks on the socket.
        pub async fn send_message(&self, message: &[u8]) -> Result<(), SessionError> {
            let encoded = {
                let mut state = self.state.lock().await;
                state.encode_message_at(message, now_ns())?
            };
            for bytes in encoded {
                self.outbound
                    .send(bytes)
                    .await
                    .map_err(|_| SessionError::TransportClosed)?;
            }
            Ok(())
        }

        /// Capture record of our outbound data frame; may complete the
        /// hardware sample.
        pub async fn capture_data_sent(&self, packet_index: u32, capture_ts: u64) -> Option<RangeSample> {
            let mut state = self.state.lock().await;
            state.on_capture_data_sent(packet_index, capture_ts, now_ns())
        }

        /// Capture record of the peer's ack arriving; may complete the
        /// hardware sample.
        pub async fn capture_ack_received(
            &self,
            packet_index: u32,
            capture_ts: u64,
        ) -> Option<RangeSample> {
            let mut state = self.state.lock().await;
            state.on_capture_ack_received(packet_index, capture_ts, now_ns())
        }

        /// Capture record of the peer's data frame arriving; re-sends the
        /// ack with its timing refined.
        pub async fn capture_data_received(&self, packet_index: u32, capture_ts: u64) {
            let refined = {
                let mut state = self.state.lock().await;
                state.on_capture_data_received(packet_index, capture_ts)
            };
            if let Some(frame) = refined {
                let _ = self.outbound.send(frame.encode()).await;
            }
        }

        /// Capture record of our ack leaving the radio; transmits the
        /// AckTime frame to the data sender.
        pub async fn capture_ack_sent(&self, packet_index: u32, capture_ts: u64) {
            let at = {
                let mut state = self.state.lock().await;
                state.on_capture_ack_sent(packet_index, capture_ts)
            };
            if let Some(frame) = at {
                let _ = self.outbound.send(frame.encode()).await;
            }
        }

        /// Tear the session down by aborting both loops; the dropped
        /// stream halves close the transport.
        pub fn abort(&self) {
            self.reader_task.abort();
            self.writer_task.abort();
        }
    }

    impl Drop for RangingSession {
        fn drop(&mut self) {
            self.abort();
        }
    }
}


#[cfg(all(test, feature = "transport"))]
mod io_tests {
    use super::io::{RangingSession, SessionEvent};
    use crate::core::DeviceId;
    use crate::core::constants::DEFAULT_MAX_PAYLOAD;
    use crate::link::LinkStream;
    use crate::session::pending::SampleSource;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn session_pair() -> (
        RangingSession,
        mpsc::Receiver<SessionEvent>,
        RangingSession,
        mpsc::Receiver<SessionEvent>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { LinkStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let b_stream = LinkStream::from_tcp(accepted).unwrap();
        let a_stream = connect.await.unwrap();

        let (a_tx, a_rx) = mpsc::channel(32);
        let (b_tx, b_rx) = mpsc::channel(32);
        let a = RangingSession::spawn(a_stream, DeviceId(1), DeviceId(2), DEFAULT_MAX_PAYLOAD, a_tx);
        let b = RangingSession::spawn(b_stream, DeviceId(2), DeviceId(1), DEFAULT_MAX_PAYLOAD, b_tx);
        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn test_message_and_software_sample() {
        let (a, mut a_rx, _b, mut b_rx) = session_pair().await;

        a.send_message(b"hi").await.unwrap();

        // B reassembles the message.
        let message = loop {
            match b_rx.recv().await.unwrap() {
                SessionEvent::Message(m) => break m,
                SessionEvent::Frame(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert_eq!(message, b"hi".to_vec());

        // A's ack arrival completes the software sample.
        let sample = loop {
            match a_rx.recv().await.unwrap() {
                SessionEvent::Sample(s) => break s,
                SessionEvent::Frame(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert_eq!(sample.source, SampleSource::Software);
        assert_eq!(sample.device, DeviceId(2));
    }

    #[tokio::test]
    async fn test_close_emits_closed() {
        let (a, _a_rx, _b, mut b_rx) = session_pair().await;
        a.abort();
        loop {
            match b_rx.recv().await.unwrap() {
                SessionEvent::Closed => break,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_hardware_sample_over_wire() {
        let (a, mut a_rx, b, mut b_rx) = session_pair().await;

        a.send_message(b"ping").await.unwrap();

        // Drain until B has processed the data frame.
        loop {
            if let SessionEvent::Message(_) = b_rx.recv().await.unwrap() {
                break;
            }
        }
        // A gets its software sample first.
        loop {
            if let SessionEvent::Sample(s) = a_rx.recv().await.unwrap() {
                assert_eq!(s.source, SampleSource::Software);
                break;
            }
        }

        // Capture logs on both ends supply the hardware quadruple.
        assert!(a.capture_data_sent(0, 1_000).await.is_none());
        assert!(a.capture_ack_received(0, 1_500).await.is_none());
        b.capture_data_received(0, 1_180).await;
        b.capture_ack_sent(0, 1_280).await;

        let sample = loop {
            match a_rx.recv().await.unwrap() {
                SessionEvent::Sample(s) => break s,
                SessionEvent::Frame(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert_eq!(sample.source, SampleSource::Hardware);
        assert!(sample.distance_m > 0.0);
    }
}
