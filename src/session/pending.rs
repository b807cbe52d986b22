//! Outstanding-packet bookkeeping and range-sample math.
//!
//! One [`PendingOutbound`] exists per sent data frame until both the
//! software and hardware timestamp quadruples complete or the session
//! disconnects. Each quadruple, once complete, yields one range sample:
//!
//! ```text
//! distance = c * ((t4 - t1) - (t3 - t2)) / 2
//! ```
//!
//! Every subtraction stays within one device's clock, which is what makes
//! the formula immune to inter-device clock offset: `t4 - t1` on the
//! sender's clock, `t3 - t2` on the receiver's.

use crate::core::DeviceId;
use crate::core::constants::SPEED_OF_LIGHT_M_PER_S;
use crate::wire::DataFrame;

/// Correlation identity of one data frame.
///
/// The sent timestamp doubles as a nonce disambiguating packet-index
/// reuse across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    /// Sending device.
    pub src: DeviceId,
    /// Receiving device.
    pub dest: DeviceId,
    /// Sender-local packet index.
    pub packet_index: u32,
    /// The frame's `t1_sent` stamp.
    pub sent_at: u64,
}

impl ExchangeKey {
    /// Key of a data frame (its `t1_sent` must already be stamped).
    pub fn of(frame: &DataFrame) -> Self {
        Self {
            src: frame.header.src,
            dest: frame.header.dest,
            packet_index: frame.header.packet_index,
            sent_at: frame.t1_sent,
        }
    }
}

/// Which timestamp set produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// Application-clock timestamps; includes OS scheduling jitter.
    Software,
    /// Capture-clock timestamps from the radio's packet log; the
    /// preferred measurement when present.
    Hardware,
}

/// One distance estimate, handed to the downstream position solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSample {
    /// The remote device the distance was measured to.
    pub device: DeviceId,
    /// Estimated one-way distance in meters.
    pub distance_m: f64,
    /// Timestamp set that produced the sample.
    pub source: SampleSource,
    /// Wall-clock time the sample was computed, ns since the UNIX epoch.
    pub at_ns: u64,
}

/// Distance for a completed timestamp quadruple.
///
/// `tick_seconds` converts one timestamp unit to seconds (1e-9 for the
/// software clock, 1e-6 for the capture clock). The result is negative
/// when the quadruple is inconsistent; callers keep such samples out of
/// the solver but the math does not hide them.
pub fn distance_m(t1: u64, t2: u64, t3: u64, t4: u64, tick_seconds: f64) -> f64 {
    let outer = t4 as i128 - t1 as i128;
    let turnaround = t3 as i128 - t2 as i128;
    let flight_ticks = (outer - turnaround) as f64;
    SPEED_OF_LIGHT_M_PER_S * flight_ticks * tick_seconds / 2.0
}

/// A sent data frame awaiting completion of its timestamp sets.
#[derive(Debug, Clone)]
pub struct PendingOutbound {
    /// The frame as sent; software timestamps fill in as the round trip
    /// progresses.
    pub frame: DataFrame,
    /// Capture time the frame left the local radio.
    pub hw_t1: u64,
    /// Capture time the frame reached the peer's radio (via ack re-send).
    pub hw_t2: u64,
    /// Capture time the ack left the peer's radio (via AckTime frame).
    pub hw_t3: u64,
    /// Capture time the ack reached the local radio.
    pub hw_t4: u64,
    software_emitted: bool,
    hardware_emitted: bool,
}

impl PendingOutbound {
    /// Record a freshly transmitted frame (`t1_sent` already stamped).
    pub fn new(frame: DataFrame) -> Self {
        Self {
            frame,
            hw_t1: 0,
            hw_t2: 0,
            hw_t3: 0,
            hw_t4: 0,
            software_emitted: false,
            hardware_emitted: false,
        }
    }

    /// Correlation key of the underlying frame.
    pub fn key(&self) -> ExchangeKey {
        ExchangeKey::of(&self.frame)
    }

    /// Whether the first ack has already completed the software set.
    pub fn software_complete(&self) -> bool {
        self.frame.t1_sent != 0
            && self.frame.t2_received != 0
            && self.frame.t3_ack_sent != 0
            && self.frame.t4_ack_received != 0
    }

    /// Whether all four capture timestamps are present.
    pub fn hardware_complete(&self) -> bool {
        self.hw_t1 != 0 && self.hw_t2 != 0 && self.hw_t3 != 0 && self.hw_t4 != 0
    }

    /// Both sets done; the entry can be dropped.
    pub fn fully_resolved(&self) -> bool {
        self.software_emitted && self.hardware_emitted
    }

    /// Fold in the first ack: stamps t2/t3 from the ack and t4 with the
    /// arrival time, then emits the software sample if the quadruple is
    /// complete and was not emitted before.
    pub fn on_ack(&mut self, t2: u64, t3: u64, now_ns: u64) -> Option<RangeSample> {
        self.frame.t2_received = t2;
        self.frame.t3_ack_sent = t3;
        self.frame.t4_ack_received = now_ns;
        self.take_software_sample(now_ns)
    }

    /// Fold in a timing-refinement ack re-send: its `t2` is the capture
    /// time the peer's radio received the data frame.
    pub fn on_refined_t2(&mut self, capture_t2: u64, now_ns: u64) -> Option<RangeSample> {
        self.hw_t2 = capture_t2;
        self.take_hardware_sample(now_ns)
    }

    /// Fold in an AckTime frame: the capture time the ack left the
    /// peer's radio.
    pub fn on_radio_ack_sent(&mut self, capture_t3: u64, now_ns: u64) -> Option<RangeSample> {
        self.hw_t3 = capture_t3;
        self.take_hardware_sample(now_ns)
    }

    /// Fold in the local capture record of this frame's transmission.
    pub fn on_radio_data_sent(&mut self, capture_t1: u64, now_ns: u64) -> Option<RangeSample> {
        self.hw_t1 = capture_t1;
        self.take_hardware_sample(now_ns)
    }

    /// Fold in the local capture record of the ack's arrival.
    pub fn on_radio_ack_received(&mut self, capture_t4: u64, now_ns: u64) -> Option<RangeSample> {
        self.hw_t4 = capture_t4;
        self.take_hardware_sample(now_ns)
    }

    fn take_software_sample(&mut self, now_ns: u64) -> Option<RangeSample> {
        if self.software_emitted || !self.software_complete() {
            return None;
        }
        self.software_emitted = true;
        Some(RangeSample {
            device: self.frame.header.dest,
            distance_m: distance_m(
                self.frame.t1_sent,
                self.frame.t2_received,
                self.frame.t3_ack_sent,
                self.frame.t4_ack_received,
                1e-9,
            ),
            source: SampleSource::Software,
            at_ns: now_ns,
        })
    }

    fn take_hardware_sample(&mut self, now_ns: u64) -> Option<RangeSample> {
        if self.hardware_emitted || !self.hardware_complete() {
            return None;
        }
        self.hardware_emitted = true;
        Some(RangeSample {
            device: self.frame.header.dest,
            distance_m: distance_m(self.hw_t1, self.hw_t2, self.hw_t3, self.hw_t4, 1e-6),
            source: SampleSource::Hardware,
            at_ns: now_ns,
        })
    }
}
