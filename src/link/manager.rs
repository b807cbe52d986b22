//! Connection manager.
//!
//! Owns one establisher + ranging session pair per known remote device,
//! applies the reconnect policy, routes capture-log events into the right
//! session, and fans out link events to the application over a single
//! typed channel. No thread-affinity anywhere: whatever layer consumes
//! the events (UI, logger, position solver) just reads the channel.
//!
//! The device map sits under its own lock, distinct from per-session
//! locks, so work on one device never blocks another.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::establish::{EstablishConfig, PeerDirectory, ServiceId, default_services, establish};
use crate::core::constants::{
    CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, DEFAULT_MAX_PAYLOAD, EVENT_CHANNEL_DEPTH,
    RECONNECT_DELAY,
};
use crate::core::{DeviceId, SessionError};
use crate::session::{RangeSample, RangingSession, SessionEvent};
use crate::snoop::{SnoopCorrelator, SnoopEvent};
use crate::wire::Frame;

/// Link state of one remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No establishment attempted yet.
    #[default]
    Idle,
    /// Establishment race in progress.
    Connecting,
    /// A ranging session is live.
    Connected,
    /// The transport closed or establishment failed.
    Disconnected,
}

/// Event published to the application.
#[derive(Debug)]
pub enum LinkEvent {
    /// A device's link state changed.
    StateChanged {
        /// The device.
        device: DeviceId,
        /// Previous state.
        old: LinkState,
        /// New state.
        new: LinkState,
    },
    /// A frame arrived on a device's session.
    PacketReceived {
        /// The device it arrived from.
        device: DeviceId,
        /// The decoded frame.
        frame: Frame,
    },
    /// A message finished reassembly.
    MessageReceived {
        /// The device it arrived from.
        device: DeviceId,
        /// The reassembled message bytes.
        message: Vec<u8>,
    },
    /// A timing set completed into a range sample.
    Sample(RangeSample),
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// This device's id, carried as `src` in every outbound frame.
    pub local_device: DeviceId,
    /// Service identifiers for establishment, in iteration order.
    pub services: Vec<ServiceId>,
    /// Discovery output: advertised names by peer address.
    pub directory: PeerDirectory,
    /// Whether to re-run establishment after an unexpected disconnect.
    pub reconnect: bool,
    /// Delay before a reconnect attempt.
    pub reconnect_delay: Duration,
    /// Maximum data-frame payload.
    pub max_payload: usize,
    /// Outbound attempts per service identifier.
    pub connect_attempts: u32,
    /// Backoff between failed outbound attempts.
    pub connect_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_device: DeviceId(0),
            services: default_services(),
            directory: PeerDirectory::new(),
            reconnect: false,
            reconnect_delay: RECONNECT_DELAY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            connect_attempts: CONNECT_ATTEMPTS,
            connect_retry_delay: CONNECT_RETRY_DELAY,
        }
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Default)]
pub struct ConnectionManagerBuilder {
    config: ManagerConfig,
}

impl ConnectionManagerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local device id.
    pub fn local_device(mut self, device: DeviceId) -> Self {
        self.config.local_device = device;
        self
    }

    /// Set the service identifier list.
    pub fn services(mut self, services: Vec<ServiceId>) -> Self {
        self.config.services = services;
        self
    }

    /// Set the discovery directory.
    pub fn directory(mut self, directory: PeerDirectory) -> Self {
        self.config.directory = directory;
        self
    }

    /// Enable or disable the reconnect policy.
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Set the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the maximum data-frame payload.
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

#[derive(Debug, Default)]
struct DeviceEntry {
    state: LinkState,
    driver: Option<JoinHandle<()>>,
    session: Option<Arc<RangingSession>>,
    explicit_disconnect: bool,
}

#[derive(Debug)]
struct Shared {
    config: ManagerConfig,
    event_tx: mpsc::Sender<LinkEvent>,
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
}

impl Shared {
    async fn set_state(self: &Arc<Self>, device: DeviceId, new: LinkState) {
        let old = {
            let mut devices = self.devices.lock().await;
            let Some(entry) = devices.get_mut(&device) else {
                return;
            };
            std::mem::replace(&mut entry.state, new)
        };
        if old != new {
            let _ = self
                .event_tx
                .send(LinkEvent::StateChanged { device, old, new })
                .await;
        }
    }

    async fn should_retry(self: &Arc<Self>, device: DeviceId) -> bool {
        if !self.config.reconnect {
            return false;
        }
        let devices = self.devices.lock().await;
        devices
            .get(&device)
            .is_some_and(|entry| !entry.explicit_disconnect)
    }

    /// One device's establish-session-reconnect loop.
    async fn drive(self: Arc<Self>, device: DeviceId, target: Option<IpAddr>) {
        loop {
            let est_config = EstablishConfig {
                target,
                services: self.config.services.clone(),
                connect_attempts: self.config.connect_attempts,
                connect_retry_delay: self.config.connect_retry_delay,
            };

            let established = match establish(&est_config).await {
                Ok(established) => established,
                Err(err) => {
                    warn!(%device, %err, "establishment failed");
                    self.set_state(device, LinkState::Disconnected).await;
                    if !self.should_retry(device).await {
                        return;
                    }
                    tokio::time::sleep(self.config.reconnect_delay).await;
                    self.set_state(device, LinkState::Connecting).await;
                    continue;
                }
            };

            match established.identify(&self.config.directory) {
                Ok(id) if id == device => {}
                Ok(id) => {
                    warn!(%device, peer = %id, "peer identity mismatch");
                    self.set_state(device, LinkState::Disconnected).await;
                    return;
                }
                Err(err) => {
                    warn!(%device, %err, "peer identity unresolved");
                    self.set_state(device, LinkState::Disconnected).await;
                    return;
                }
            }

            info!(
                %device,
                was_server = established.was_server,
                service = established.service.port(),
                "link established"
            );

            let (session_tx, mut session_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
            let session = Arc::new(RangingSession::spawn(
                established.stream,
                self.config.local_device,
                device,
                self.config.max_payload,
                session_tx,
            ));
            {
                let mut devices = self.devices.lock().await;
                let Some(entry) = devices.get_mut(&device) else {
                    // Disconnected concurrently; the session drops here.
                    return;
                };
                entry.session = Some(session.clone());
            }
            self.set_state(device, LinkState::Connected).await;

            while let Some(event) = session_rx.recv().await {
                match event {
                    SessionEvent::Frame(frame) => {
                        let _ = self
                            .event_tx
                            .send(LinkEvent::PacketReceived { device, frame })
                            .await;
                    }
                    SessionEvent::Message(message) => {
                        let _ = self
                            .event_tx
                            .send(LinkEvent::MessageReceived { device, message })
                            .await;
                    }
                    SessionEvent::Sample(sample) => {
                        let _ = self.event_tx.send(LinkEvent::Sample(sample)).await;
                    }
                    SessionEvent::Closed => break,
                }
            }

            if let Some(entry) = self.devices.lock().await.get_mut(&device) {
                entry.session = None;
            }
            self.set_state(device, LinkState::Disconnected).await;

            if !self.should_retry(device).await {
                return;
            }
            debug!(%device, "reconnecting");
            tokio::time::sleep(self.config.reconnect_delay).await;
            self.set_state(device, LinkState::Connecting).await;
        }
    }
}

/// Owns establishment, sessions, capture correlation, and event fan-out
/// for every known remote device.
#[derive(Debug)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    aborts: Mutex<Vec<AbortHandle>>,
    correlators: Mutex<Vec<SnoopCorrelator>>,
}

impl ConnectionManager {
    /// Create a manager and the event stream the application consumes.
    pub fn new(config: ManagerConfig) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let shared = Arc::new(Shared {
            config,
            event_tx,
            devices: Mutex::new(HashMap::new()),
        });
        (
            Self {
                shared,
                aborts: Mutex::new(Vec::new()),
                correlators: Mutex::new(Vec::new()),
            },
            event_rx,
        )
    }

    /// Local device id.
    pub fn local_device(&self) -> DeviceId {
        self.shared.config.local_device
    }

    /// Current link state for a device.
    pub async fn state(&self, device: DeviceId) -> LinkState {
        let devices = self.shared.devices.lock().await;
        devices
            .get(&device)
            .map(|entry| entry.state)
            .unwrap_or(LinkState::Idle)
    }

    /// Start (or restart) establishment toward `device`.
    ///
    /// Any existing session for the device is torn down first. `target`
    /// of `None` runs the accept worker only, for devices that will dial
    /// in themselves.
    pub async fn connect(&self, device: DeviceId, target: Option<IpAddr>) {
        {
            let mut devices = self.shared.devices.lock().await;
            let entry = devices.entry(device).or_default();
            if let Some(driver) = entry.driver.take() {
                driver.abort();
            }
            entry.session = None;
            entry.explicit_disconnect = false;
        }
        self.shared.set_state(device, LinkState::Connecting).await;

        let driver = tokio::spawn(Shared::drive(self.shared.clone(), device, target));
        self.aborts.lock().await.push(driver.abort_handle());
        if let Some(entry) = self.shared.devices.lock().await.get_mut(&device) {
            entry.driver = Some(driver);
        }
    }

    /// Tear down the session and establishment for `device`. Idempotent.
    pub async fn disconnect(&self, device: DeviceId) {
        let removed = {
            let mut devices = self.shared.devices.lock().await;
            devices.remove(&device)
        };
        let Some(mut entry) = removed else {
            return;
        };
        entry.explicit_disconnect = true;
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        entry.session = None;
        if entry.state != LinkState::Disconnected {
            let _ = self
                .shared
                .event_tx
                .send(LinkEvent::StateChanged {
                    device,
                    old: entry.state,
                    new: LinkState::Disconnected,
                })
                .await;
        }
    }

    /// Tear down every device. Idempotent.
    pub async fn disconnect_all(&self) {
        let devices: Vec<DeviceId> = {
            let map = self.shared.devices.lock().await;
            map.keys().copied().collect()
        };
        for device in devices {
            self.disconnect(device).await;
        }
    }

    /// Fragment and send a text message to a connected device.
    pub async fn send_text(&self, device: DeviceId, text: &str) -> Result<(), SessionError> {
        let session = {
            let devices = self.shared.devices.lock().await;
            devices.get(&device).and_then(|entry| entry.session.clone())
        };
        let Some(session) = session else {
            return Err(SessionError::TransportClosed);
        };
        session.send_message(text.as_bytes()).await
    }

    /// Tail a capture stream and feed its hardware timestamps into the
    /// owning sessions.
    pub async fn attach_snoop(&self, path: impl Into<PathBuf>) {
        let (snoop_tx, mut snoop_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let correlator = SnoopCorrelator::spawn(
            path.into(),
            self.shared.config.local_device,
            snoop_tx,
        );

        let shared = self.shared.clone();
        let router = tokio::spawn(async move {
            while let Some(event) = snoop_rx.recv().await {
                let session = {
                    let devices = shared.devices.lock().await;
                    devices
                        .get(&event.peer())
                        .and_then(|entry| entry.session.clone())
                };
                let Some(session) = session else {
                    debug!(peer = %event.peer(), "capture event without live session");
                    continue;
                };
                let sample = match event {
                    SnoopEvent::DataSent {
                        packet_index,
                        capture_ts,
                        ..
                    } => session.capture_data_sent(packet_index, capture_ts).await,
                    SnoopEvent::AckReceived {
                        packet_index,
                        capture_ts,
                        ..
                    } => session.capture_ack_received(packet_index, capture_ts).await,
                    SnoopEvent::DataReceived {
                        packet_index,
                        capture_ts,
                        ..
                    } => {
                        session.capture_data_received(packet_index, capture_ts).await;
                        None
                    }
                    SnoopEvent::AckSent {
                        packet_index,
                        capture_ts,
                        ..
                    } => {
                        session.capture_ack_sent(packet_index, capture_ts).await;
                        None
                    }
                };
                if let Some(sample) = sample {
                    let _ = shared.event_tx.send(LinkEvent::Sample(sample)).await;
                }
            }
        });

        self.aborts.lock().await.push(router.abort_handle());
        self.correlators.lock().await.push(correlator);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Best-effort teardown of background tasks; disconnect_all is the
        // orderly path.
        if let Ok(aborts) = self.aborts.try_lock() {
            for abort in aborts.iter() {
                abort.abort();
            }
        }
        if let Ok(correlators) = self.correlators.try_lock() {
            for correlator in correlators.iter() {
                correlator.abort();
            }
        }
    }
}
