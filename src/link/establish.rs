//! Connection establishment.
//!
//! For a pair of devices neither side knows in advance who can reach whom,
//! so establishment races an accept worker against a connect worker over
//! the same ordered list of service identifiers. The first worker to
//! produce a filter-accepted stream wins and the loser is cancelled by
//! dropping its in-flight accept/connect future, which closes its socket.
//!
//! The service list is bounded by the radio's concurrent-link limit; a
//! service identifier is a well-known port standing in for an RFCOMM-style
//! channel number.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use super::stream::LinkStream;
use crate::core::constants::{
    CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, PICONET_LINK_LIMIT, SERVICE_PORTS,
};
use crate::core::{DeviceId, EstablishError};

/// A well-known service endpoint on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u16);

impl ServiceId {
    /// The port this service listens on.
    pub fn port(self) -> u16 {
        self.0
    }
}

/// The protocol's well-known service list, in iteration order.
pub fn default_services() -> Vec<ServiceId> {
    SERVICE_PORTS.iter().copied().map(ServiceId).collect()
}

/// Pins the first admitted peer address and rejects later differing ones.
///
/// With a target set, only the target is ever admitted.
#[derive(Debug, Clone)]
pub struct AddressFilter {
    target: Option<IpAddr>,
    pinned: Option<IpAddr>,
}

impl AddressFilter {
    /// Filter for an establishment attempt; `target` of `None` means
    /// accept-any-then-pin.
    pub fn new(target: Option<IpAddr>) -> Self {
        Self {
            target,
            pinned: None,
        }
    }

    /// Whether `addr` may complete this establishment. The first admitted
    /// address becomes the pin.
    pub fn admit(&mut self, addr: IpAddr) -> bool {
        if let Some(target) = self.target {
            return addr == target;
        }
        match self.pinned {
            Some(pinned) => addr == pinned,
            None => {
                self.pinned = Some(addr);
                true
            }
        }
    }
}

/// Parameters of one establishment attempt.
#[derive(Debug, Clone)]
pub struct EstablishConfig {
    /// Remote address to dial; `None` runs the accept worker only.
    pub target: Option<IpAddr>,
    /// Ordered service identifiers both workers iterate.
    pub services: Vec<ServiceId>,
    /// Outbound attempts per service identifier.
    pub connect_attempts: u32,
    /// Backoff between failed outbound attempts.
    pub connect_retry_delay: Duration,
}

impl Default for EstablishConfig {
    fn default() -> Self {
        Self {
            target: None,
            services: default_services(),
            connect_attempts: CONNECT_ATTEMPTS,
            connect_retry_delay: CONNECT_RETRY_DELAY,
        }
    }
}

/// A won establishment race.
#[derive(Debug)]
pub struct Established {
    /// The established byte-stream link.
    pub stream: LinkStream,
    /// Whether the accept worker won (this side is the server).
    pub was_server: bool,
    /// The service identifier the link came up on.
    pub service: ServiceId,
}

impl Established {
    /// Resolve the peer's device id through the discovery directory.
    pub fn identify(&self, directory: &PeerDirectory) -> Result<DeviceId, EstablishError> {
        directory.device_id(self.stream.peer_addr().ip())
    }
}

/// Advertised names by peer address, as produced by the discovery layer.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    names: HashMap<IpAddr, String>,
}

impl PeerDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered device's advertised name.
    pub fn insert(&mut self, addr: IpAddr, name: impl Into<String>) {
        self.names.insert(addr, name.into());
    }

    /// Advertised name of a peer, if discovered.
    pub fn advertised_name(&self, addr: IpAddr) -> Option<&str> {
        self.names.get(&addr).map(String::as_str)
    }

    /// Device id parsed from the peer's advertised name suffix.
    pub fn device_id(&self, addr: IpAddr) -> Result<DeviceId, EstablishError> {
        let name = self
            .advertised_name(addr)
            .ok_or(EstablishError::UnknownPeer(addr))?;
        DeviceId::from_advertised_name(name)
            .ok_or_else(|| EstablishError::IdentityParse(name.to_string()))
    }
}

/// Run the establishment race to completion.
///
/// Exactly one of the accept or connect workers can win; the loser's
/// in-flight socket operation is cancelled by drop. Both workers
/// exhausting their service lists yields [`EstablishError::Exhausted`].
/// Cancelling the future running this call cancels both workers.
pub async fn establish(config: &EstablishConfig) -> Result<Established, EstablishError> {
    if config.services.len() > PICONET_LINK_LIMIT {
        return Err(EstablishError::ServiceListTooLong(config.services.len()));
    }

    let accept = accept_worker(config);
    let connect = connect_worker(config);
    tokio::pin!(accept, connect);
    let mut accept_done = false;
    let mut connect_done = false;

    loop {
        tokio::select! {
            won = &mut accept, if !accept_done => match won {
                Some(est) => return Ok(est),
                None => accept_done = true,
            },
            won = &mut connect, if !connect_done => match won {
                Some(est) => return Ok(est),
                None => connect_done = true,
            },
        }
        if accept_done && connect_done {
            return Err(EstablishError::Exhausted);
        }
    }
}

/// Listen once per service identifier; the first filter-admitted inbound
/// connection wins.
async fn accept_worker(config: &EstablishConfig) -> Option<Established> {
    let mut filter = AddressFilter::new(config.target);
    for &service in &config.services {
        let bind: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, service.port()).into();
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(err) => {
                trace!(port = service.port(), %err, "bind failed, next service");
                continue;
            }
        };
        match listener.accept().await {
            Ok((tcp, peer)) => {
                if !filter.admit(peer.ip()) {
                    debug!(%peer, "inbound peer rejected by address filter");
                    continue;
                }
                match LinkStream::from_tcp(tcp) {
                    Ok(stream) => {
                        debug!(port = service.port(), %peer, "accept worker won");
                        return Some(Established {
                            stream,
                            was_server: true,
                            service,
                        });
                    }
                    Err(err) => {
                        trace!(%err, "accepted stream unusable");
                        continue;
                    }
                }
            }
            Err(err) => {
                trace!(port = service.port(), %err, "accept failed, next service");
                continue;
            }
        }
    }
    None
}

/// Dial each service identifier with bounded retries and backoff.
async fn connect_worker(config: &EstablishConfig) -> Option<Established> {
    let target = config.target?;
    let mut filter = AddressFilter::new(config.target);
    for &service in &config.services {
        let addr = SocketAddr::new(target, service.port());
        for attempt in 1..=config.connect_attempts {
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    let Ok(stream) = LinkStream::from_tcp(tcp) else {
                        continue;
                    };
                    if !filter.admit(stream.peer_addr().ip()) {
                        continue;
                    }
                    debug!(%addr, attempt, "connect worker won");
                    return Some(Established {
                        stream,
                        was_server: false,
                        service,
                    });
                }
                Err(err) => {
                    trace!(%addr, attempt, %err, "connect attempt failed");
                    tokio::time::sleep(config.connect_retry_delay).await;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Grab a currently-free port for a test service identifier.
    async fn free_service() -> ServiceId {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ServiceId(listener.local_addr().unwrap().port())
    }

    fn config(target: Option<IpAddr>, services: Vec<ServiceId>) -> EstablishConfig {
        EstablishConfig {
            target,
            services,
            connect_attempts: 2,
            connect_retry_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_filter_pins_first_address() {
        let mut filter = AddressFilter::new(None);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(filter.admit(a));
        assert!(filter.admit(a));
        assert!(!filter.admit(b));
    }

    #[test]
    fn test_filter_with_target() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let mut filter = AddressFilter::new(Some(a));
        assert!(!filter.admit(b));
        assert!(filter.admit(a));
    }

    #[test]
    fn test_default_services_bounded() {
        assert!(default_services().len() <= PICONET_LINK_LIMIT);
    }

    #[tokio::test]
    async fn test_service_list_too_long() {
        let services = (0..8).map(|i| ServiceId(42000 + i)).collect();
        let result = establish(&config(None, services)).await;
        assert!(matches!(result, Err(EstablishError::ServiceListTooLong(8))));
    }

    #[tokio::test]
    async fn test_race_yields_one_server_one_client() {
        let service = free_service().await;

        // One side accepts only, the other dials; exactly one server role.
        let acceptor = tokio::spawn({
            let cfg = config(None, vec![service]);
            async move { establish(&cfg).await }
        });
        // Give the acceptor a beat to bind.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let dialer = establish(&config(Some(LOCALHOST), vec![service]))
            .await
            .unwrap();
        let accepted = acceptor.await.unwrap().unwrap();

        assert!(accepted.was_server);
        assert!(!dialer.was_server);
        assert_eq!(accepted.service, service);
        assert_eq!(dialer.service, service);
    }

    #[tokio::test]
    async fn test_exhausted_when_nothing_reachable() {
        let service = free_service().await;
        // Hold the port on loopback so the accept worker cannot bind, and
        // dial a loopback address nobody listens on.
        let _holder = TcpListener::bind((Ipv4Addr::LOCALHOST, service.port()))
            .await
            .unwrap();
        let target: IpAddr = "127.0.0.3".parse().unwrap();
        let result = establish(&config(Some(target), vec![service])).await;
        assert!(matches!(result, Err(EstablishError::Exhausted)));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_accept() {
        let service = free_service().await;
        let cfg = config(None, vec![service]);
        let handle = tokio::spawn(async move { establish(&cfg).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        assert!(handle.await.is_err());

        // The listener is gone: binding the port again succeeds.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let rebind: SocketAddr = (Ipv4Addr::LOCALHOST, service.port()).into();
        assert!(TcpListener::bind(rebind).await.is_ok());
    }

    #[test]
    fn test_directory_identity() {
        let addr: IpAddr = "10.0.0.9".parse().unwrap();
        let mut directory = PeerDirectory::new();

        assert!(matches!(
            directory.device_id(addr),
            Err(EstablishError::UnknownPeer(_))
        ));

        directory.insert(addr, "ranger-unnumbered");
        assert!(matches!(
            directory.device_id(addr),
            Err(EstablishError::IdentityParse(_))
        ));

        directory.insert(addr, "ranger-4");
        assert_eq!(directory.device_id(addr).unwrap(), DeviceId(4));
    }
}
