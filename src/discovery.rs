//! Peer discovery over UDP multicast.
//!
//! Every node joins a well-known multicast group, sends one `query` when
//! it starts, and announces itself every few seconds. Incoming datagrams
//! keep a private peer registry fresh; a sweep removes peers that have
//! gone quiet. Consumers watch the registry through broadcast events
//! rather than sharing it by reference.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{DiscoveryKind, DiscoveryPacket, LocalIdentity, Peer};
use crate::{ANNOUNCE_INTERVAL, MULTICAST_GROUP, MULTICAST_PORT, PEER_EXPIRY, QUERY_REPLY_JITTER_MS, SWEEP_INTERVAL};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("socket error: {0}")]
    Socket(String),
}

/// Peer lifecycle events, in emission order per subscriber.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First datagram from a previously unknown id.
    PeerFound(Peer),

    /// A known peer refreshed its entry (address or name may change).
    PeerUpdated(Peer),

    /// A peer went unseen past the expiry window.
    PeerLost(String),
}

/// Discovery timing and addressing knobs.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub announce_interval: Duration,
    pub sweep_interval: Duration,
    pub peer_expiry: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: MULTICAST_PORT,
            announce_interval: ANNOUNCE_INTERVAL,
            sweep_interval: SWEEP_INTERVAL,
            peer_expiry: PEER_EXPIRY,
        }
    }
}

/// Maintains the live peer registry via announce/query datagrams.
pub struct DiscoveryService {
    identity: LocalIdentity,
    config: DiscoveryConfig,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl DiscoveryService {
    pub fn new(identity: LocalIdentity, config: DiscoveryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            identity,
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            shutdown: Mutex::new(None),
        }
    }

    /// Subscribe to peer lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the currently known peers.
    pub async fn current_peers(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Join the group and start announcing, querying and sweeping.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        info!(
            "starting discovery on {}:{}",
            self.config.group, self.config.port
        );

        let socket = create_multicast_socket(self.config.group, self.config.port)?;
        let socket = UdpSocket::from_std(socket.into())?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown.lock().await = Some(shutdown_tx);

        let identity = self.identity.clone();
        let config = self.config.clone();
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let group_addr = SocketAddr::V4(SocketAddrV4::new(config.group, config.port));

        tokio::spawn(async move {
            // First ticks are deferred one period: the initial datagram on
            // join is the query below, not an announce.
            let start = tokio::time::Instant::now();
            let mut announce =
                tokio::time::interval_at(start + config.announce_interval, config.announce_interval);
            let mut sweep =
                tokio::time::interval_at(start + config.sweep_interval, config.sweep_interval);

            // Deadline of the jittered reply to a received query, if any.
            let mut reply_at: Option<tokio::time::Instant> = None;
            let mut buf = [0u8; 4096];

            if let Err(e) =
                send_packet(&socket, &identity, DiscoveryKind::Query, group_addr).await
            {
                error!("failed to send initial query: {e}");
            }

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("discovery shutting down");
                        if let Err(e) =
                            socket.leave_multicast_v4(config.group, Ipv4Addr::UNSPECIFIED)
                        {
                            debug!("failed to leave multicast group: {e}");
                        }
                        break;
                    }

                    _ = announce.tick() => {
                        trace!("announcing to the group");
                        if let Err(e) =
                            send_packet(&socket, &identity, DiscoveryKind::Announce, group_addr).await
                        {
                            warn!("failed to announce: {e}");
                        }
                    }

                    _ = sweep.tick() => {
                        sweep_stale_peers(&peers, &event_tx, config.peer_expiry).await;
                    }

                    // Jittered reply to a query; the deadline is owned by
                    // this loop, so stop() can never leak it.
                    _ = async move {
                        if let Some(at) = reply_at {
                            tokio::time::sleep_until(at).await;
                        }
                    }, if reply_at.is_some() => {
                        reply_at = None;
                        if let Err(e) =
                            send_packet(&socket, &identity, DiscoveryKind::Announce, group_addr).await
                        {
                            warn!("failed to answer query: {e}");
                        }
                    }

                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, source)) => {
                                match handle_datagram(&buf[..len], source, &identity.id, &peers, &event_tx).await {
                                    Ok(Some(DiscoveryKind::Query)) if reply_at.is_none() => {
                                        let jitter = rand::thread_rng()
                                            .gen_range(0..=QUERY_REPLY_JITTER_MS);
                                        reply_at = Some(
                                            tokio::time::Instant::now()
                                                + Duration::from_millis(jitter),
                                        );
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        debug!("dropping datagram from {source}: {e}");
                                    }
                                }
                            }
                            Err(e) => {
                                error!("UDP receive error: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Leave the group and cancel the announce/sweep/reply timers.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Build the reusable multicast socket. Address reuse lets several nodes
/// share the group port on one host.
fn create_multicast_socket(group: Ipv4Addr, port: u16) -> Result<Socket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .map_err(|e| DiscoveryError::Socket(format!("failed to bind port {port}: {e}")))?;

    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| DiscoveryError::Socket(format!("failed to join {group}: {e}")))?;

    // Loopback delivery is required for multiple nodes on one machine;
    // the id self-filter discards our own datagrams.
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    Ok(socket)
}

/// Best non-loopback IPv4 address to advertise, if any.
pub fn local_ip() -> IpAddr {
    for iface in pnet_datalink::interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        for ip in &iface.ips {
            if let IpAddr::V4(v4) = ip.ip() {
                if !v4.is_loopback() {
                    return IpAddr::V4(v4);
                }
            }
        }
    }

    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

async fn send_packet(
    socket: &UdpSocket,
    identity: &LocalIdentity,
    kind: DiscoveryKind,
    group_addr: SocketAddr,
) -> Result<(), DiscoveryError> {
    let packet = DiscoveryPacket::new(kind, identity, local_ip());
    let bytes = packet.to_bytes()?;
    socket.send_to(&bytes, group_addr).await?;
    Ok(())
}

/// Apply one datagram to the registry.
///
/// Returns the datagram kind for foreign packets, `None` for our own.
/// Emits `PeerFound` exactly once per id; refreshes are `PeerUpdated`.
async fn handle_datagram(
    data: &[u8],
    source: SocketAddr,
    my_id: &str,
    peers: &Arc<RwLock<HashMap<String, Peer>>>,
    event_tx: &broadcast::Sender<DiscoveryEvent>,
) -> Result<Option<DiscoveryKind>, DiscoveryError> {
    let packet = DiscoveryPacket::from_bytes(data)?;

    if packet.id == my_id {
        trace!("ignoring our own datagram");
        return Ok(None);
    }

    let peer = Peer::from_packet(&packet, source.ip());
    let is_new = {
        let mut peers = peers.write().await;
        peers.insert(peer.id.clone(), peer.clone()).is_none()
    };

    let event = if is_new {
        info!(
            "discovered peer {} ({}) at {}:{}",
            peer.username, peer.id, peer.addr, peer.port
        );
        DiscoveryEvent::PeerFound(peer)
    } else {
        trace!("refreshed peer {}", peer.id);
        DiscoveryEvent::PeerUpdated(peer)
    };
    let _ = event_tx.send(event);

    Ok(Some(packet.kind))
}

/// Drop peers unseen past the expiry window, emitting `PeerLost` each.
async fn sweep_stale_peers(
    peers: &Arc<RwLock<HashMap<String, Peer>>>,
    event_tx: &broadcast::Sender<DiscoveryEvent>,
    expiry: Duration,
) {
    let mut peers = peers.write().await;
    let stale: Vec<String> = peers
        .iter()
        .filter(|(_, p)| p.is_stale(expiry))
        .map(|(id, _)| id.clone())
        .collect();

    for id in stale {
        if let Some(peer) = peers.remove(&id) {
            info!("peer lost: {} ({})", peer.username, id);
            let _ = event_tx.send(DiscoveryEvent::PeerLost(id));
        }
    }
}
