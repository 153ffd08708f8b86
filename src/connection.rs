//! Outbound sessions and their lifecycle.
//!
//! The manager keeps at most one outbound session per discovered peer.
//! A failed dial or a dropped session schedules reconnection with
//! exponential backoff; once the attempt cap is exhausted the peer is
//! left alone until discovery reports it again. Sends are fire-and-forget
//! through per-session queues, so one slow peer never blocks another.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{Frame, LocalIdentity, Peer};
use crate::{
    CONNECT_TIMEOUT, MAX_FRAME_BYTES, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY,
    SESSION_QUEUE_DEPTH,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free port: tried {attempts} ports from {preferred}")]
    Bind { preferred: u16, attempts: u16 },
}

/// Session lifecycle and traffic events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    PeerConnected { id: String, username: String },

    /// Emitted when an open session drops and when a dial fails; either
    /// way the peer is unreachable right now.
    PeerDisconnected { id: String },

    MessageReceived { id: String, frame: Frame },
}

/// Dial and retry knobs; tests shrink the delays.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            base_delay: RECONNECT_BASE_DELAY,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

struct OutboundSession {
    tx: mpsc::Sender<Frame>,
}

struct ReconnectState {
    /// Retries scheduled so far; the delay doubles per retry.
    attempts: u32,
    timer: JoinHandle<()>,
}

/// Everything the session and timer tasks need, cheap to clone.
#[derive(Clone)]
struct Shared {
    identity: LocalIdentity,
    policy: ReconnectPolicy,
    sessions: Arc<RwLock<HashMap<String, OutboundSession>>>,
    reconnects: Arc<RwLock<HashMap<String, ReconnectState>>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

/// Opens and maintains one session per known peer.
pub struct ConnectionManager {
    shared: Shared,
}

impl ConnectionManager {
    pub fn new(identity: LocalIdentity, policy: ReconnectPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            shared: Shared {
                identity,
                policy,
                sessions: Arc::new(RwLock::new(HashMap::new())),
                reconnects: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Open a session to `peer` unless one already exists.
    ///
    /// Also a no-op while a reconnect timer for the peer is pending: the
    /// backoff schedule wins over rediscovery, otherwise the 5 s announce
    /// cadence would collapse it into a constant hammer.
    pub async fn connect(&self, peer: &Peer) {
        if self.shared.sessions.read().await.contains_key(&peer.id) {
            debug!("already connected to {}", peer.id);
            return;
        }
        if self.shared.reconnects.read().await.contains_key(&peer.id) {
            debug!("reconnect pending for {}, leaving the backoff alone", peer.id);
            return;
        }

        let shared = self.shared.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            attempt_session(shared, peer).await;
        });
    }

    /// Queue a frame for one peer. Best-effort: a missing or closed
    /// session logs a warning and reports `false`, never an error.
    pub async fn send_to(&self, id: &str, frame: Frame) -> bool {
        let tx = self
            .shared
            .sessions
            .read()
            .await
            .get(id)
            .map(|s| s.tx.clone());

        match tx {
            Some(tx) => match tx.send(frame).await {
                Ok(()) => true,
                Err(_) => {
                    warn!("session to {id} closed before send");
                    false
                }
            },
            None => {
                warn!("no open session to {id}, skipping");
                false
            }
        }
    }

    /// Fan a frame out to every peer with an open session; peers without
    /// one are skipped with a warning. Returns how many sends happened.
    pub async fn broadcast(&self, frame: Frame, peers: &[Peer]) -> usize {
        let mut sent = 0;
        for peer in peers {
            if self.send_to(&peer.id, frame.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Close the session and cancel any pending reconnect for one peer.
    pub async fn disconnect(&self, id: &str) {
        if let Some(state) = self.shared.reconnects.write().await.remove(id) {
            state.timer.abort();
        }
        if self.shared.sessions.write().await.remove(id).is_some() {
            info!("closed session to {id}");
        }
    }

    /// Close every session and cancel every pending reconnect.
    pub async fn disconnect_all(&self) {
        for (_, state) in self.shared.reconnects.write().await.drain() {
            state.timer.abort();
        }
        let count = {
            let mut sessions = self.shared.sessions.write().await;
            let count = sessions.len();
            sessions.clear();
            count
        };
        if count > 0 {
            info!("closed {count} outbound sessions");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.shared.sessions.read().await.contains_key(id)
    }

    pub async fn is_reconnect_pending(&self, id: &str) -> bool {
        self.shared.reconnects.read().await.contains_key(id)
    }
}

/// Dial a peer and, on success, run its session to completion.
async fn attempt_session(shared: Shared, peer: Peer) {
    let addr = SocketAddr::new(peer.addr, peer.port);
    debug!("dialing {} at {addr}", peer.id);

    let stream = match tokio::time::timeout(shared.policy.connect_timeout, TcpStream::connect(addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("failed to connect to {} at {addr}: {e}", peer.username);
            return connect_failed(shared, peer).await;
        }
        Err(_) => {
            warn!("connect to {} at {addr} timed out", peer.username);
            return connect_failed(shared, peer).await;
        }
    };

    run_session(shared, peer, stream).await;
}

/// Why a session loop ended.
enum SessionEnd {
    /// Remote closed or the socket failed: reconnect.
    Lost,
    /// Our side dropped the sender (disconnect/shutdown): stay down.
    Detached,
}

async fn run_session(shared: Shared, peer: Peer, stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();

    // Introduce ourselves before anything else flows.
    let hello = match Frame::hello(&shared.identity).to_json_line() {
        Ok(line) => line,
        Err(e) => {
            warn!("failed to serialize hello: {e}");
            return connect_failed(shared, peer).await;
        }
    };
    if let Err(e) = writer.write_all(hello.as_bytes()).await {
        warn!("handshake write to {} failed: {e}", peer.id);
        return connect_failed(shared, peer).await;
    }

    let (tx, mut rx) = mpsc::channel::<Frame>(SESSION_QUEUE_DEPTH);
    shared
        .sessions
        .write()
        .await
        .insert(peer.id.clone(), OutboundSession { tx });
    // Success clears the backoff state. Remove without aborting: on the
    // retry path the recorded timer is the task we are running in.
    shared.reconnects.write().await.remove(&peer.id);

    info!("connected to {} ({})", peer.username, peer.id);
    let _ = shared.event_tx.send(ConnectionEvent::PeerConnected {
        id: peer.id.clone(),
        username: peer.username.clone(),
    });

    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let end = loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => {
                        info!("{} closed the session", peer.username);
                        break SessionEnd::Lost;
                    }
                    Ok(n) if n > MAX_FRAME_BYTES => {
                        warn!("oversized frame from {}, dropping session", peer.id);
                        break SessionEnd::Lost;
                    }
                    Ok(_) => match Frame::from_json(&line) {
                        Ok(frame) => {
                            let _ = shared.event_tx.send(ConnectionEvent::MessageReceived {
                                id: peer.id.clone(),
                                frame,
                            });
                        }
                        Err(e) => {
                            warn!("malformed frame from {}: {e}", peer.id);
                        }
                    },
                    Err(e) => {
                        warn!("read error from {}: {e}", peer.id);
                        break SessionEnd::Lost;
                    }
                }
            }

            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        match frame.to_json_line() {
                            Ok(json) => {
                                if let Err(e) = writer.write_all(json.as_bytes()).await {
                                    warn!("write to {} failed: {e}", peer.id);
                                    break SessionEnd::Lost;
                                }
                                if let Err(e) = writer.flush().await {
                                    warn!("flush to {} failed: {e}", peer.id);
                                    break SessionEnd::Lost;
                                }
                            }
                            Err(e) => warn!("failed to serialize frame: {e}"),
                        }
                    }
                    None => break SessionEnd::Detached,
                }
            }
        }
    };

    shared.sessions.write().await.remove(&peer.id);
    let _ = shared.event_tx.send(ConnectionEvent::PeerDisconnected {
        id: peer.id.clone(),
    });

    if let SessionEnd::Lost = end {
        schedule_reconnect(shared, peer).await;
    }
}

async fn connect_failed(shared: Shared, peer: Peer) {
    let _ = shared.event_tx.send(ConnectionEvent::PeerDisconnected {
        id: peer.id.clone(),
    });
    schedule_reconnect(shared, peer).await;
}

/// Arm the next backoff timer, or give up at the attempt cap.
///
/// Returns a boxed `dyn Future + Send` rather than an `async fn` to break
/// the cyclic auto-trait inference (attempt_session -> schedule_reconnect
/// -> spawn -> attempt_session); the await sites then see a concrete,
/// known-Send future and the cycle terminates.
fn schedule_reconnect(
    shared: Shared,
    peer: Peer,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
    let attempts = shared
        .reconnects
        .read()
        .await
        .get(&peer.id)
        .map(|s| s.attempts)
        .unwrap_or(0);

    if attempts >= shared.policy.max_attempts {
        info!(
            "giving up on {} after {attempts} attempts, waiting for rediscovery",
            peer.id
        );
        shared.reconnects.write().await.remove(&peer.id);
        return;
    }

    let delay = shared.policy.base_delay * 2u32.pow(attempts);
    debug!(
        "reconnecting to {} in {delay:?} (attempt {}/{})",
        peer.id,
        attempts + 1,
        shared.policy.max_attempts
    );

    let timer = tokio::spawn({
        let shared = shared.clone();
        let peer = peer.clone();
        async move {
            tokio::time::sleep(delay).await;
            attempt_session(shared, peer).await;
        }
    });

    shared
        .reconnects
        .write()
        .await
        .insert(peer.id.clone(), ReconnectState {
            attempts: attempts + 1,
            timer,
        });
    })
}

/// Bind the preferred port, stepping upward on conflict.
pub(crate) async fn bind_with_retry(
    preferred: u16,
    attempts: u16,
) -> Result<tokio::net::TcpListener, ConnectionError> {
    for offset in 0..attempts {
        let port = preferred.saturating_add(offset);
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if offset > 0 {
                    info!("preferred port {preferred} busy, bound {port} instead");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                warn!("port {port} in use, trying the next one");
            }
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }

    Err(ConnectionError::Bind {
        preferred,
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            id: "me".into(),
            username: "alice".into(),
            port: 43000,
            public_key: "ab".repeat(32),
        }
    }

    fn peer_at(id: &str, addr: SocketAddr) -> Peer {
        Peer {
            id: id.into(),
            username: format!("user-{id}"),
            addr: addr.ip(),
            port: addr.port(),
            public_key: "cd".repeat(32),
            last_seen: Instant::now(),
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            connect_timeout: Duration::from_millis(500),
            base_delay: Duration::from_millis(25),
            max_attempts: 5,
        }
    }

    /// Accepts sessions and funnels every received line into a channel.
    async fn spawn_peer() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (addr, rx)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<ConnectionEvent>,
        within: Duration,
    ) -> Option<ConnectionEvent> {
        tokio::time::timeout(within, rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn connect_sends_hello_and_is_idempotent() {
        let manager = ConnectionManager::new(identity(), fast_policy());
        let mut events = manager.subscribe();
        let (addr, mut lines) = spawn_peer().await;
        let peer = peer_at("peer-1", addr);

        manager.connect(&peer).await;

        match next_event(&mut events, Duration::from_secs(2)).await {
            Some(ConnectionEvent::PeerConnected { id, .. }) => assert_eq!(id, "peer-1"),
            other => panic!("expected PeerConnected, got {other:?}"),
        }

        let hello = tokio::time::timeout(Duration::from_secs(2), lines.recv())
            .await
            .unwrap()
            .unwrap();
        match Frame::from_json(&hello).unwrap() {
            Frame::Hello { id, username } => {
                assert_eq!(id, "me");
                assert_eq!(username, "alice");
            }
            other => panic!("expected hello, got {other:?}"),
        }

        // A second connect must not open a second session.
        manager.connect(&peer).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.session_count().await, 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), lines.recv())
                .await
                .is_err(),
            "no second hello expected"
        );
    }

    #[tokio::test]
    async fn send_to_reaches_the_session() {
        let manager = ConnectionManager::new(identity(), fast_policy());
        let mut events = manager.subscribe();
        let (addr, mut lines) = spawn_peer().await;
        let peer = peer_at("peer-1", addr);

        manager.connect(&peer).await;
        next_event(&mut events, Duration::from_secs(2)).await;
        let _hello = lines.recv().await.unwrap();

        assert!(
            manager
                .send_to("peer-1", Frame::broadcast(&identity(), "hi all".into()))
                .await
        );

        let line = tokio::time::timeout(Duration::from_secs(2), lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Frame::from_json(&line).unwrap(),
            Frame::Broadcast { content, .. } if content == "hi all"
        ));
    }

    #[tokio::test]
    async fn broadcast_skips_sessionless_peers() {
        let manager = ConnectionManager::new(identity(), fast_policy());
        let mut events = manager.subscribe();

        let (addr_a, mut lines_a) = spawn_peer().await;
        let (addr_b, mut lines_b) = spawn_peer().await;
        let connected_a = peer_at("peer-a", addr_a);
        let connected_b = peer_at("peer-b", addr_b);
        // Known from discovery but never connected.
        let lonely = peer_at("peer-c", "127.0.0.1:1".parse().unwrap());

        manager.connect(&connected_a).await;
        manager.connect(&connected_b).await;
        next_event(&mut events, Duration::from_secs(2)).await;
        next_event(&mut events, Duration::from_secs(2)).await;
        let _ = lines_a.recv().await;
        let _ = lines_b.recv().await;

        let sent = manager
            .broadcast(
                Frame::broadcast(&identity(), "hi".into()),
                &[connected_a, connected_b, lonely],
            )
            .await;

        assert_eq!(sent, 2, "exactly the two live sessions receive the send");
        assert!(lines_a.recv().await.is_some());
        assert!(lines_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn unreachable_peer_gets_capped_backoff() {
        let manager = ConnectionManager::new(identity(), fast_policy());
        let mut events = manager.subscribe();

        // Grab a port and release it so the dial is refused.
        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let peer = peer_at("gone", dead_addr);

        let started = Instant::now();
        manager.connect(&peer).await;

        // Initial failure plus exactly five retries.
        for attempt in 0..6 {
            match next_event(&mut events, Duration::from_secs(5)).await {
                Some(ConnectionEvent::PeerDisconnected { id }) => assert_eq!(id, "gone"),
                other => panic!("attempt {attempt}: expected PeerDisconnected, got {other:?}"),
            }
        }

        // Retries back off: 25+50+100+200+400 ms of sleeping at minimum.
        assert!(
            started.elapsed() >= Duration::from_millis(700),
            "backoff finished too quickly: {:?}",
            started.elapsed()
        );

        // After the cap: state cleared, no further attempts.
        assert!(
            next_event(&mut events, Duration::from_millis(900)).await.is_none(),
            "no attempts expected after the cap"
        );
        assert!(!manager.is_reconnect_pending("gone").await);
        assert_eq!(manager.session_count().await, 0);

        // A fresh discovery event starts a new attempt cycle.
        manager.connect(&peer).await;
        assert!(next_event(&mut events, Duration::from_secs(2)).await.is_some());
    }

    /// Long first delay so assertions land well inside the backoff window.
    fn slow_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            connect_timeout: Duration::from_millis(500),
            base_delay: Duration::from_millis(400),
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn connect_defers_to_pending_backoff() {
        let manager = ConnectionManager::new(identity(), slow_policy());
        let mut events = manager.subscribe();

        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let peer = peer_at("gone", dead_addr);

        manager.connect(&peer).await;
        // First failure arrives; give the backoff timer a beat to arm.
        next_event(&mut events, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_reconnect_pending("gone").await);

        // Rediscovery mid-backoff must not spawn an extra attempt: the
        // retry is still ~350ms out, so nothing may fail before then.
        manager.connect(&peer).await;
        let before_retry = next_event(&mut events, Duration::from_millis(150)).await;
        assert!(before_retry.is_none(), "backoff should win over rediscovery");
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let manager = ConnectionManager::new(identity(), slow_policy());
        let mut events = manager.subscribe();

        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let peer = peer_at("gone", dead_addr);

        manager.connect(&peer).await;
        next_event(&mut events, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_reconnect_pending("gone").await);

        manager.disconnect("gone").await;
        assert!(!manager.is_reconnect_pending("gone").await);
        assert!(
            next_event(&mut events, Duration::from_millis(600)).await.is_none(),
            "cancelled timer must not fire"
        );
    }

    #[tokio::test]
    async fn bind_retry_steps_past_occupied_ports() {
        let occupied = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let taken = occupied.local_addr().unwrap().port();

        let listener = bind_with_retry(taken, 10).await.unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert!(bound > taken && bound < taken + 10);
    }
}
