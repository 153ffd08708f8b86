//! Inbound sessions.
//!
//! Binds a local TCP port (stepping upward if the preferred one is
//! taken), requires every connection to introduce itself with a `hello`
//! frame, and forwards decoded traffic upward. Two special cases live
//! here: direct messages addressed to a peer that also has a session on
//! this listener are relayed straight across, and a `status` first frame
//! is answered with the session count and uptime, then closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::connection::{bind_with_retry, ConnectionError};
use crate::protocol::Frame;
use crate::{BIND_RETRY_ATTEMPTS, CONNECT_TIMEOUT, MAX_FRAME_BYTES, SESSION_QUEUE_DEPTH};

/// Session lifecycle and traffic events, mirroring the outbound side.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    PeerConnected { id: String, username: String },
    PeerDisconnected { id: String },
    MessageReceived { id: String, frame: Frame },
}

struct InboundSession {
    username: String,
    tx: mpsc::Sender<Frame>,
}

type Sessions = Arc<RwLock<HashMap<String, InboundSession>>>;

/// Accepts sessions initiated by other peers.
pub struct InboundListener {
    my_id: String,
    preferred_port: u16,
    sessions: Sessions,
    event_tx: broadcast::Sender<ListenerEvent>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    started_at: Instant,
}

impl InboundListener {
    pub fn new(my_id: String, preferred_port: u16) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            my_id,
            preferred_port,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            shutdown: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.event_tx.subscribe()
    }

    /// Bind and start accepting. Returns the port actually bound, which
    /// is what discovery must advertise. Running out of ports to try is
    /// the one fatal startup error this crate has.
    pub async fn start(&self) -> Result<u16, ConnectionError> {
        let listener = bind_with_retry(self.preferred_port, BIND_RETRY_ATTEMPTS).await?;
        let port = listener.local_addr()?.port();
        info!("listening for sessions on port {port}");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown.lock().await = Some(shutdown_tx);

        let my_id = self.my_id.clone();
        let sessions = self.sessions.clone();
        let event_tx = self.event_tx.clone();
        let started_at = self.started_at;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("listener shutting down");
                        // Dropping the senders ends every session loop.
                        sessions.write().await.clear();
                        break;
                    }

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("incoming connection from {addr}");
                                let my_id = my_id.clone();
                                let sessions = sessions.clone();
                                let event_tx = event_tx.clone();
                                tokio::spawn(async move {
                                    handle_connection(
                                        stream, addr, my_id, sessions, event_tx, started_at,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => {
                                warn!("accept failed: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(port)
    }

    /// Close the accept loop and every inbound session.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Direct unicast to a known inbound session.
    pub async fn send_to(&self, id: &str, frame: Frame) -> bool {
        let tx = self.sessions.read().await.get(id).map(|s| s.tx.clone());
        match tx {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => {
                warn!("no inbound session for {id}");
                false
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Drive one accepted connection: handshake, then session or probe.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    my_id: String,
    sessions: Sessions,
    event_tx: broadcast::Sender<ListenerEvent>,
    started_at: Instant,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // The first frame decides what this connection is.
    let first = match tokio::time::timeout(CONNECT_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(0)) => {
            debug!("{addr} closed before the handshake");
            return;
        }
        Ok(Ok(_)) => match Frame::from_json(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unparseable handshake from {addr}: {e}");
                return;
            }
        },
        Ok(Err(e)) => {
            debug!("handshake read from {addr} failed: {e}");
            return;
        }
        Err(_) => {
            warn!("{addr} sent no handshake within the deadline");
            return;
        }
    };

    let (peer_id, username) = match first {
        Frame::Hello { id, username } => (id, username),

        Frame::Status => {
            let reply = Frame::StatusReply {
                sessions: sessions.read().await.len(),
                uptime_secs: started_at.elapsed().as_secs(),
            };
            match reply.to_json_line() {
                Ok(json) => {
                    if let Err(e) = writer.write_all(json.as_bytes()).await {
                        debug!("status reply to {addr} failed: {e}");
                    }
                }
                Err(e) => warn!("failed to serialize status reply: {e}"),
            }
            return;
        }

        other => {
            warn!(
                "{addr} opened with {other:?} instead of introducing itself"
            );
            return;
        }
    };

    info!("session from {username} ({peer_id}) at {addr}");

    let (tx, mut rx) = mpsc::channel::<Frame>(SESSION_QUEUE_DEPTH);
    {
        let mut map = sessions.write().await;
        // A replaced entry drops its sender, ending the stale loop.
        map.insert(
            peer_id.clone(),
            InboundSession {
                username: username.clone(),
                tx: tx.clone(),
            },
        );
    }

    let _ = event_tx.send(ListenerEvent::PeerConnected {
        id: peer_id.clone(),
        username: username.clone(),
    });

    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => {
                        info!("{username} closed the session");
                        break;
                    }
                    Ok(n) if n > MAX_FRAME_BYTES => {
                        warn!("oversized frame from {peer_id}, dropping session");
                        break;
                    }
                    Ok(_) => {
                        match Frame::from_json(&line) {
                            Ok(frame) => {
                                dispatch_frame(frame, &peer_id, &my_id, &sessions, &event_tx)
                                    .await;
                            }
                            Err(e) => {
                                // Malformed payloads are dropped, the
                                // session stays up.
                                warn!("malformed frame from {peer_id}: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        warn!("read error from {peer_id}: {e}");
                        break;
                    }
                }
            }

            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        match frame.to_json_line() {
                            Ok(json) => {
                                if writer.write_all(json.as_bytes()).await.is_err()
                                    || writer.flush().await.is_err()
                                {
                                    warn!("write to {peer_id} failed");
                                    break;
                                }
                            }
                            Err(e) => warn!("failed to serialize frame: {e}"),
                        }
                    }
                    // Listener stop or replacement by a newer session.
                    None => break,
                }
            }
        }
    }

    // Only remove the entry if it is still ours; a newer session for the
    // same peer id may have replaced it.
    let removed = {
        let mut map = sessions.write().await;
        if map.get(&peer_id).is_some_and(|s| s.tx.same_channel(&tx)) {
            map.remove(&peer_id);
            true
        } else {
            false
        }
    };
    if removed {
        let _ = event_tx.send(ListenerEvent::PeerDisconnected { id: peer_id });
    }
}

/// Route one inbound frame: relay locally-addressed dms, hand the rest up.
async fn dispatch_frame(
    frame: Frame,
    session_id: &str,
    my_id: &str,
    sessions: &Sessions,
    event_tx: &broadcast::Sender<ListenerEvent>,
) {
    if let Frame::Dm { to, .. } = &frame {
        if to != my_id {
            // Relay to the target's session if it lives here; this is
            // pure forwarding and never reaches the router.
            let target = sessions
                .read()
                .await
                .get(to)
                .map(|s| (s.username.clone(), s.tx.clone()));
            match target {
                Some((username, tx)) => {
                    debug!("relaying dm from {session_id} to {username} ({to})");
                    let to = to.clone();
                    if tx.send(frame).await.is_err() {
                        warn!("relay target {to} went away mid-send");
                    }
                }
                None => {
                    debug!("dm from {session_id} for unknown peer {to}, dropping");
                }
            }
            return;
        }
    }

    let _ = event_tx.send(ListenerEvent::MessageReceived {
        id: session_id.to_string(),
        frame,
    });
}
