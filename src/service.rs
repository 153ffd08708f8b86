//! The chat service: glue between discovery, sessions and the UI.
//!
//! Owns the merged peer registry, reacts to peer lifecycle events by
//! opening and closing sessions, dispatches inbound frames by kind, and
//! executes the UI collaborator's commands. Everything upward is a
//! broadcast event; everything downward is a channel command. Direct
//! messages are opaque here except for the encrypt/decrypt boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{ConnectionError, ConnectionEvent, ConnectionManager, ReconnectPolicy};
use crate::crypto::{CryptoEngine, Decrypted};
use crate::discovery::{DiscoveryConfig, DiscoveryError, DiscoveryEvent, DiscoveryService};
use crate::listener::{InboundListener, ListenerEvent};
use crate::protocol::{Frame, LocalIdentity, Peer, PresenceStatus};

/// What a failed direct message renders as.
pub const DECRYPT_FAILURE_MARKER: &str = "[unable to decrypt]";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service not started")]
    NotStarted,
}

/// Events for the UI collaborator, in emission order per subscriber.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    PeerFound { id: String, username: String },
    PeerLost { id: String },
    PeerConnected { id: String, username: String },
    PeerDisconnected { id: String },
    Broadcast { from: String, username: String, content: String, timestamp: u64 },
    /// Decrypted direct message; `content` is the failure marker when
    /// decryption did not work out.
    Direct { from: String, username: String, content: String, timestamp: u64 },
    Typing { from: String, username: String },
    Presence { from: String, username: String, status: PresenceStatus },
    /// Non-fatal failure surfaced to the user (unknown recipient, ...).
    Error { message: String },
}

/// Commands from the UI collaborator.
#[derive(Debug)]
pub enum ChatCommand {
    SendBroadcast(String),
    SendDirect { username: String, text: String },
    SendTyping,
    Shutdown,
}

/// Point-in-time counters for local consumers.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub peers: usize,
    pub inbound_sessions: usize,
    pub outbound_sessions: usize,
    pub uptime: Duration,
}

struct Running {
    listener: Arc<InboundListener>,
    connections: Arc<ConnectionManager>,
}

/// The node: one of these per process.
pub struct ChatService {
    id: String,
    username: String,
    preferred_port: u16,
    crypto: Arc<CryptoEngine>,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    event_tx: broadcast::Sender<ChatEvent>,
    command_tx: mpsc::Sender<ChatCommand>,
    command_rx: Option<mpsc::Receiver<ChatCommand>>,
    started_at: Instant,
    running: Option<Running>,
}

impl ChatService {
    pub fn new(config: &Config) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);

        Self {
            // Random per-run identity; usernames are display-only.
            id: Uuid::new_v4().to_string(),
            username: config.username.clone(),
            preferred_port: config.port,
            crypto: Arc::new(CryptoEngine::new()),
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            command_tx,
            command_rx: Some(command_rx),
            started_at: Instant::now(),
            running: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Subscribe to chat events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    /// Handle for issuing commands.
    pub fn command_sender(&self) -> mpsc::Sender<ChatCommand> {
        self.command_tx.clone()
    }

    /// Convenience wrapper for the shutdown command.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(ChatCommand::Shutdown).await;
    }

    /// Bind, advertise, and start reacting to peers and commands.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        let listener = Arc::new(InboundListener::new(self.id.clone(), self.preferred_port));
        let port = listener.start().await?;

        let identity = LocalIdentity {
            id: self.id.clone(),
            username: self.username.clone(),
            port,
            public_key: self.crypto.public_key_hex(),
        };

        let connections = Arc::new(ConnectionManager::new(
            identity.clone(),
            ReconnectPolicy::default(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            identity.clone(),
            DiscoveryConfig::default(),
        ));

        // Handlers subscribe before discovery starts emitting, so no
        // event is ever missed.
        self.spawn_discovery_handler(&discovery, &connections);
        self.spawn_listener_handler(&listener);
        self.spawn_connection_handler(&connections, &identity);
        self.spawn_command_handler(&identity, &discovery, &listener, &connections);

        discovery.start().await?;

        info!(
            "node {} ({}) up, listening on port {port}",
            self.username, self.id
        );

        self.running = Some(Running {
            listener,
            connections,
        });
        Ok(())
    }

    /// Current counters; requires a started service.
    pub async fn status(&self) -> Result<StatusReport, ServiceError> {
        let running = self.running.as_ref().ok_or(ServiceError::NotStarted)?;
        Ok(StatusReport {
            peers: self.peers.read().await.len(),
            inbound_sessions: running.listener.session_count().await,
            outbound_sessions: running.connections.session_count().await,
            uptime: self.started_at.elapsed(),
        })
    }

    fn spawn_discovery_handler(
        &self,
        discovery: &Arc<DiscoveryService>,
        connections: &Arc<ConnectionManager>,
    ) {
        let mut rx = discovery.subscribe();
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let connections = connections.clone();

        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    DiscoveryEvent::PeerFound(peer) => {
                        peers.write().await.insert(peer.id.clone(), peer.clone());
                        let _ = event_tx.send(ChatEvent::PeerFound {
                            id: peer.id.clone(),
                            username: peer.username.clone(),
                        });
                        connections.connect(&peer).await;
                    }
                    DiscoveryEvent::PeerUpdated(peer) => {
                        // Keep addresses and names fresh; no UI event.
                        peers.write().await.insert(peer.id.clone(), peer);
                    }
                    DiscoveryEvent::PeerLost(id) => {
                        peers.write().await.remove(&id);
                        connections.disconnect(&id).await;
                        let _ = event_tx.send(ChatEvent::PeerLost { id });
                    }
                }
            }
        });
    }

    fn spawn_listener_handler(&self, listener: &Arc<InboundListener>) {
        let mut rx = listener.subscribe();
        let event_tx = self.event_tx.clone();
        let crypto = self.crypto.clone();
        let my_id = self.id.clone();

        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    ListenerEvent::PeerConnected { id, username } => {
                        let _ = event_tx.send(ChatEvent::PeerConnected { id, username });
                    }
                    ListenerEvent::PeerDisconnected { id } => {
                        let _ = event_tx.send(ChatEvent::PeerDisconnected { id });
                    }
                    ListenerEvent::MessageReceived { frame, .. } => {
                        handle_frame(frame, &my_id, &crypto, &event_tx);
                    }
                }
            }
        });
    }

    fn spawn_connection_handler(
        &self,
        connections: &Arc<ConnectionManager>,
        identity: &LocalIdentity,
    ) {
        let mut rx = connections.subscribe();
        let event_tx = self.event_tx.clone();
        let crypto = self.crypto.clone();
        let my_id = self.id.clone();
        let connections = connections.clone();
        let identity = identity.clone();

        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    ConnectionEvent::PeerConnected { id, username } => {
                        // Greet the freshly opened session.
                        connections
                            .send_to(&id, Frame::presence(&identity, PresenceStatus::Joined))
                            .await;
                        let _ = event_tx.send(ChatEvent::PeerConnected { id, username });
                    }
                    ConnectionEvent::PeerDisconnected { id } => {
                        let _ = event_tx.send(ChatEvent::PeerDisconnected { id });
                    }
                    ConnectionEvent::MessageReceived { frame, .. } => {
                        handle_frame(frame, &my_id, &crypto, &event_tx);
                    }
                }
            }
        });
    }

    fn spawn_command_handler(
        &mut self,
        identity: &LocalIdentity,
        discovery: &Arc<DiscoveryService>,
        listener: &Arc<InboundListener>,
        connections: &Arc<ConnectionManager>,
    ) {
        let Some(mut command_rx) = self.command_rx.take() else {
            // start() ran twice; the first handler keeps the receiver.
            warn!("command handler already running");
            return;
        };
        let identity = identity.clone();
        let discovery = discovery.clone();
        let listener = listener.clone();
        let connections = connections.clone();
        let peers = self.peers.clone();
        let crypto = self.crypto.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    ChatCommand::SendBroadcast(text) => {
                        let targets: Vec<Peer> =
                            peers.read().await.values().cloned().collect();
                        let frame = Frame::broadcast(&identity, text);
                        let sent = connections.broadcast(frame, &targets).await;
                        debug!("broadcast reached {sent}/{} peers", targets.len());
                    }

                    ChatCommand::SendDirect { username, text } => {
                        let peer = find_by_username(&*peers.read().await, &username);
                        let Some(peer) = peer else {
                            warn!("no peer named '{username}'");
                            let _ = event_tx.send(ChatEvent::Error {
                                message: format!("no peer named '{username}'"),
                            });
                            continue;
                        };

                        match crypto.encrypt(&text, &peer.public_key) {
                            Ok(blob) => {
                                let frame = Frame::dm(&identity, peer.id.clone(), blob);
                                connections.send_to(&peer.id, frame).await;
                            }
                            Err(e) => {
                                warn!("could not encrypt for {username}: {e}");
                                let _ = event_tx.send(ChatEvent::Error {
                                    message: format!("could not encrypt for '{username}': {e}"),
                                });
                            }
                        }
                    }

                    ChatCommand::SendTyping => {
                        let targets: Vec<Peer> =
                            peers.read().await.values().cloned().collect();
                        let frame = Frame::typing(&identity);
                        connections.broadcast(frame, &targets).await;
                    }

                    ChatCommand::Shutdown => {
                        info!("shutting down chat service");
                        let targets: Vec<Peer> =
                            peers.read().await.values().cloned().collect();
                        connections
                            .broadcast(
                                Frame::presence(&identity, PresenceStatus::Leaving),
                                &targets,
                            )
                            .await;
                        discovery.stop().await;
                        connections.disconnect_all().await;
                        listener.stop().await;
                        break;
                    }
                }
            }
            info!("chat service stopped");
        });
    }
}

/// Linear username lookup; with duplicate usernames one arbitrary entry
/// wins. Ids are identity, usernames are labels.
fn find_by_username(peers: &HashMap<String, Peer>, username: &str) -> Option<Peer> {
    peers.values().find(|p| p.username == username).cloned()
}

/// Dispatch one inbound chat frame to the UI stream.
fn handle_frame(
    frame: Frame,
    my_id: &str,
    crypto: &CryptoEngine,
    event_tx: &broadcast::Sender<ChatEvent>,
) {
    match frame {
        Frame::Broadcast {
            from,
            username,
            content,
            timestamp,
        } => {
            let _ = event_tx.send(ChatEvent::Broadcast {
                from,
                username,
                content,
                timestamp,
            });
        }

        Frame::Dm {
            from,
            username,
            to,
            content,
            sender_public_key,
            timestamp,
        } => {
            if to != my_id {
                debug!("dm for {to} surfaced here, dropping");
                return;
            }

            let content = match crypto.decrypt(&content, &sender_public_key) {
                Ok(Decrypted::Plaintext(text)) => text,
                Ok(Decrypted::Undecryptable) => {
                    warn!("undecryptable dm from {username}");
                    DECRYPT_FAILURE_MARKER.to_string()
                }
                Err(e) => {
                    warn!("malformed dm from {username}: {e}");
                    DECRYPT_FAILURE_MARKER.to_string()
                }
            };

            let _ = event_tx.send(ChatEvent::Direct {
                from,
                username,
                content,
                timestamp,
            });
        }

        Frame::Typing { from, username, .. } => {
            let _ = event_tx.send(ChatEvent::Typing { from, username });
        }

        Frame::Presence {
            from,
            username,
            status,
            ..
        } => {
            let _ = event_tx.send(ChatEvent::Presence {
                from,
                username,
                status,
            });
        }

        Frame::Hello { .. } | Frame::Status | Frame::StatusReply { .. } => {
            debug!("control frame outside its place, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::unix_millis;
    use std::net::IpAddr;

    fn peer(id: &str, username: &str, public_key: &str) -> Peer {
        Peer {
            id: id.into(),
            username: username.into(),
            addr: "10.0.0.5".parse::<IpAddr>().unwrap(),
            port: 43000,
            public_key: public_key.into(),
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn username_resolution_is_first_match_or_none() {
        let mut peers = HashMap::new();
        peers.insert("a".to_string(), peer("a", "alice", "00"));
        peers.insert("b".to_string(), peer("b", "bob", "00"));
        peers.insert("b2".to_string(), peer("b2", "bob", "00"));

        assert_eq!(find_by_username(&peers, "alice").unwrap().id, "a");
        assert!(find_by_username(&peers, "nobody").is_none());

        // Duplicate usernames resolve to exactly one of the candidates.
        let hit = find_by_username(&peers, "bob").unwrap();
        assert!(hit.id == "b" || hit.id == "b2");
    }

    #[test]
    fn dm_for_us_is_decrypted() {
        let alice = CryptoEngine::new();
        let bob = CryptoEngine::new();
        let (event_tx, mut event_rx) = broadcast::channel(8);

        let blob = alice.encrypt("psst", &bob.public_key_hex()).unwrap();
        let frame = Frame::Dm {
            from: "peer-a".into(),
            username: "alice".into(),
            to: "me".into(),
            content: blob,
            sender_public_key: alice.public_key_hex(),
            timestamp: unix_millis(),
        };

        handle_frame(frame, "me", &bob, &event_tx);

        match event_rx.try_recv().unwrap() {
            ChatEvent::Direct { content, username, .. } => {
                assert_eq!(content, "psst");
                assert_eq!(username, "alice");
            }
            other => panic!("expected Direct, got {other:?}"),
        }
    }

    #[test]
    fn bad_dm_renders_the_failure_marker() {
        let alice = CryptoEngine::new();
        let bob = CryptoEngine::new();
        let eve = CryptoEngine::new();
        let (event_tx, mut event_rx) = broadcast::channel(8);

        // Encrypted for eve, not for bob: wrong key at the receiver.
        let blob = alice.encrypt("psst", &eve.public_key_hex()).unwrap();
        let frame = Frame::Dm {
            from: "peer-a".into(),
            username: "alice".into(),
            to: "me".into(),
            content: blob,
            sender_public_key: alice.public_key_hex(),
            timestamp: unix_millis(),
        };
        handle_frame(frame, "me", &bob, &event_tx);
        match event_rx.try_recv().unwrap() {
            ChatEvent::Direct { content, .. } => assert_eq!(content, DECRYPT_FAILURE_MARKER),
            other => panic!("expected Direct, got {other:?}"),
        }

        // Garbage blob: also the marker, never a crash.
        let frame = Frame::Dm {
            from: "peer-a".into(),
            username: "alice".into(),
            to: "me".into(),
            content: "garbage".into(),
            sender_public_key: alice.public_key_hex(),
            timestamp: unix_millis(),
        };
        handle_frame(frame, "me", &bob, &event_tx);
        match event_rx.try_recv().unwrap() {
            ChatEvent::Direct { content, .. } => assert_eq!(content, DECRYPT_FAILURE_MARKER),
            other => panic!("expected Direct, got {other:?}"),
        }
    }

    #[test]
    fn misaddressed_dm_is_dropped() {
        let bob = CryptoEngine::new();
        let (event_tx, mut event_rx) = broadcast::channel(8);

        let frame = Frame::Dm {
            from: "peer-a".into(),
            username: "alice".into(),
            to: "someone-else".into(),
            content: "00:aa".into(),
            sender_public_key: "ab".repeat(32),
            timestamp: unix_millis(),
        };
        handle_frame(frame, "me", &bob, &event_tx);
        assert!(event_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_and_transients_pass_through() {
        let bob = CryptoEngine::new();
        let (event_tx, mut event_rx) = broadcast::channel(8);

        let frame = Frame::Broadcast {
            from: "peer-a".into(),
            username: "alice".into(),
            content: "hi all".into(),
            timestamp: unix_millis(),
        };
        handle_frame(frame, "me", &bob, &event_tx);
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            ChatEvent::Broadcast { content, .. } if content == "hi all"
        ));

        let frame = Frame::Typing {
            from: "peer-a".into(),
            username: "alice".into(),
            timestamp: unix_millis(),
        };
        handle_frame(frame, "me", &bob, &event_tx);
        assert!(matches!(event_rx.try_recv().unwrap(), ChatEvent::Typing { .. }));

        let frame = Frame::Presence {
            from: "peer-a".into(),
            username: "alice".into(),
            status: PresenceStatus::Leaving,
            timestamp: unix_millis(),
        };
        handle_frame(frame, "me", &bob, &event_tx);
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            ChatEvent::Presence { status: PresenceStatus::Leaving, .. }
        ));
    }
}
