//! Parley — serverless chat between processes on the same LAN.
//!
//! Peers find each other over UDP multicast, exchange chat traffic over
//! plain TCP sessions, and protect direct messages with per-pair
//! X25519/AES-CBC encryption. There is no server and nothing is persisted:
//! every run advertises a fresh identity and a fresh key pair.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod listener;
pub mod protocol;
pub mod service;

use std::net::Ipv4Addr;
use std::time::Duration;

/// Well-known multicast group for peer discovery.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// UDP port the discovery group listens on.
pub const MULTICAST_PORT: u16 = 42999;

/// Preferred TCP port for incoming sessions (incremented on conflict).
pub const DEFAULT_TCP_PORT: u16 = 43000;

/// How many ports to try before giving up on startup.
pub const BIND_RETRY_ATTEMPTS: u16 = 10;

/// How often we announce ourselves to the group.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// How often stale peers are swept from the registry.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A peer unseen for longer than this is considered gone.
pub const PEER_EXPIRY: Duration = Duration::from_secs(15);

/// Upper bound of the random delay before answering a query.
pub const QUERY_REPLY_JITTER_MS: u64 = 1000;

/// First reconnect delay; doubles per attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Reconnect attempts before waiting for rediscovery.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Deadline for dialing a peer and for its handshake frame.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest session frame we accept.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Outbound queue depth per session.
pub const SESSION_QUEUE_DEPTH: usize = 32;
