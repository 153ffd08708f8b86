//! Wire types for discovery and session traffic.
//!
//! Discovery datagrams are single JSON objects on the multicast group.
//! Session traffic is newline-delimited JSON: one frame per line, the
//! `type` field selecting the variant. Both directions use the same
//! closed [`Frame`] union, so a frame with an unknown discriminant or a
//! missing required field fails to parse instead of half-decoding.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, for message timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What this process advertises about itself.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Random per-run id (uuid v4); the identity, unlike the username.
    pub id: String,
    pub username: String,
    /// TCP port the inbound listener actually bound.
    pub port: u16,
    /// Hex-encoded X25519 public key for this run.
    pub public_key: String,
}

/// Discovery datagram kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    /// Periodic presence broadcast.
    Announce,
    /// Active solicitation sent on join; peers answer with an announce.
    Query,
}

/// A discovery datagram, announce and query alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPacket {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub id: String,
    pub username: String,
    /// Self-reported address; receivers prefer the datagram source.
    pub ip: IpAddr,
    pub port: u16,
    pub public_key: String,
    pub timestamp: u64,
}

impl DiscoveryPacket {
    pub fn new(kind: DiscoveryKind, identity: &LocalIdentity, ip: IpAddr) -> Self {
        Self {
            kind,
            id: identity.id.clone(),
            username: identity.username.clone(),
            ip,
            port: identity.port,
            public_key: identity.public_key.clone(),
            timestamp: unix_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// A peer as tracked in a registry.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub username: String,
    pub addr: IpAddr,
    pub port: u16,
    /// Hex-encoded X25519 public key from the peer's latest datagram.
    pub public_key: String,
    pub last_seen: Instant,
}

impl Peer {
    /// Build a registry entry from a datagram and its source address.
    pub fn from_packet(packet: &DiscoveryPacket, source: IpAddr) -> Self {
        Self {
            id: packet.id.clone(),
            username: packet.username.clone(),
            addr: source,
            port: packet.port,
            public_key: packet.public_key.clone(),
            last_seen: Instant::now(),
        }
    }

    pub fn is_stale(&self, expiry: Duration) -> bool {
        self.last_seen.elapsed() > expiry
    }
}

/// Presence transitions carried by `presence` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Joined,
    Leaving,
}

/// Everything that travels over a session, first frame included.
///
/// `hello` and `status` are only valid as the first frame of a
/// connection; the four chat kinds flow for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Handshake: who is on the other end of this session.
    Hello { id: String, username: String },

    /// Plaintext message to everyone.
    Broadcast {
        from: String,
        username: String,
        content: String,
        timestamp: u64,
    },

    /// Encrypted message to one peer. The sender's public key rides
    /// along so the receiver can derive the shared secret.
    #[serde(rename_all = "camelCase")]
    Dm {
        from: String,
        username: String,
        to: String,
        /// `hex(iv):hex(ciphertext)` blob, opaque to everything but the
        /// crypto engine.
        content: String,
        sender_public_key: String,
        timestamp: u64,
    },

    /// Transient typing notification.
    Typing {
        from: String,
        username: String,
        timestamp: u64,
    },

    /// Join/leave notice.
    Presence {
        from: String,
        username: String,
        status: PresenceStatus,
        timestamp: u64,
    },

    /// Side-channel probe; answered with `statusReply`, then the
    /// connection closes.
    Status,

    /// Answer to a `status` probe.
    #[serde(rename_all = "camelCase")]
    StatusReply { sessions: usize, uptime_secs: u64 },
}

impl Frame {
    pub fn hello(identity: &LocalIdentity) -> Self {
        Frame::Hello {
            id: identity.id.clone(),
            username: identity.username.clone(),
        }
    }

    pub fn broadcast(identity: &LocalIdentity, content: String) -> Self {
        Frame::Broadcast {
            from: identity.id.clone(),
            username: identity.username.clone(),
            content,
            timestamp: unix_millis(),
        }
    }

    pub fn dm(identity: &LocalIdentity, to: String, ciphertext: String) -> Self {
        Frame::Dm {
            from: identity.id.clone(),
            username: identity.username.clone(),
            to,
            content: ciphertext,
            sender_public_key: identity.public_key.clone(),
            timestamp: unix_millis(),
        }
    }

    pub fn typing(identity: &LocalIdentity) -> Self {
        Frame::Typing {
            from: identity.id.clone(),
            username: identity.username.clone(),
            timestamp: unix_millis(),
        }
    }

    pub fn presence(identity: &LocalIdentity, status: PresenceStatus) -> Self {
        Frame::Presence {
            from: identity.id.clone(),
            username: identity.username.clone(),
            status,
            timestamp: unix_millis(),
        }
    }

    /// Serialize with the trailing newline the session framing requires.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Parse a frame, tolerating the trailing newline.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            id: "id-1".into(),
            username: "alice".into(),
            port: 43000,
            public_key: "ab".repeat(32),
        }
    }

    #[test]
    fn discovery_packet_roundtrip() {
        let packet = DiscoveryPacket::new(
            DiscoveryKind::Announce,
            &identity(),
            "192.168.1.7".parse().unwrap(),
        );

        let bytes = packet.to_bytes().unwrap();
        let json = std::str::from_utf8(&bytes).unwrap();
        assert!(json.contains("\"type\":\"announce\""));
        assert!(json.contains("\"publicKey\""));

        let parsed = DiscoveryPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id, "id-1");
        assert_eq!(parsed.kind, DiscoveryKind::Announce);
        assert_eq!(parsed.port, 43000);
    }

    #[test]
    fn dm_frame_wire_shape() {
        let frame = Frame::dm(&identity(), "id-2".into(), "00ff:aabb".into());
        let line = frame.to_json_line().unwrap();

        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"dm\""));
        assert!(line.contains("\"senderPublicKey\""));

        match Frame::from_json(&line).unwrap() {
            Frame::Dm { to, content, .. } => {
                assert_eq!(to, "id-2");
                assert_eq!(content, "00ff:aabb");
            }
            other => panic!("expected dm, got {other:?}"),
        }
    }

    #[test]
    fn dm_without_recipient_is_rejected() {
        // `to` and `senderPublicKey` are required fields of the variant.
        let json = r#"{"type":"dm","from":"a","username":"alice","content":"x","timestamp":1}"#;
        assert!(Frame::from_json(json).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = r#"{"type":"shout","from":"a","content":"x"}"#;
        assert!(Frame::from_json(json).is_err());
    }

    #[test]
    fn status_probe_shape() {
        let line = Frame::Status.to_json_line().unwrap();
        assert_eq!(line.trim(), r#"{"type":"status"}"#);

        let reply = Frame::StatusReply {
            sessions: 3,
            uptime_secs: 42,
        };
        let line = reply.to_json_line().unwrap();
        assert!(line.contains("\"uptimeSecs\":42"));
    }

    #[test]
    fn peer_staleness() {
        let packet = DiscoveryPacket::new(
            DiscoveryKind::Query,
            &identity(),
            "10.0.0.2".parse().unwrap(),
        );
        let peer = Peer::from_packet(&packet, "10.0.0.9".parse().unwrap());

        // Address comes from the datagram source, not the ip field.
        assert_eq!(peer.addr, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert!(!peer.is_stale(Duration::from_secs(15)));

        std::thread::sleep(Duration::from_millis(5));
        assert!(peer.is_stale(Duration::from_millis(1)));
    }
}
