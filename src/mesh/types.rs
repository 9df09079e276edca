//! Wire types for the relay signaling protocol

use serde::{Deserialize, Serialize};

/// Data channel label used for mesh payload traffic
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";

/// Opaque peer identifier, UUID-shaped, 128-bit random
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh identifier. Never reused within a process session.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines. Ids come off the wire,
    /// so truncation must stay on a char boundary.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((i, _)) => &self.0[..i],
            None => &self.0,
        }
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Negotiation status of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Connecting => write!(f, "connecting"),
            PeerStatus::Open => write!(f, "open"),
            PeerStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Which side of the negotiation this process took for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the offer and the data channel
    Initiator,
    /// Reacts to a received offer, obtains the channel from the remote
    Responder,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Initiator => write!(f, "initiator"),
            PeerRole::Responder => write!(f, "responder"),
        }
    }
}

/// Session description exchanged during offer/answer negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: "offer".to_string(), sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: "answer".to_string(), sdp: sdp.into() }
    }
}

/// Network path candidate proposed for the direct connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Frames this client publishes to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientFrame {
    Ready {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        role: String,
    },
    Offer {
        target: PeerId,
        offer: SessionDescription,
    },
    Answer {
        target: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        target: PeerId,
        candidate: IceCandidate,
    },
}

/// Frames the relay delivers to this client, validated at the boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// Initial roster of peers known to the relay
    Connection { peers: Vec<PeerId> },
    /// Roster delta, only acted on when `target` is our identifier
    Message {
        target: PeerId,
        payload: RosterPayload,
    },
    Offer {
        offer: SessionDescription,
        from: PeerId,
    },
    Answer {
        answer: SessionDescription,
        from: PeerId,
    },
    IceCandidate {
        candidate: IceCandidate,
        from: PeerId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterPayload {
    pub connections: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
}

/// Externally observable view of one peer, derived from the connection table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub status: PeerStatus,
    pub role: PeerRole,
}
