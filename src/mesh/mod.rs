//! Mesh connectivity over relay-signaled WebRTC data channels
//!
//! A relay (plain JSON over WebSocket) is used only to exchange
//! connection-setup metadata between peers that cannot yet reach each
//! other directly:
//! - outbound: ready, offer, answer, ice-candidate
//! - inbound: connection (roster), message (roster delta), offer,
//!   answer, ice-candidate

mod engine;
mod identity;
mod relay;
mod table;
mod transport;
mod types;


pub use engine::{EngineEvent, EngineSettings, MeshEngine, MeshHandle, RelayEvent};
pub use identity::Identity;
pub use relay::relay_task;
pub use table::ConnectionTable;
pub use transport::{PeerTransport, RtcTransportFactory, TransportEvent, TransportFactory};
pub use types::{
    ClientFrame, IceCandidate, PeerId, PeerRole, PeerSnapshot, PeerStatus, RelayFrame,
    RosterEntry, RosterPayload, SessionDescription,
};
