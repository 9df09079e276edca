pub mod config;
pub mod error;
pub mod mesh;

pub use config::Config;
pub use error::{MeshError, Result};
pub use mesh::{
    ConnectionTable, EngineEvent, EngineSettings, MeshEngine, MeshHandle, PeerId, PeerRole,
    PeerSnapshot, PeerStatus, PeerTransport, RelayEvent, TransportEvent, TransportFactory,
};
