//! Error types for meshlink

use thiserror::Error;

use crate::mesh::PeerId;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Invalid relay frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("Relay connection error: {0}")]
    Relay(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("No open data channel to {0}")]
    ChannelNotOpen(PeerId),

    #[error("Engine is shut down")]
    EngineClosed,
}

pub type Result<T> = std::result::Result<T, MeshError>;
