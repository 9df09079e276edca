//! Transport capability seam and its WebRTC implementation
//!
//! The negotiation engine only ever talks to [`PeerTransport`] /
//! [`TransportFactory`]; the production implementation wraps the
//! `webrtc` crate, tests substitute an in-memory one. Transport-side
//! events (discovered candidates, channel open/close/message) are
//! posted into the engine's single-consumer queue rather than handled
//! in callbacks.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::engine::EngineEvent;
use super::types::{IceCandidate, PeerId, SessionDescription};
use crate::error::Result;

/// Events a transport handle posts into the engine queue
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local network path candidate was discovered for `peer`
    CandidateDiscovered {
        peer: PeerId,
        candidate: IceCandidate,
    },
    /// The data channel to `peer` opened
    ChannelOpen { peer: PeerId },
    /// The data channel to `peer` closed, or the transport tore down
    ChannelClosed { peer: PeerId },
    /// An application payload arrived from `peer`
    ChannelMessage { peer: PeerId, text: String },
}

/// One direct connection to a remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    /// Create the locally initiated data channel (Initiator side)
    async fn create_data_channel(&self, label: &str) -> Result<()>;
    /// Send an application payload over the open data channel
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates transport handles wired to the engine's event queue
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        peer: PeerId,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// Production transport over the `webrtc` crate
pub struct RtcTransport {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    events: mpsc::Sender<EngineEvent>,
}

pub struct RtcTransportFactory {
    stun_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn connect(
        &self,
        peer: PeerId,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let transport = RtcTransport {
            peer,
            pc,
            data_channel: Mutex::new(None),
            events,
        };
        transport.setup_handlers();

        Ok(Box::new(transport))
    }
}

impl RtcTransport {
    fn setup_handlers(&self) {
        // Discovered candidates go out through the engine so it can
        // address them to the right peer
        let peer = self.peer.clone();
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let peer = peer.clone();
                let events = events.clone();
                Box::pin(async move {
                    if let Some(c) = candidate {
                        if let Ok(init) = c.to_json() {
                            let event = EngineEvent::Transport(TransportEvent::CandidateDiscovered {
                                peer,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                },
                            });
                            let _ = events.send(event).await;
                        }
                    }
                })
            }));

        // Transport teardown without a channel close event still closes
        // the peer entry
        let peer = self.peer.clone();
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let peer = peer.clone();
                let events = events.clone();
                Box::pin(async move {
                    debug!("Peer {} connection state: {:?}", peer.short(), state);
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        let _ = events
                            .send(EngineEvent::Transport(TransportEvent::ChannelClosed { peer }))
                            .await;
                    }
                })
            }));

        // Responder side obtains the channel from the remote initiator
        let peer = self.peer.clone();
        let events = self.events.clone();
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                info!("Peer {} opened data channel '{}'", peer.short(), dc.label());
                wire_channel(&dc, peer, events);
            })
        }));
    }
}

/// Attach open/close/message handlers to a data channel, forwarding
/// each event into the engine queue
fn wire_channel(dc: &Arc<RTCDataChannel>, peer: PeerId, events: mpsc::Sender<EngineEvent>) {
    let p = peer.clone();
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = tx
                .send(EngineEvent::Transport(TransportEvent::ChannelOpen { peer: p }))
                .await;
        })
    }));

    let p = peer.clone();
    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let p = p.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx
                .send(EngineEvent::Transport(TransportEvent::ChannelClosed { peer: p }))
                .await;
        })
    }));

    let p = peer;
    let tx = events;
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let p = p.clone();
        let tx = tx.clone();
        Box::pin(async move {
            if let Ok(text) = String::from_utf8(msg.data.to_vec()) {
                let _ = tx
                    .send(EngineEvent::Transport(TransportEvent::ChannelMessage {
                        peer: p,
                        text,
                    }))
                    .await;
            }
        })
    }));
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let dc = self.pc.create_data_channel(label, None).await?;
        wire_channel(&dc, self.peer.clone(), self.events.clone());
        *self.data_channel.lock().await = Some(dc);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let guard = self.data_channel.lock().await;
        let dc = guard
            .as_ref()
            .ok_or_else(|| crate::MeshError::ChannelNotOpen(self.peer.clone()))?;
        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(dc) = self.data_channel.lock().await.take() {
            let _ = dc.close().await;
        }
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp.clone())?,
        _ => RTCSessionDescription::answer(desc.sdp.clone())?,
    };
    Ok(rtc)
}
