//! Negotiation engine: the per-peer connection-establishment state machine
//!
//! All relay frames and transport callbacks are funneled into one
//! single-consumer queue and handled sequentially here, so the
//! connection table needs no locking. The engine owns the table,
//! drives each peer pair through Connecting -> Open -> Closed, and
//! emits outbound signaling frames plus peer-list snapshots.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::identity::Identity;
use super::table::ConnectionTable;
use super::transport::{PeerTransport, TransportEvent, TransportFactory};
use super::types::{
    ClientFrame, IceCandidate, PeerId, PeerRole, PeerSnapshot, PeerStatus, RelayFrame,
    SessionDescription, DEFAULT_CHANNEL_LABEL,
};
use crate::error::Result;
use crate::MeshError;

/// Relay lifecycle and frames, as seen by the engine
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connected,
    Frame(RelayFrame),
    Disconnected,
}

/// Everything the engine reacts to, one task per event
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Relay(RelayEvent),
    Transport(TransportEvent),
    /// A Connecting entry outlived its negotiation window
    NegotiationTimeout { peer: PeerId, epoch: u64 },
    /// Application request to send a payload to an open peer
    SendText { peer: PeerId, text: String },
}

/// Tunables for the negotiation engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Label of the data channel the initiator creates
    pub channel_label: String,
    /// Client-role tag announced with `ready`
    pub role_tag: String,
    /// How long a peer may stay in Connecting before eviction
    pub negotiation_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            role_tag: "rust-client".to_string(),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

/// Cloneable handle for posting events into a running engine
#[derive(Clone)]
pub struct MeshHandle {
    events: mpsc::Sender<EngineEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MeshHandle {
    /// Send an application payload to `peer` over its open data channel
    pub async fn send_text(&self, peer: PeerId, text: impl Into<String>) -> Result<()> {
        self.post(EngineEvent::SendText {
            peer,
            text: text.into(),
        })
        .await
    }

    pub async fn post(&self, event: EngineEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| MeshError::EngineClosed)
    }

    /// Signal shutdown; the engine tears down every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The negotiation engine. Create once on startup, run until shutdown.
pub struct MeshEngine {
    settings: EngineSettings,
    factory: Arc<dyn TransportFactory>,
    identity: Identity,
    table: ConnectionTable,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
    outbound_tx: mpsc::Sender<ClientFrame>,
    outbound_rx: Option<mpsc::Receiver<ClientFrame>>,
    peers_tx: watch::Sender<Vec<PeerSnapshot>>,
    inbound_tx: broadcast::Sender<(PeerId, String)>,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    epoch: u64,
}

impl MeshEngine {
    pub fn new(settings: EngineSettings, factory: Arc<dyn TransportFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let (peers_tx, _) = watch::channel(Vec::new());
        let (inbound_tx, _) = broadcast::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            settings,
            factory,
            identity: Identity::new(),
            table: ConnectionTable::new(),
            events_tx,
            events_rx: Some(events_rx),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            peers_tx,
            inbound_tx,
            shutdown: Arc::new(shutdown),
            shutdown_rx,
            epoch: 0,
        }
    }

    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            events: self.events_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Sender the relay task (or a test harness) posts events through
    pub fn events_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.events_tx.clone()
    }

    /// Outbound signaling frames for the relay task. Taken once.
    pub fn take_outbound(&mut self) -> mpsc::Receiver<ClientFrame> {
        self.outbound_rx.take().expect("outbound_rx already taken")
    }

    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Ordered (peer, status) snapshots, re-published on every change
    pub fn peers(&self) -> watch::Receiver<Vec<PeerSnapshot>> {
        self.peers_tx.subscribe()
    }

    /// Inbound application payloads from open data channels
    pub fn messages(&self) -> broadcast::Receiver<(PeerId, String)> {
        self.inbound_tx.subscribe()
    }

    /// Run the event loop until shutdown. Consumes relay and transport
    /// events one at a time; this is the only place the table mutates.
    pub async fn run(&mut self) -> Result<()> {
        let mut events_rx = self.events_rx.take().expect("engine already running");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(event) = events_rx.recv() => {
                    self.dispatch(event).await;
                }
                else => break,
            }
        }

        info!("Mesh engine shutting down");
        self.teardown_table().await;
        Ok(())
    }

    async fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Relay(RelayEvent::Connected) => self.on_relay_connected().await,
            EngineEvent::Relay(RelayEvent::Disconnected) => {
                info!("Relay disconnected, tearing down all peers");
                self.teardown_table().await;
            }
            EngineEvent::Relay(RelayEvent::Frame(frame)) => self.on_relay_frame(frame).await,
            EngineEvent::Transport(event) => self.on_transport_event(event).await,
            EngineEvent::NegotiationTimeout { peer, epoch } => {
                self.on_negotiation_timeout(peer, epoch).await
            }
            EngineEvent::SendText { peer, text } => self.on_send_text(peer, text).await,
        }
    }

    /// Announce readiness with a fresh session identifier
    async fn on_relay_connected(&mut self) {
        let peer_id = self.identity.assign().clone();
        info!("Relay connected, announcing ready as {}", peer_id.short());
        self.send_frame(ClientFrame::Ready {
            peer_id,
            role: self.settings.role_tag.clone(),
        })
        .await;
    }

    async fn on_relay_frame(&mut self, frame: RelayFrame) {
        // Frames are only meaningful once we have announced ourselves
        let Some(self_id) = self.identity.get().cloned() else {
            debug!("Relay frame before ready, ignoring");
            return;
        };

        match frame {
            RelayFrame::Connection { peers } => {
                for peer in peers {
                    self.maybe_initiate(peer, &self_id).await;
                }
            }
            RelayFrame::Message { target, payload } => {
                if target != self_id {
                    debug!("Roster delta for {}, not us", target.short());
                    return;
                }
                for entry in payload.connections {
                    self.maybe_initiate(entry.peer_id, &self_id).await;
                }
            }
            RelayFrame::Offer { offer, from } => self.on_offer(from, offer, &self_id).await,
            RelayFrame::Answer { answer, from } => self.on_answer(from, answer).await,
            RelayFrame::IceCandidate { candidate, from } => self.on_candidate(from, candidate).await,
        }
    }

    /// Roster entry: initiate toward the peer unless we already hold an
    /// entry for it (duplicate roster events are a no-op)
    async fn maybe_initiate(&mut self, peer: PeerId, self_id: &PeerId) {
        if peer == *self_id {
            return;
        }
        if self.table.contains(&peer) {
            debug!("Already negotiating with {}, skipping", peer.short());
            return;
        }
        self.initiate(peer).await;
    }

    async fn initiate(&mut self, peer: PeerId) {
        info!("Initiating connection to {}", peer.short());

        let transport = match self
            .factory
            .connect(peer.clone(), self.events_tx.clone())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!("Transport creation for {} failed: {}", peer.short(), e);
                return;
            }
        };

        let offer = match self.negotiate_offer(&*transport).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Offer negotiation with {} failed: {}", peer.short(), e);
                let _ = transport.close().await;
                return;
            }
        };

        let (timeout, epoch) = self.arm_timeout(&peer);
        self.table
            .upsert_connecting(peer.clone(), PeerRole::Initiator, transport, timeout, epoch);
        self.send_frame(ClientFrame::Offer {
            target: peer,
            offer,
        })
        .await;
        self.publish();
    }

    async fn negotiate_offer(&self, transport: &dyn PeerTransport) -> Result<SessionDescription> {
        transport
            .create_data_channel(&self.settings.channel_label)
            .await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(&offer).await?;
        Ok(offer)
    }

    async fn on_offer(&mut self, from: PeerId, offer: SessionDescription, self_id: &PeerId) {
        match self.table.get(&from) {
            // Symmetric race: both sides offered at once. The lower id
            // initiates, so we yield and answer their offer instead.
            Some(entry)
                if entry.status == PeerStatus::Connecting
                    && entry.role == PeerRole::Initiator
                    && from < *self_id =>
            {
                info!("Offer glare with {}, yielding to lower id", from.short());
            }
            Some(_) => {
                debug!("Duplicate offer from {}, ignoring", from.short());
                return;
            }
            None => {}
        }
        if let Some(old) = self.table.remove(&from) {
            let _ = old.transport.close().await;
        }

        info!("Received offer from {}", from.short());

        let transport = match self
            .factory
            .connect(from.clone(), self.events_tx.clone())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!("Transport creation for {} failed: {}", from.short(), e);
                return;
            }
        };

        let answer = match self.negotiate_answer(&*transport, &offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Answer negotiation with {} failed: {}", from.short(), e);
                let _ = transport.close().await;
                return;
            }
        };

        let (timeout, epoch) = self.arm_timeout(&from);
        self.table
            .upsert_connecting(from.clone(), PeerRole::Responder, transport, timeout, epoch);
        self.send_frame(ClientFrame::Answer {
            target: from,
            answer,
        })
        .await;
        self.publish();
    }

    async fn negotiate_answer(
        &self,
        transport: &dyn PeerTransport,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(&answer).await?;
        Ok(answer)
    }

    async fn on_answer(&mut self, from: PeerId, answer: SessionDescription) {
        match self.table.get(&from) {
            Some(entry)
                if entry.role == PeerRole::Initiator && entry.status == PeerStatus::Connecting =>
            {
                if let Err(e) = entry.transport.set_remote_description(&answer).await {
                    warn!("Applying answer from {} failed: {}", from.short(), e);
                } else {
                    debug!("Applied answer from {}", from.short());
                }
            }
            Some(_) => debug!("Answer from {} in unexpected state, ignoring", from.short()),
            None => debug!("Answer from unknown peer {}, discarding", from.short()),
        }
    }

    async fn on_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        match self.table.get(&from) {
            Some(entry) => {
                if let Err(e) = entry.transport.add_ice_candidate(&candidate).await {
                    debug!("Failed to add candidate from {}: {}", from.short(), e);
                }
            }
            // Stale, or the candidate outran its offer on the relay
            None => debug!("Candidate from unknown peer {}, discarding", from.short()),
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::CandidateDiscovered { peer, candidate } => {
                if self.table.contains(&peer) {
                    self.send_frame(ClientFrame::IceCandidate {
                        target: peer,
                        candidate,
                    })
                    .await;
                } else {
                    debug!("Candidate for removed peer {}, dropping", peer.short());
                }
            }
            TransportEvent::ChannelOpen { peer } => {
                if self.table.set_status(&peer, PeerStatus::Open) {
                    info!("Data channel to {} open", peer.short());
                    self.publish();
                }
            }
            TransportEvent::ChannelClosed { peer } => {
                if self.table.set_status(&peer, PeerStatus::Closed) {
                    info!("Data channel to {} closed", peer.short());
                    self.publish();
                }
            }
            TransportEvent::ChannelMessage { peer, text } => {
                let _ = self.inbound_tx.send((peer, text));
            }
        }
    }

    /// Evict a peer that never left Connecting. The epoch guards
    /// against a timer firing for a since-replaced entry.
    async fn on_negotiation_timeout(&mut self, peer: PeerId, epoch: u64) {
        let stale = match self.table.get(&peer) {
            Some(entry) => entry.epoch != epoch || entry.status != PeerStatus::Connecting,
            None => true,
        };
        if stale {
            return;
        }
        warn!("Negotiation with {} timed out, evicting", peer.short());
        if let Some(entry) = self.table.remove(&peer) {
            let _ = entry.transport.close().await;
        }
        self.publish();
    }

    async fn on_send_text(&mut self, peer: PeerId, text: String) {
        match self.table.get(&peer) {
            Some(entry) if entry.status == PeerStatus::Open => {
                if let Err(e) = entry.transport.send_text(&text).await {
                    warn!("Sending to {} failed: {}", peer.short(), e);
                }
            }
            _ => warn!("No open channel to {}, dropping payload", peer.short()),
        }
    }

    fn arm_timeout(&mut self, peer: &PeerId) -> (Option<JoinHandle<()>>, u64) {
        self.epoch += 1;
        let epoch = self.epoch;
        let events = self.events_tx.clone();
        let peer = peer.clone();
        let delay = self.settings.negotiation_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(EngineEvent::NegotiationTimeout { peer, epoch })
                .await;
        });
        (Some(handle), epoch)
    }

    /// Close every transport handle, clear the table, return to the
    /// pre-ready state
    async fn teardown_table(&mut self) {
        for (peer, entry) in self.table.drain() {
            // Closing an already-dead handle fails silently
            if let Err(e) = entry.transport.close().await {
                debug!("Closing transport to {}: {}", peer.short(), e);
            }
        }
        self.identity.clear();
        self.publish();
    }

    async fn send_frame(&self, frame: ClientFrame) {
        if self.outbound_tx.send(frame).await.is_err() {
            debug!("Relay outbound channel closed, dropping frame");
        }
    }

    fn publish(&self) {
        self.peers_tx.send_replace(self.table.snapshot());
    }
}
