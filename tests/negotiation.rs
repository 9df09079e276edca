//! Negotiation engine tests against an in-memory transport
//!
//! Drives the engine with synthetic relay frames and transport events
//! and checks the connection table projections converge as expected.

use async_trait::async_trait;
use meshlink::mesh::{
    ClientFrame, EngineEvent, EngineSettings, IceCandidate, MeshEngine, MeshHandle, PeerId,
    PeerRole, PeerSnapshot, PeerStatus, PeerTransport, RelayEvent, RelayFrame, RosterEntry,
    RosterPayload, SessionDescription, TransportEvent, TransportFactory,
};
use meshlink::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct MockTransport {
    peer: PeerId,
    closed: Arc<Mutex<Vec<PeerId>>>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("mock-sdp"))
    }
    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("mock-sdp"))
    }
    async fn set_local_description(&self, _desc: &SessionDescription) -> Result<()> {
        Ok(())
    }
    async fn set_remote_description(&self, _desc: &SessionDescription) -> Result<()> {
        Ok(())
    }
    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        Ok(())
    }
    async fn create_data_channel(&self, _label: &str) -> Result<()> {
        Ok(())
    }
    async fn send_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.closed.lock().unwrap().push(self.peer.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    created: Mutex<Vec<PeerId>>,
    closed: Arc<Mutex<Vec<PeerId>>>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(
        &self,
        peer: PeerId,
        _events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        self.created.lock().unwrap().push(peer.clone());
        Ok(Box::new(MockTransport {
            peer,
            closed: self.closed.clone(),
        }))
    }
}

struct FailingFactory;

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn connect(
        &self,
        _peer: PeerId,
        _events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        Err(meshlink::MeshError::ChannelNotOpen(PeerId::from("mock")))
    }
}

struct Harness {
    handle: MeshHandle,
    outbound: mpsc::Receiver<ClientFrame>,
    peers: watch::Receiver<Vec<PeerSnapshot>>,
    factory: Arc<MockFactory>,
}

fn spawn_engine(timeout: Duration) -> Harness {
    let factory = Arc::new(MockFactory::default());
    let settings = EngineSettings {
        negotiation_timeout: timeout,
        ..Default::default()
    };
    let mut engine = MeshEngine::new(settings, factory.clone());
    let handle = engine.handle();
    let outbound = engine.take_outbound();
    let peers = engine.peers();
    tokio::spawn(async move { engine.run().await });
    Harness {
        handle,
        outbound,
        peers,
        factory,
    }
}

async fn connect_relay(h: &mut Harness) -> PeerId {
    h.handle
        .post(EngineEvent::Relay(RelayEvent::Connected))
        .await
        .unwrap();
    match next_frame(h).await {
        ClientFrame::Ready { peer_id, .. } => peer_id,
        other => panic!("Expected ready frame, got {:?}", other),
    }
}

async fn next_frame(h: &mut Harness) -> ClientFrame {
    tokio::time::timeout(Duration::from_secs(1), h.outbound.recv())
        .await
        .expect("Timed out waiting for outbound frame")
        .expect("Outbound channel closed")
}

async fn assert_no_frame(h: &mut Harness) {
    let res = tokio::time::timeout(Duration::from_millis(200), h.outbound.recv()).await;
    assert!(res.is_err(), "Expected no outbound frame, got {:?}", res);
}

/// Poll the projector until `pred` holds or a second passes
async fn wait_for_peers<F>(h: &Harness, pred: F) -> Vec<PeerSnapshot>
where
    F: Fn(&[PeerSnapshot]) -> bool,
{
    for _ in 0..100 {
        let snapshot = h.peers.borrow().clone();
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Projection never converged: {:?}", h.peers.borrow().clone());
}

fn roster(peers: &[&str]) -> EngineEvent {
    EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Connection {
        peers: peers.iter().map(|p| PeerId::from(*p)).collect(),
    }))
}

fn offer_from(peer: &str) -> EngineEvent {
    EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Offer {
        offer: SessionDescription::offer("remote-sdp"),
        from: PeerId::from(peer),
    }))
}

fn host_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[tokio::test]
async fn test_roster_triggers_initiation() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();

    match next_frame(&mut h).await {
        ClientFrame::Offer { target, offer } => {
            assert_eq!(target, PeerId::from("peer-a"));
            assert_eq!(offer.kind, "offer");
        }
        other => panic!("Expected offer frame, got {:?}", other),
    }

    let snapshot = wait_for_peers(&h, |p| p.len() == 1).await;
    assert_eq!(snapshot[0].peer_id, PeerId::from("peer-a"));
    assert_eq!(snapshot[0].status, PeerStatus::Connecting);
    assert_eq!(snapshot[0].role, PeerRole::Initiator);
    assert_eq!(h.factory.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_roster_is_idempotent() {
    let mut h = spawn_engine(Duration::from_secs(30));
    let self_id = connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a", "peer-a"])).await.unwrap();
    h.handle.post(roster(&["peer-a"])).await.unwrap();
    h.handle
        .post(EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Message {
            target: self_id,
            payload: RosterPayload {
                connections: vec![RosterEntry {
                    peer_id: PeerId::from("peer-a"),
                }],
            },
        })))
        .await
        .unwrap();

    // Exactly one offer, one transport handle
    assert!(matches!(next_frame(&mut h).await, ClientFrame::Offer { .. }));
    assert_no_frame(&mut h).await;
    assert_eq!(h.factory.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_roster_delta_for_other_target_ignored() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle
        .post(EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Message {
            target: PeerId::from("somebody-else"),
            payload: RosterPayload {
                connections: vec![RosterEntry {
                    peer_id: PeerId::from("peer-a"),
                }],
            },
        })))
        .await
        .unwrap();

    assert_no_frame(&mut h).await;
    assert!(h.peers.borrow().is_empty());
}

#[tokio::test]
async fn test_inbound_offer_answered_as_responder() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle.post(offer_from("peer-b")).await.unwrap();

    match next_frame(&mut h).await {
        ClientFrame::Answer { target, answer } => {
            assert_eq!(target, PeerId::from("peer-b"));
            assert_eq!(answer.kind, "answer");
        }
        other => panic!("Expected answer frame, got {:?}", other),
    }

    let snapshot = wait_for_peers(&h, |p| p.len() == 1).await;
    assert_eq!(snapshot[0].status, PeerStatus::Connecting);
    assert_eq!(snapshot[0].role, PeerRole::Responder);
}

#[tokio::test]
async fn test_duplicate_offer_keeps_single_entry() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle.post(offer_from("peer-b")).await.unwrap();
    h.handle.post(offer_from("peer-b")).await.unwrap();

    assert!(matches!(next_frame(&mut h).await, ClientFrame::Answer { .. }));
    assert_no_frame(&mut h).await;

    let snapshot = wait_for_peers(&h, |p| p.len() == 1).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(h.factory.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_candidate_for_unknown_peer_discarded() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle
        .post(EngineEvent::Relay(RelayEvent::Frame(
            RelayFrame::IceCandidate {
                candidate: host_candidate(),
                from: PeerId::from("stranger"),
            },
        )))
        .await
        .unwrap();

    assert_no_frame(&mut h).await;
    assert!(h.peers.borrow().is_empty());

    // Engine is still responsive afterwards
    h.handle.post(roster(&["peer-a"])).await.unwrap();
    assert!(matches!(next_frame(&mut h).await, ClientFrame::Offer { .. }));
}

#[tokio::test]
async fn test_stale_answer_discarded() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle
        .post(EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Answer {
            answer: SessionDescription::answer("late"),
            from: PeerId::from("stranger"),
        })))
        .await
        .unwrap();

    assert_no_frame(&mut h).await;
    assert!(h.peers.borrow().is_empty());
}

#[tokio::test]
async fn test_channel_open_marks_peer_open() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();
    next_frame(&mut h).await;

    h.handle
        .post(EngineEvent::Transport(TransportEvent::ChannelOpen {
            peer: PeerId::from("peer-a"),
        }))
        .await
        .unwrap();

    let snapshot = wait_for_peers(&h, |p| p.iter().any(|e| e.status == PeerStatus::Open)).await;
    assert_eq!(snapshot[0].peer_id, PeerId::from("peer-a"));
}

#[tokio::test]
async fn test_closed_is_terminal() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();
    next_frame(&mut h).await;

    let peer = PeerId::from("peer-a");
    h.handle
        .post(EngineEvent::Transport(TransportEvent::ChannelOpen {
            peer: peer.clone(),
        }))
        .await
        .unwrap();
    h.handle
        .post(EngineEvent::Transport(TransportEvent::ChannelClosed {
            peer: peer.clone(),
        }))
        .await
        .unwrap();
    // A late open event after close must not resurrect the peer
    h.handle
        .post(EngineEvent::Transport(TransportEvent::ChannelOpen { peer }))
        .await
        .unwrap();

    let snapshot = wait_for_peers(&h, |p| p.iter().any(|e| e.status == PeerStatus::Closed)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(snapshot[0].status, PeerStatus::Closed);
    assert_eq!(h.peers.borrow()[0].status, PeerStatus::Closed);
}

#[tokio::test]
async fn test_discovered_candidate_forwarded_to_relay() {
    let mut h = spawn_engine(Duration::from_secs(30));
    connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();
    next_frame(&mut h).await;

    h.handle
        .post(EngineEvent::Transport(TransportEvent::CandidateDiscovered {
            peer: PeerId::from("peer-a"),
            candidate: host_candidate(),
        }))
        .await
        .unwrap();

    match next_frame(&mut h).await {
        ClientFrame::IceCandidate { target, .. } => {
            assert_eq!(target, PeerId::from("peer-a"));
        }
        other => panic!("Expected candidate frame, got {:?}", other),
    }

    // Candidates for peers no longer in the table are dropped
    h.handle
        .post(EngineEvent::Transport(TransportEvent::CandidateDiscovered {
            peer: PeerId::from("stranger"),
            candidate: host_candidate(),
        }))
        .await
        .unwrap();
    assert_no_frame(&mut h).await;
}

#[tokio::test]
async fn test_relay_disconnect_tears_down_everything() {
    let mut h = spawn_engine(Duration::from_secs(30));
    let first_id = connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();
    next_frame(&mut h).await;
    h.handle.post(offer_from("peer-b")).await.unwrap();
    next_frame(&mut h).await;
    h.handle
        .post(EngineEvent::Transport(TransportEvent::ChannelOpen {
            peer: PeerId::from("peer-a"),
        }))
        .await
        .unwrap();
    wait_for_peers(&h, |p| p.len() == 2).await;

    h.handle
        .post(EngineEvent::Relay(RelayEvent::Disconnected))
        .await
        .unwrap();

    wait_for_peers(&h, |p| p.is_empty()).await;
    {
        let closed = h.factory.closed.lock().unwrap();
        assert!(closed.contains(&PeerId::from("peer-a")));
        assert!(closed.contains(&PeerId::from("peer-b")));
    }

    // Reconnect re-runs the identity manager with a fresh id
    let second_id = connect_relay(&mut h).await;
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_offer_glare_yields_to_lower_id() {
    let mut h = spawn_engine(Duration::from_secs(30));
    // Our id is a UUID (hex digits), so "0" sorts below it and "zzzz"
    // sorts above it
    connect_relay(&mut h).await;

    h.handle.post(roster(&["0", "zzzz"])).await.unwrap();
    assert!(matches!(next_frame(&mut h).await, ClientFrame::Offer { .. }));
    assert!(matches!(next_frame(&mut h).await, ClientFrame::Offer { .. }));

    // The lower id's offer wins: our half-open attempt is replaced
    h.handle.post(offer_from("0")).await.unwrap();
    match next_frame(&mut h).await {
        ClientFrame::Answer { target, .. } => assert_eq!(target, PeerId::from("0")),
        other => panic!("Expected answer frame, got {:?}", other),
    }
    let snapshot = wait_for_peers(&h, |p| {
        p.iter()
            .any(|e| e.peer_id == PeerId::from("0") && e.role == PeerRole::Responder)
    })
    .await;
    assert_eq!(snapshot.len(), 2);
    assert!(h
        .factory
        .closed
        .lock()
        .unwrap()
        .contains(&PeerId::from("0")));

    // The higher id must yield instead: its offer is discarded
    h.handle.post(offer_from("zzzz")).await.unwrap();
    assert_no_frame(&mut h).await;
    let snapshot = h.peers.borrow().clone();
    let high = snapshot
        .iter()
        .find(|e| e.peer_id == PeerId::from("zzzz"))
        .unwrap();
    assert_eq!(high.role, PeerRole::Initiator);
}

#[tokio::test]
async fn test_negotiation_timeout_evicts_entry() {
    let mut h = spawn_engine(Duration::from_millis(50));
    connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();
    next_frame(&mut h).await;
    wait_for_peers(&h, |p| p.len() == 1).await;

    wait_for_peers(&h, |p| p.is_empty()).await;
    assert!(h
        .factory
        .closed
        .lock()
        .unwrap()
        .contains(&PeerId::from("peer-a")));
}

#[tokio::test]
async fn test_open_disarms_negotiation_timeout() {
    let mut h = spawn_engine(Duration::from_millis(100));
    connect_relay(&mut h).await;

    h.handle.post(roster(&["peer-a"])).await.unwrap();
    next_frame(&mut h).await;
    h.handle
        .post(EngineEvent::Transport(TransportEvent::ChannelOpen {
            peer: PeerId::from("peer-a"),
        }))
        .await
        .unwrap();
    wait_for_peers(&h, |p| p.iter().any(|e| e.status == PeerStatus::Open)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = h.peers.borrow().clone();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, PeerStatus::Open);
}

#[tokio::test]
async fn test_transport_failure_is_contained() {
    let settings = EngineSettings::default();
    let mut engine = MeshEngine::new(settings, Arc::new(FailingFactory));
    let handle = engine.handle();
    let mut outbound = engine.take_outbound();
    let peers = engine.peers();
    tokio::spawn(async move { engine.run().await });

    handle
        .post(EngineEvent::Relay(RelayEvent::Connected))
        .await
        .unwrap();
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap(),
        ClientFrame::Ready { .. }
    ));

    handle
        .post(EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Connection {
            peers: vec![PeerId::from("peer-a")],
        })))
        .await
        .unwrap();
    handle
        .post(EngineEvent::Relay(RelayEvent::Frame(RelayFrame::Offer {
            offer: SessionDescription::offer("remote-sdp"),
            from: PeerId::from("peer-b"),
        })))
        .await
        .unwrap();

    // No entries, no outbound signaling, engine still alive
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(peers.borrow().is_empty());
    assert!(outbound.try_recv().is_err());
    handle.shutdown();
}
