//! Connection table: the authoritative map of per-peer negotiation state
//!
//! Owned exclusively by the negotiation engine; the single-consumer
//! event loop provides mutual exclusion, so there is no lock here.

use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use super::transport::PeerTransport;
use super::types::{PeerId, PeerRole, PeerSnapshot, PeerStatus};

/// Negotiation state for one remote peer
pub struct PeerEntry {
    pub role: PeerRole,
    pub status: PeerStatus,
    /// Exclusively owned for the lifetime of the entry; the data
    /// channel lives and dies with it
    pub transport: Box<dyn PeerTransport>,
    /// Armed while Connecting, disarmed on reaching Open
    pub timeout: Option<JoinHandle<()>>,
    /// Guards late timeout events against a re-created entry
    pub epoch: u64,
}

impl PeerEntry {
    pub fn disarm_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

/// Map from peer identifier to negotiation state, in insertion order.
///
/// Insertion order is kept so the projected peer list does not
/// reshuffle on unrelated updates.
#[derive(Default)]
pub struct ConnectionTable {
    entries: HashMap<PeerId, PeerEntry>,
    order: Vec<PeerId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `peer` with a fresh Connecting
    /// state. The caller closes any previous transport handle first.
    pub fn upsert_connecting(
        &mut self,
        peer: PeerId,
        role: PeerRole,
        transport: Box<dyn PeerTransport>,
        timeout: Option<JoinHandle<()>>,
        epoch: u64,
    ) {
        let entry = PeerEntry {
            role,
            status: PeerStatus::Connecting,
            transport,
            timeout,
            epoch,
        };
        if self.entries.insert(peer.clone(), entry).is_none() {
            self.order.push(peer);
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.entries.get(peer)
    }

    /// Update a peer's status, respecting the forward-only transition
    /// invariant (Connecting -> Open -> Closed). Late or duplicate
    /// events are discarded; unknown peers are a no-op. Returns whether
    /// the status actually changed.
    pub fn set_status(&mut self, peer: &PeerId, status: PeerStatus) -> bool {
        let Some(entry) = self.entries.get_mut(peer) else {
            debug!("Status {} for unknown peer {}, ignoring", status, peer.short());
            return false;
        };
        let allowed = matches!(
            (entry.status, status),
            (PeerStatus::Connecting, PeerStatus::Open)
                | (PeerStatus::Connecting, PeerStatus::Closed)
                | (PeerStatus::Open, PeerStatus::Closed)
        );
        if !allowed {
            if entry.status != status {
                debug!(
                    "Discarding {} -> {} for peer {}",
                    entry.status,
                    status,
                    peer.short()
                );
            }
            return false;
        }
        entry.status = status;
        if status != PeerStatus::Connecting {
            entry.disarm_timeout();
        }
        true
    }

    /// Remove a peer's entry. The caller closes the returned transport.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerEntry> {
        let mut entry = self.entries.remove(peer)?;
        entry.disarm_timeout();
        self.order.retain(|p| p != peer);
        Some(entry)
    }

    /// Drain every entry, in insertion order. Used on relay disconnect
    /// and shutdown; the caller closes each transport.
    pub fn drain(&mut self) -> Vec<(PeerId, PeerEntry)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|peer| {
                self.entries.remove(&peer).map(|mut entry| {
                    entry.disarm_timeout();
                    (peer, entry)
                })
            })
            .collect()
    }

    /// Project the externally observable peer list, in insertion order.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.order
            .iter()
            .filter_map(|peer| {
                self.entries.get(peer).map(|entry| PeerSnapshot {
                    peer_id: peer.clone(),
                    status: entry.status,
                    role: entry.role,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
